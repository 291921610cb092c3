//! One reconciliation pass over active steps.

use std::sync::Arc;
use std::time::Duration;

use hackload_id::StepId;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::k6::OrchestrationClient;
use crate::model::{RunStatus, StaleStats, StepStatus, StepUpdate, TestRunStep};

use super::{StepStore, SyncError};

/// Tunables for a reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How many trailing log lines to capture per container.
    pub log_tail_lines: i64,
    /// A reconcilable step unchecked for longer than this counts as stale.
    pub stale_after: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            log_tail_lines: 1000,
            stale_after: Duration::from_secs(60),
        }
    }
}

/// What happened to one step during a pass.
#[derive(Debug, Clone, Serialize)]
pub struct StepSyncResult {
    pub step_id: StepId,
    pub step_name: String,
    pub external_job_name: String,
    pub old_status: StepStatus,
    pub new_status: StepStatus,
    pub updated: bool,
    pub logs_updated: bool,
    /// Transient lookup failure; the step was left untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate outcome of a pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub steps_examined: usize,
    pub steps_updated: usize,
    pub steps_errored: usize,
    pub logs_updated: usize,
    pub results: Vec<StepSyncResult>,
}

/// Reconciles persisted step state against the orchestration platform.
///
/// A pass never aborts on a single step: phase lookups and log fetches
/// fail per step, and a transient failure leaves that step byte-for-byte
/// untouched so the next pass retries it from the same state.
pub struct StepReconciler {
    steps: Arc<dyn StepStore>,
    client: Arc<dyn OrchestrationClient>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
}

impl StepReconciler {
    pub fn new(
        steps: Arc<dyn StepStore>,
        client: Arc<dyn OrchestrationClient>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            steps,
            client,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one full pass: reconcile every eligible step, then roll run
    /// statuses up from their steps.
    pub async fn run_pass(&self) -> Result<SyncSummary, SyncError> {
        let steps = self.steps.list_reconcilable().await?;
        let mut summary = SyncSummary {
            steps_examined: steps.len(),
            ..SyncSummary::default()
        };

        for step in steps {
            let result = self.reconcile_step(&step).await;
            if result.updated {
                summary.steps_updated += 1;
            }
            if result.logs_updated {
                summary.logs_updated += 1;
            }
            if result.error.is_some() {
                summary.steps_errored += 1;
            }
            summary.results.push(result);
        }

        self.roll_up_runs().await?;

        if summary.steps_updated > 0 || summary.steps_errored > 0 {
            info!(
                examined = summary.steps_examined,
                updated = summary.steps_updated,
                errored = summary.steps_errored,
                logs = summary.logs_updated,
                "Step sync pass complete"
            );
        } else {
            debug!(examined = summary.steps_examined, "Step sync pass complete");
        }

        Ok(summary)
    }

    /// Reconcile one step. Storage errors abort the pass; platform errors
    /// are contained here and reported in the result.
    async fn reconcile_step(&self, step: &TestRunStep) -> StepSyncResult {
        // list_reconcilable guarantees the job name is present.
        let job_name = step.external_job_name.clone().unwrap_or_default();
        let mut result = StepSyncResult {
            step_id: step.id,
            step_name: step.step_name.clone(),
            external_job_name: job_name.clone(),
            old_status: step.status,
            new_status: step.status,
            updated: false,
            logs_updated: false,
            error: None,
        };

        let now = self.clock.now();
        let report = match self.client.get_job_phase(&job_name).await {
            Ok(report) => report,
            Err(e) if e.is_not_found() => {
                // The job vanished without a terminal phase. Close the
                // step out; it will never be examined again.
                let update = StepUpdate {
                    status: Some(StepStatus::Deleted),
                    completed_at: Some(now),
                    ..StepUpdate::checked_at(step.id, now)
                };
                match self.steps.apply_update(&update).await {
                    Ok(()) => {
                        info!(step_id = %step.id, job = %job_name, "Job no longer exists, step marked deleted");
                        result.new_status = StepStatus::Deleted;
                        result.updated = true;
                    }
                    Err(e) => result.error = Some(e.to_string()),
                }
                return result;
            }
            Err(e) => {
                // Transient: do not even stamp last_status_check, so the
                // staleness signal reflects real contact with the platform.
                warn!(step_id = %step.id, job = %job_name, error = %e, "Status check failed");
                result.error = Some(e.to_string());
                return result;
            }
        };

        let new_status = report.phase.step_status();
        let changed = new_status != step.status;

        let mut update = StepUpdate::checked_at(step.id, now);
        if changed {
            update.status = Some(new_status);
            if new_status == StepStatus::Running {
                update.started_at = Some(now);
            }
            if new_status.is_terminal() {
                // A step that skipped the observed-running window still
                // gets a start mark.
                update.started_at = Some(now);
                update.completed_at = Some(now);
            }
            if new_status == StepStatus::Failed {
                update.error_message =
                    Some(report.detail.unwrap_or_else(|| "test run failed".to_string()));
            }
        }

        // Capture logs while running and once more on the terminal
        // transition. Best effort: a failed fetch keeps whatever was
        // captured before.
        if new_status == StepStatus::Running || (changed && new_status.is_terminal()) {
            match self.client.get_logs(&job_name, self.config.log_tail_lines).await {
                Ok(Some(logs)) => {
                    update.container_logs = Some(logs);
                    result.logs_updated = true;
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(step_id = %step.id, job = %job_name, error = %e, "Log fetch failed");
                }
            }
        }

        match self.steps.apply_update(&update).await {
            Ok(()) => {
                if changed {
                    info!(
                        step_id = %step.id,
                        job = %job_name,
                        from = %step.status,
                        to = %new_status,
                        "Step status updated"
                    );
                    result.new_status = new_status;
                    result.updated = true;
                }
            }
            Err(e) => {
                result.logs_updated = false;
                result.error = Some(e.to_string());
            }
        }

        result
    }

    /// Derive each active run's status from its steps and persist any
    /// transition. A write failure skips that run, like a step failure
    /// skips its step; the next pass re-derives it from scratch.
    async fn roll_up_runs(&self) -> Result<(), SyncError> {
        let now = self.clock.now();
        let mut errored = 0usize;
        for rollup in self.steps.list_active_run_rollups().await? {
            let Some(derived) = derive_run_status(&rollup.step_statuses) else {
                continue;
            };
            if derived == rollup.status {
                continue;
            }
            match self.steps.transition_run(&rollup.run_id, derived, now).await {
                Ok(()) => {
                    info!(run_id = %rollup.run_id, from = %rollup.status, to = %derived, "Run status updated");
                }
                Err(e) => {
                    warn!(run_id = %rollup.run_id, error = %e, "Run status update failed");
                    errored += 1;
                }
            }
        }
        if errored > 0 {
            warn!(errored, "Run roll-up left some runs for the next pass");
        }
        Ok(())
    }

    /// Staleness counters for the operator surface.
    pub async fn stale_stats(&self) -> Result<StaleStats, SyncError> {
        let cutoff = self.clock.now()
            - chrono::Duration::from_std(self.config.stale_after)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        Ok(self.steps.stale_stats(cutoff).await?)
    }
}

/// Roll step statuses up to a run status. `None` means no opinion (for
/// example a run with no steps yet).
fn derive_run_status(steps: &[StepStatus]) -> Option<RunStatus> {
    if steps.is_empty() {
        return None;
    }

    if steps.iter().all(|s| s.is_terminal()) {
        if steps.iter().any(|s| matches!(s, StepStatus::Failed | StepStatus::Deleted)) {
            return Some(RunStatus::Failed);
        }
        if steps.iter().any(|s| matches!(s, StepStatus::Cancelled)) {
            return Some(RunStatus::Cancelled);
        }
        return Some(RunStatus::Completed);
    }

    if steps.iter().any(|s| matches!(s, StepStatus::Running)) {
        return Some(RunStatus::Running);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k6::{JobPhase, OrchestrationError, PhaseReport};
    use crate::testing::{step_fixture, InMemoryStepStore, ManualClock, ScriptedClient};
    use hackload_id::RunId;

    fn reconciler(
        store: &Arc<InMemoryStepStore>,
        client: &Arc<ScriptedClient>,
        clock: &Arc<ManualClock>,
    ) -> StepReconciler {
        StepReconciler::new(
            store.clone(),
            client.clone(),
            clock.clone(),
            ReconcilerConfig::default(),
        )
    }

    #[tokio::test]
    async fn running_step_reaches_succeeded_over_two_passes() {
        let store = Arc::new(InMemoryStepStore::default());
        let client = Arc::new(ScriptedClient::default());
        let clock = Arc::new(ManualClock::default());

        let run = RunId::new();
        store.insert_run(run, RunStatus::Pending, clock.now());
        let step = step_fixture(&run, 0, Some("job-1"), StepStatus::Pending, clock.now());
        let step_id = step.id;
        store.insert_step(step);

        client.push_phase("job-1", Ok(PhaseReport::new(JobPhase::Running)));
        client.push_phase("job-1", Ok(PhaseReport::new(JobPhase::Succeeded)));
        client.set_logs("job-1", "=== Container: pod ===\noutput");

        let r = reconciler(&store, &client, &clock);

        let summary = r.run_pass().await.unwrap();
        assert_eq!(summary.steps_updated, 1);
        let stored = store.step(&step_id);
        assert_eq!(stored.status, StepStatus::Running);
        let started = stored.started_at.expect("started_at set on RUNNING");
        assert!(stored.completed_at.is_none());
        assert_eq!(store.run_status(&run), RunStatus::Running);

        clock.advance(Duration::from_secs(20));
        let summary = r.run_pass().await.unwrap();
        assert_eq!(summary.steps_updated, 1);
        let stored = store.step(&step_id);
        assert_eq!(stored.status, StepStatus::Succeeded);
        assert_eq!(stored.started_at, Some(started), "started_at is set once");
        assert!(stored.completed_at.is_some());
        assert!(stored.container_logs.unwrap().contains("output"));
        assert_eq!(store.run_status(&run), RunStatus::Completed);
    }

    #[tokio::test]
    async fn terminal_steps_are_never_reconciled_again() {
        let store = Arc::new(InMemoryStepStore::default());
        let client = Arc::new(ScriptedClient::default());
        let clock = Arc::new(ManualClock::default());

        let run = RunId::new();
        store.insert_run(run, RunStatus::Completed, clock.now());
        let mut step = step_fixture(&run, 0, Some("done-job"), StepStatus::Succeeded, clock.now());
        step.completed_at = Some(clock.now());
        store.insert_step(step);

        let r = reconciler(&store, &client, &clock);
        let summary = r.run_pass().await.unwrap();

        assert_eq!(summary.steps_examined, 0);
        assert_eq!(client.phase_calls("done-job"), 0);
    }

    #[tokio::test]
    async fn vanished_job_is_marked_deleted_exactly_once() {
        let store = Arc::new(InMemoryStepStore::default());
        let client = Arc::new(ScriptedClient::default());
        let clock = Arc::new(ManualClock::default());

        let run = RunId::new();
        store.insert_run(run, RunStatus::Running, clock.now());
        let step = step_fixture(&run, 0, Some("gone-job"), StepStatus::Running, clock.now());
        let step_id = step.id;
        store.insert_step(step);

        client.push_phase("gone-job", Err(OrchestrationError::NotFound("gone-job".into())));

        let r = reconciler(&store, &client, &clock);
        r.run_pass().await.unwrap();

        let stored = store.step(&step_id);
        assert_eq!(stored.status, StepStatus::Deleted);
        assert!(stored.completed_at.is_some());
        assert!(stored.error_message.is_none(), "deletion is not a failure");
        assert_eq!(store.run_status(&run), RunStatus::Failed);

        // Second pass must not touch the platform for this step again.
        r.run_pass().await.unwrap();
        assert_eq!(client.phase_calls("gone-job"), 1);
    }

    #[tokio::test]
    async fn transient_failure_isolates_one_step_and_leaves_it_untouched() {
        let store = Arc::new(InMemoryStepStore::default());
        let client = Arc::new(ScriptedClient::default());
        let clock = Arc::new(ManualClock::default());

        let run = RunId::new();
        store.insert_run(run, RunStatus::Running, clock.now());
        let ids: Vec<_> = (0..3)
            .map(|i| {
                let job = format!("job-{i}");
                let step = step_fixture(&run, i, Some(job.as_str()), StepStatus::Running, clock.now());
                let id = step.id;
                store.insert_step(step);
                id
            })
            .collect();

        client.push_phase("job-0", Ok(PhaseReport::new(JobPhase::Succeeded)));
        client.push_phase("job-1", Err(OrchestrationError::Timeout));
        client.push_phase("job-2", Ok(PhaseReport::new(JobPhase::Succeeded)));

        let r = reconciler(&store, &client, &clock);
        let summary = r.run_pass().await.unwrap();

        assert_eq!(summary.steps_examined, 3);
        assert_eq!(summary.steps_updated, 2);
        assert_eq!(summary.steps_errored, 1);

        assert_eq!(store.step(&ids[0]).status, StepStatus::Succeeded);
        assert_eq!(store.step(&ids[2]).status, StepStatus::Succeeded);

        let untouched = store.step(&ids[1]);
        assert_eq!(untouched.status, StepStatus::Running);
        assert!(
            untouched.last_status_check.is_none(),
            "failed check must not count as contact"
        );
        // One step still running, so the run stays running.
        assert_eq!(store.run_status(&run), RunStatus::Running);
    }

    #[tokio::test]
    async fn stale_write_cannot_demote_a_terminal_step() {
        let store = Arc::new(InMemoryStepStore::default());
        let clock = Arc::new(ManualClock::default());

        let run = RunId::new();
        store.insert_run(run, RunStatus::Completed, clock.now());
        let mut step = step_fixture(&run, 0, Some("raced-job"), StepStatus::Succeeded, clock.now());
        step.completed_at = Some(clock.now());
        let step_id = step.id;
        store.insert_step(step);

        // A concurrent pass read this step while it was still running and
        // now lands its write after the terminal transition.
        let stale = StepUpdate {
            status: Some(StepStatus::Running),
            started_at: Some(clock.now()),
            ..StepUpdate::checked_at(step_id, clock.now())
        };
        store.apply_update(&stale).await.unwrap();

        let stored = store.step(&step_id);
        assert_eq!(stored.status, StepStatus::Succeeded);
        assert!(stored.completed_at.is_some());
        assert!(
            stored.last_status_check.is_none(),
            "a rejected write leaves the row untouched"
        );
    }

    #[tokio::test]
    async fn run_rollup_failure_skips_that_run_and_keeps_the_summary() {
        let store = Arc::new(InMemoryStepStore::default());
        let client = Arc::new(ScriptedClient::default());
        let clock = Arc::new(ManualClock::default());

        let broken_run = RunId::new();
        store.insert_run(broken_run, RunStatus::Running, clock.now());
        store.insert_step(step_fixture(&broken_run, 0, Some("job-a"), StepStatus::Running, clock.now()));
        store.fail_run_transitions(broken_run);

        let healthy_run = RunId::new();
        store.insert_run(healthy_run, RunStatus::Running, clock.now() + chrono::Duration::seconds(1));
        store.insert_step(step_fixture(&healthy_run, 0, Some("job-b"), StepStatus::Running, clock.now()));

        client.push_phase("job-a", Ok(PhaseReport::new(JobPhase::Succeeded)));
        client.push_phase("job-b", Ok(PhaseReport::new(JobPhase::Succeeded)));

        let r = reconciler(&store, &client, &clock);
        let summary = r.run_pass().await.unwrap();

        assert_eq!(summary.steps_updated, 2, "step results survive a roll-up failure");
        assert_eq!(store.run_status(&healthy_run), RunStatus::Completed);
        assert_eq!(store.run_status(&broken_run), RunStatus::Running);
    }

    #[tokio::test]
    async fn failed_phase_records_error_detail() {
        let store = Arc::new(InMemoryStepStore::default());
        let client = Arc::new(ScriptedClient::default());
        let clock = Arc::new(ManualClock::default());

        let run = RunId::new();
        store.insert_run(run, RunStatus::Running, clock.now());
        let step = step_fixture(&run, 0, Some("bad-job"), StepStatus::Running, clock.now());
        let step_id = step.id;
        store.insert_step(step);

        client.push_phase(
            "bad-job",
            Ok(PhaseReport {
                phase: JobPhase::Failed,
                detail: Some("runner pod bad-job-x finished in phase Failed".into()),
            }),
        );

        let r = reconciler(&store, &client, &clock);
        r.run_pass().await.unwrap();

        let stored = store.step(&step_id);
        assert_eq!(stored.status, StepStatus::Failed);
        assert!(stored.error_message.unwrap().contains("bad-job-x"));
        assert_eq!(store.run_status(&run), RunStatus::Failed);
    }

    #[tokio::test]
    async fn stale_stats_count_steps_unchecked_past_threshold() {
        let store = Arc::new(InMemoryStepStore::default());
        let client = Arc::new(ScriptedClient::default());
        let clock = Arc::new(ManualClock::default());

        let run = RunId::new();
        store.insert_run(run, RunStatus::Running, clock.now());

        // Checked 90s ago: stale with a 60s threshold.
        let mut stale = step_fixture(&run, 0, Some("job-a"), StepStatus::Running, clock.now());
        stale.last_status_check = Some(clock.now() - chrono::Duration::seconds(90));
        store.insert_step(stale);

        // Checked 10s ago: fresh.
        let mut fresh = step_fixture(&run, 1, Some("job-b"), StepStatus::Running, clock.now());
        fresh.last_status_check = Some(clock.now() - chrono::Duration::seconds(10));
        store.insert_step(fresh);

        // Never checked at all.
        store.insert_step(step_fixture(&run, 2, Some("job-c"), StepStatus::Pending, clock.now()));

        let r = reconciler(&store, &client, &clock);
        let stats = r.stale_stats().await.unwrap();

        assert_eq!(stats.stale, 1);
        assert_eq!(stats.never_checked, 1);
        assert_eq!(
            stats.oldest_check,
            Some(clock.now() - chrono::Duration::seconds(90))
        );
    }

    #[test]
    fn run_rollup_rules() {
        use StepStatus::*;
        assert_eq!(derive_run_status(&[]), None);
        assert_eq!(derive_run_status(&[Succeeded, Succeeded]), Some(RunStatus::Completed));
        assert_eq!(derive_run_status(&[Succeeded, Failed]), Some(RunStatus::Failed));
        assert_eq!(derive_run_status(&[Succeeded, Deleted]), Some(RunStatus::Failed));
        assert_eq!(derive_run_status(&[Succeeded, Cancelled]), Some(RunStatus::Cancelled));
        assert_eq!(derive_run_status(&[Running, Succeeded]), Some(RunStatus::Running));
        assert_eq!(derive_run_status(&[Pending, Pending]), None);
    }
}
