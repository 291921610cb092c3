//! In-memory test doubles for the storage and platform ports.
//!
//! Shared between unit tests and integration tests, so they live in the
//! crate proper rather than behind `#[cfg(test)]`. Nothing here touches a
//! database or the network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hackload_id::{RunId, StepId};

use crate::clock::Clock;
use crate::db::DbError;
use crate::k6::{JobPhase, OrchestrationClient, OrchestrationError, PhaseReport};
use crate::locks::{LockRecord, LockStore};
use crate::model::{RunRollup, RunStatus, StaleStats, StepStatus, StepUpdate, TestRunStep};
use crate::sync::StepStore;

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        // 2026-01-01T00:00:00Z
        Self {
            now: Mutex::new(
                DateTime::<Utc>::from_timestamp(1_767_225_600, 0).expect("valid timestamp"),
            ),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).expect("advance fits in chrono range");
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// Lease table in a hash map, mirroring the conditional-upsert semantics
/// of the real store: insert, owner re-acquire, expired takeover.
#[derive(Default)]
pub struct InMemoryLockStore {
    locks: Mutex<HashMap<String, LockRecord>>,
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(
        &self,
        name: &str,
        instance_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, DbError> {
        let mut locks = self.locks.lock().unwrap();
        let record = match locks.get(name) {
            Some(existing) if existing.instance_id == instance_id => LockRecord {
                name: name.to_string(),
                instance_id: instance_id.to_string(),
                // Re-acquire by the live owner keeps the original
                // acquisition time; takeover of an expired own lease
                // starts a fresh one.
                acquired_at: if existing.expires_at > now {
                    existing.acquired_at
                } else {
                    now
                },
                expires_at,
            },
            Some(existing) if existing.expires_at > now => return Ok(None),
            _ => LockRecord {
                name: name.to_string(),
                instance_id: instance_id.to_string(),
                acquired_at: now,
                expires_at,
            },
        };
        locks.insert(name.to_string(), record.clone());
        Ok(Some(record))
    }

    async fn get(&self, name: &str) -> Result<Option<LockRecord>, DbError> {
        Ok(self.locks.lock().unwrap().get(name).cloned())
    }

    async fn renew(
        &self,
        name: &str,
        instance_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let mut locks = self.locks.lock().unwrap();
        match locks.get_mut(name) {
            Some(record) if record.instance_id == instance_id => {
                record.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_owned(&self, name: &str, instance_id: &str) -> Result<bool, DbError> {
        let mut locks = self.locks.lock().unwrap();
        match locks.get(name) {
            Some(record) if record.instance_id == instance_id => {
                locks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_any(&self, name: &str) -> Result<bool, DbError> {
        Ok(self.locks.lock().unwrap().remove(name).is_some())
    }

    async fn list_unexpired(&self, now: DateTime<Utc>) -> Result<Vec<LockRecord>, DbError> {
        let locks = self.locks.lock().unwrap();
        let mut records: Vec<_> = locks
            .values()
            .filter(|r| r.expires_at > now)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        let mut locks = self.locks.lock().unwrap();
        let before = locks.len();
        locks.retain(|_, r| r.expires_at > now);
        Ok((before - locks.len()) as u64)
    }
}

struct RunRow {
    status: RunStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

/// Runs and steps in hash maps, with the same update semantics as the
/// real store (set-once timestamps, `None` leaves values untouched,
/// terminal rows immutable).
#[derive(Default)]
pub struct InMemoryStepStore {
    inner: Mutex<StepStoreInner>,
}

#[derive(Default)]
struct StepStoreInner {
    runs: HashMap<RunId, RunRow>,
    steps: HashMap<StepId, TestRunStep>,
    failing_run_transitions: HashSet<RunId>,
}

impl InMemoryStepStore {
    pub fn insert_run(&self, run_id: RunId, status: RunStatus, created_at: DateTime<Utc>) {
        self.inner.lock().unwrap().runs.insert(
            run_id,
            RunRow {
                status,
                created_at,
                started_at: None,
                completed_at: None,
            },
        );
    }

    pub fn insert_step(&self, step: TestRunStep) {
        self.inner.lock().unwrap().steps.insert(step.id, step);
    }

    /// Fetch a step, panicking when absent (test assertions only).
    pub fn step(&self, step_id: &StepId) -> TestRunStep {
        self.inner.lock().unwrap().steps[step_id].clone()
    }

    pub fn run_status(&self, run_id: &RunId) -> RunStatus {
        self.inner.lock().unwrap().runs[run_id].status
    }

    /// Make every `transition_run` for this run fail with a storage error.
    pub fn fail_run_transitions(&self, run_id: RunId) {
        self.inner
            .lock()
            .unwrap()
            .failing_run_transitions
            .insert(run_id);
    }
}

#[async_trait]
impl StepStore for InMemoryStepStore {
    async fn list_reconcilable(&self) -> Result<Vec<TestRunStep>, DbError> {
        let inner = self.inner.lock().unwrap();
        let mut steps: Vec<_> = inner
            .steps
            .values()
            .filter(|s| !s.status.is_terminal() && s.external_job_name.is_some())
            .cloned()
            .collect();
        steps.sort_by_key(|s| {
            let run_created = inner.runs.get(&s.run_id).map(|r| r.created_at);
            (run_created, s.step_order)
        });
        Ok(steps)
    }

    async fn get_step(&self, step_id: &StepId) -> Result<Option<TestRunStep>, DbError> {
        Ok(self.inner.lock().unwrap().steps.get(step_id).cloned())
    }

    async fn apply_update(&self, update: &StepUpdate) -> Result<(), DbError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(step) = inner.steps.get_mut(&update.step_id) {
            if step.status.is_terminal() {
                return Ok(());
            }
            step.last_status_check = Some(update.last_status_check);
            if let Some(status) = update.status {
                step.status = status;
            }
            if step.started_at.is_none() {
                step.started_at = update.started_at;
            }
            if step.completed_at.is_none() {
                step.completed_at = update.completed_at;
            }
            if let Some(logs) = &update.container_logs {
                step.container_logs = Some(logs.clone());
            }
            if let Some(message) = &update.error_message {
                step.error_message = Some(message.clone());
            }
        }
        Ok(())
    }

    async fn save_logs(&self, step_id: &StepId, logs: &str) -> Result<(), DbError> {
        if let Some(step) = self.inner.lock().unwrap().steps.get_mut(step_id) {
            step.container_logs = Some(logs.to_string());
        }
        Ok(())
    }

    async fn stale_stats(&self, cutoff: DateTime<Utc>) -> Result<StaleStats, DbError> {
        let inner = self.inner.lock().unwrap();
        let mut stats = StaleStats::default();
        for step in inner.steps.values() {
            if step.status.is_terminal() || step.external_job_name.is_none() {
                continue;
            }
            match step.last_status_check {
                None => stats.never_checked += 1,
                Some(checked) if checked < cutoff => {
                    stats.stale += 1;
                    stats.oldest_check = match stats.oldest_check {
                        Some(oldest) if oldest <= checked => Some(oldest),
                        _ => Some(checked),
                    };
                }
                Some(_) => {}
            }
        }
        Ok(stats)
    }

    async fn list_active_run_rollups(&self) -> Result<Vec<RunRollup>, DbError> {
        let inner = self.inner.lock().unwrap();
        let mut rollups = Vec::new();
        for (run_id, run) in &inner.runs {
            if run.status.is_terminal() {
                continue;
            }
            let mut steps: Vec<_> = inner
                .steps
                .values()
                .filter(|s| &s.run_id == run_id)
                .collect();
            steps.sort_by_key(|s| s.step_order);
            rollups.push(RunRollup {
                run_id: *run_id,
                status: run.status,
                step_statuses: steps.iter().map(|s| s.status).collect(),
            });
        }
        rollups.sort_by(|a, b| a.run_id.to_string().cmp(&b.run_id.to_string()));
        Ok(rollups)
    }

    async fn transition_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing_run_transitions.contains(run_id) {
            return Err(DbError::Query(sqlx::Error::PoolClosed));
        }
        if let Some(run) = inner.runs.get_mut(run_id) {
            run.status = status;
            if status == RunStatus::Running && run.started_at.is_none() {
                run.started_at = Some(now);
            }
            if status.is_terminal() && run.completed_at.is_none() {
                run.completed_at = Some(now);
            }
        }
        Ok(())
    }
}

/// Orchestration client driven by per-job queues of scripted responses.
/// An empty queue answers "running", so loop tests can tick freely.
#[derive(Default)]
pub struct ScriptedClient {
    phases: Mutex<HashMap<String, VecDeque<Result<PhaseReport, OrchestrationError>>>>,
    logs: Mutex<HashMap<String, String>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedClient {
    pub fn push_phase(&self, job: &str, response: Result<PhaseReport, OrchestrationError>) {
        self.phases
            .lock()
            .unwrap()
            .entry(job.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn set_logs(&self, job: &str, logs: &str) {
        self.logs
            .lock()
            .unwrap()
            .insert(job.to_string(), logs.to_string());
    }

    /// How many phase lookups were made for `job`.
    pub fn phase_calls(&self, job: &str) -> usize {
        self.calls.lock().unwrap().get(job).copied().unwrap_or(0)
    }
}

#[async_trait]
impl OrchestrationClient for ScriptedClient {
    async fn get_job_phase(&self, job_name: &str) -> Result<PhaseReport, OrchestrationError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(job_name.to_string())
            .or_insert(0) += 1;
        self.phases
            .lock()
            .unwrap()
            .get_mut(job_name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(PhaseReport::new(JobPhase::Running)))
    }

    async fn get_logs(
        &self,
        job_name: &str,
        _tail_lines: i64,
    ) -> Result<Option<String>, OrchestrationError> {
        Ok(self.logs.lock().unwrap().get(job_name).cloned())
    }
}

/// A step row in its post-submission shape, ready for reconciliation.
pub fn step_fixture(
    run_id: &RunId,
    order: i32,
    job: Option<&str>,
    status: StepStatus,
    created_at: DateTime<Utc>,
) -> TestRunStep {
    TestRunStep {
        id: StepId::new(),
        run_id: *run_id,
        step_name: format!("step-{order}"),
        step_order: order,
        external_job_name: job.map(str::to_string),
        status,
        last_status_check: None,
        container_logs: None,
        error_message: None,
        started_at: None,
        completed_at: None,
        created_at,
    }
}
