//! Lock-guarded periodic scheduling of reconciliation passes.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::locks::{AcquireOutcome, LockManager, SYNC_LOCK_NAME};

use super::StepReconciler;

/// Hard bounds on the sync interval.
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_SYNC_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(20);

/// Scheduler tunables.
#[derive(Debug, Clone)]
pub struct SyncSchedulerConfig {
    /// Interval used when `start` is called without an override.
    pub default_interval: Duration,
    /// Lock TTL as a multiple of the interval. Clamped to at least 2 so a
    /// lease always survives one missed tick.
    pub lock_ttl_factor: f64,
    /// Whether the loop was configured to start with the service. Only
    /// reported through `info`; the caller decides when to start.
    pub auto_start: bool,
}

impl Default for SyncSchedulerConfig {
    fn default() -> Self {
        Self {
            default_interval: DEFAULT_SYNC_INTERVAL,
            lock_ttl_factor: 2.0,
            auto_start: true,
        }
    }
}

impl SyncSchedulerConfig {
    fn lock_ttl(&self, interval: Duration) -> Duration {
        interval.mul_f64(self.lock_ttl_factor.max(2.0))
    }
}

/// Result of a start request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { interval_seconds: u64 },
    /// The loop was already running; its interval is reported unchanged.
    AlreadyRunning { interval_seconds: u64 },
}

/// Scheduler state for the operator surface.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerInfo {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
    pub default_interval_seconds: u64,
    pub auto_start: bool,
}

struct RunningJob {
    interval: Duration,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the background reconciliation loop.
///
/// Every replica runs its own scheduler; the distributed lock decides
/// which one actually performs each pass. Start and stop are idempotent
/// and serialized through an async mutex, so concurrent operator requests
/// cannot race two loops into existence.
pub struct SyncScheduler {
    reconciler: Arc<StepReconciler>,
    locks: Arc<LockManager>,
    config: SyncSchedulerConfig,
    job: Mutex<Option<RunningJob>>,
}

impl SyncScheduler {
    pub fn new(
        reconciler: Arc<StepReconciler>,
        locks: Arc<LockManager>,
        config: SyncSchedulerConfig,
    ) -> Self {
        Self {
            reconciler,
            locks,
            config,
            job: Mutex::new(None),
        }
    }

    /// Start the loop with `interval`, or the configured default. A
    /// no-op when already running.
    pub async fn start(&self, interval: Option<Duration>) -> StartOutcome {
        let mut job = self.job.lock().await;
        if let Some(running) = job.as_ref() {
            return StartOutcome::AlreadyRunning {
                interval_seconds: running.interval.as_secs(),
            };
        }

        let interval = interval.unwrap_or(self.config.default_interval);
        let lock_ttl = self.config.lock_ttl(interval);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let reconciler = self.reconciler.clone();
        let locks = self.locks.clone();
        let handle = tokio::spawn(run_loop(reconciler, locks, interval, lock_ttl, shutdown_rx));

        info!(interval_seconds = interval.as_secs(), "Sync scheduler started");
        *job = Some(RunningJob {
            interval,
            shutdown,
            handle,
        });
        StartOutcome::Started {
            interval_seconds: interval.as_secs(),
        }
    }

    /// Stop the loop, draining any pass already in flight. Returns
    /// whether a loop was running.
    pub async fn stop(&self) -> bool {
        let job = self.job.lock().await.take();
        let Some(job) = job else {
            return false;
        };

        let _ = job.shutdown.send(true);
        if let Err(e) = job.handle.await {
            error!(error = %e, "Sync loop task failed");
        }
        info!("Sync scheduler stopped");
        true
    }

    /// Stop then start with a possibly different interval.
    pub async fn restart(&self, interval: Option<Duration>) -> StartOutcome {
        self.stop().await;
        self.start(interval).await
    }

    pub async fn info(&self) -> SchedulerInfo {
        let job = self.job.lock().await;
        SchedulerInfo {
            running: job.is_some(),
            interval_seconds: job.as_ref().map(|j| j.interval.as_secs()),
            default_interval_seconds: self.config.default_interval.as_secs(),
            auto_start: self.config.auto_start,
        }
    }
}

async fn run_loop(
    reconciler: Arc<StepReconciler>,
    locks: Arc<LockManager>,
    interval: Duration,
    lock_ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                guarded_pass(&reconciler, &locks, lock_ttl).await;
            }
        }
    }
}

/// One tick: take the lock, run the pass, release. A lease held by
/// another instance means that instance is doing the work this tick.
async fn guarded_pass(reconciler: &StepReconciler, locks: &LockManager, lock_ttl: Duration) {
    let handle = match locks.acquire(SYNC_LOCK_NAME, lock_ttl).await {
        Ok(AcquireOutcome::Acquired(handle)) => handle,
        Ok(AcquireOutcome::HeldByOther { holder, .. }) => {
            debug!(holder = %holder, "Sync lock held elsewhere, skipping tick");
            return;
        }
        Err(e) => {
            error!(error = %e, "Failed to acquire sync lock");
            return;
        }
    };

    if let Err(e) = reconciler.run_pass().await {
        error!(error = %e, "Sync pass failed");
    }

    if let Err(e) = locks.release(handle).await {
        warn!(error = %e, "Failed to release sync lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::k6::{JobPhase, PhaseReport};
    use crate::model::{RunStatus, StepStatus};
    use crate::sync::ReconcilerConfig;
    use crate::testing::{step_fixture, InMemoryLockStore, InMemoryStepStore, ManualClock, ScriptedClient};
    use hackload_id::RunId;

    struct Fixture {
        scheduler: SyncScheduler,
        client: Arc<ScriptedClient>,
        lock_store: Arc<InMemoryLockStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        fixture_with(SyncSchedulerConfig::default())
    }

    fn fixture_with(config: SyncSchedulerConfig) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let step_store = Arc::new(InMemoryStepStore::default());
        let client = Arc::new(ScriptedClient::default());
        let lock_store = Arc::new(InMemoryLockStore::default());

        let run = RunId::new();
        step_store.insert_run(run, RunStatus::Running, clock.now());
        step_store.insert_step(step_fixture(
            &run,
            0,
            Some("job-1"),
            StepStatus::Running,
            clock.now(),
        ));

        let reconciler = Arc::new(StepReconciler::new(
            step_store,
            client.clone(),
            clock.clone(),
            ReconcilerConfig::default(),
        ));
        let locks = Arc::new(LockManager::with_instance_id(
            lock_store.clone(),
            clock.clone(),
            "scheduler-test",
        ));

        Fixture {
            scheduler: SyncScheduler::new(reconciler, locks, config),
            client,
            lock_store,
            clock,
        }
    }

    #[tokio::test]
    async fn info_reports_auto_start_enablement() {
        let f = fixture_with(SyncSchedulerConfig {
            auto_start: false,
            ..SyncSchedulerConfig::default()
        });

        let info = f.scheduler.info().await;
        assert!(!info.running);
        assert!(!info.auto_start);

        assert!(fixture().scheduler.info().await.auto_start);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_runs_immediately_then_every_interval() {
        let f = fixture();

        f.scheduler.start(Some(Duration::from_secs(20))).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(f.client.phase_calls("job-1"), 1, "first pass fires at start");

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(f.client.phase_calls("job-1"), 2);

        assert!(f.scheduler.stop().await);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.client.phase_calls("job-1"), 2, "no passes after stop");
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_a_noop_reporting_the_running_interval() {
        let f = fixture();

        let first = f.scheduler.start(Some(Duration::from_secs(30))).await;
        assert!(matches!(first, StartOutcome::Started { interval_seconds: 30 }));

        let second = f.scheduler.start(Some(Duration::from_secs(5))).await;
        assert!(matches!(
            second,
            StartOutcome::AlreadyRunning { interval_seconds: 30 }
        ));

        let info = f.scheduler.info().await;
        assert!(info.running);
        assert_eq!(info.interval_seconds, Some(30));

        f.scheduler.stop().await;
        assert!(!f.scheduler.info().await.running);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_is_skipped_while_another_instance_holds_the_lock() {
        let f = fixture();

        // Another replica holds the sync lock with a lease far in the
        // future (the manual clock never advances in this test).
        let other = LockManager::with_instance_id(
            f.lock_store.clone(),
            f.clock.clone(),
            "other-instance",
        );
        assert!(other
            .acquire(SYNC_LOCK_NAME, Duration::from_secs(3600))
            .await
            .unwrap()
            .is_acquired());

        f.scheduler.start(Some(Duration::from_secs(10))).await;
        tokio::time::sleep(Duration::from_secs(25)).await;

        assert_eq!(f.client.phase_calls("job-1"), 0, "all ticks skipped");
        f.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_changes_the_interval() {
        let f = fixture();

        f.scheduler.start(Some(Duration::from_secs(300))).await;
        let outcome = f.scheduler.restart(Some(Duration::from_secs(10))).await;
        assert!(matches!(outcome, StartOutcome::Started { interval_seconds: 10 }));

        let info = f.scheduler.info().await;
        assert_eq!(info.interval_seconds, Some(10));
        f.scheduler.stop().await;
    }
}
