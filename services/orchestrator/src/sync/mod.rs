//! Step synchronization.
//!
//! The reconciler pulls every active step that has a submitted external
//! job, asks the orchestration platform where that job stands, and folds
//! the answer back into the database. The scheduler wraps a reconciler in
//! a lock-guarded periodic loop so that a fleet of identical replicas
//! performs exactly one pass per tick.

mod reconciler;
mod scheduler;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hackload_id::{RunId, StepId};
use thiserror::Error;

use crate::db::DbError;
use crate::locks::LockError;
use crate::model::{RunRollup, RunStatus, StaleStats, StepUpdate, TestRunStep};

pub use reconciler::{ReconcilerConfig, StepReconciler, StepSyncResult, SyncSummary};
pub use scheduler::{
    SchedulerInfo, StartOutcome, SyncScheduler, SyncSchedulerConfig, DEFAULT_SYNC_INTERVAL,
    MAX_SYNC_INTERVAL, MIN_SYNC_INTERVAL,
};

/// Persistence port for test-run steps.
#[async_trait]
pub trait StepStore: Send + Sync {
    /// Every step eligible for reconciliation: non-terminal status and a
    /// submitted external job. Ordered by run creation, then step order,
    /// so pass output is deterministic.
    async fn list_reconcilable(&self) -> Result<Vec<TestRunStep>, DbError>;

    /// Fetch one step by id.
    async fn get_step(&self, step_id: &StepId) -> Result<Option<TestRunStep>, DbError>;

    /// Apply a reconciliation update. `None` fields leave stored values
    /// untouched; `started_at`/`completed_at` only land when still unset.
    async fn apply_update(&self, update: &StepUpdate) -> Result<(), DbError>;

    /// Overwrite a step's captured logs.
    async fn save_logs(&self, step_id: &StepId, logs: &str) -> Result<(), DbError>;

    /// Staleness counters over reconcilable steps, relative to `cutoff`.
    async fn stale_stats(&self, cutoff: DateTime<Utc>) -> Result<StaleStats, DbError>;

    /// Non-terminal runs together with all their step statuses.
    async fn list_active_run_rollups(&self) -> Result<Vec<RunRollup>, DbError>;

    /// Move a run to `status`. Start/completion timestamps are stamped
    /// once, on the transition that first implies them.
    async fn transition_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DbError>;
}

/// Errors that abort a whole pass (individual step failures do not).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] DbError),

    #[error(transparent)]
    Lock(#[from] LockError),
}
