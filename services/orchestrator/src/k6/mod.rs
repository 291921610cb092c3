//! Orchestration platform adapter.
//!
//! The reconciler never talks to the platform directly; it goes through
//! the [`OrchestrationClient`] port, which normalizes every failure into a
//! small taxonomy. "Not found" is the load-bearing distinction: it is the
//! only error that drives a terminal transition (DELETED), everything else
//! is transient and retried on the next pass.

mod client;

pub use client::{K6BuildError, K6Client, K6Config};

use async_trait::async_trait;
use thiserror::Error;

use crate::model::StepStatus;

/// Coarse execution phase of an external job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    /// Queued or not yet scheduled.
    Queued,
    /// Actively executing.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Completed with a non-zero exit.
    Failed,
    /// Explicitly cancelled by an operator.
    Cancelled,
}

impl JobPhase {
    /// The single external-phase to internal-status mapping.
    pub fn step_status(self) -> StepStatus {
        match self {
            JobPhase::Queued => StepStatus::Pending,
            JobPhase::Running => StepStatus::Running,
            JobPhase::Succeeded => StepStatus::Succeeded,
            JobPhase::Failed => StepStatus::Failed,
            JobPhase::Cancelled => StepStatus::Cancelled,
        }
    }
}

/// Map a k6 TestRun stage label onto a coarse phase.
///
/// Unrecognized stages are treated as not-yet-scheduled rather than as
/// errors; the platform occasionally reports intermediate stages that are
/// not worth distinguishing.
pub fn phase_from_stage(stage: &str) -> JobPhase {
    match stage {
        "initialization" | "initialized" => JobPhase::Queued,
        "created" | "started" => JobPhase::Running,
        "finished" => JobPhase::Succeeded,
        "stopped" => JobPhase::Cancelled,
        "error" => JobPhase::Failed,
        _ => JobPhase::Queued,
    }
}

/// A phase lookup result: the coarse phase plus optional error detail
/// suitable for an operator-facing message.
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub phase: JobPhase,
    pub detail: Option<String>,
}

impl PhaseReport {
    pub fn new(phase: JobPhase) -> Self {
        Self {
            phase,
            detail: None,
        }
    }
}

/// Errors from the orchestration platform, pre-classified.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// The job no longer exists and never reported a terminal phase.
    #[error("job '{0}' not found")]
    NotFound(String),

    /// The request exceeded its bounded timeout. Never treated as
    /// evidence of absence.
    #[error("request to orchestration platform timed out")]
    Timeout,

    /// Connection-level failure.
    #[error("orchestration platform unreachable: {0}")]
    Transport(String),

    /// The platform answered with an unexpected status.
    #[error("orchestration platform returned status {status}: {message}")]
    Api { status: u16, message: String },
}

impl OrchestrationError {
    /// Definitive absence, as opposed to a transient failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestrationError::NotFound(_))
    }
}

/// Port to the external container-orchestration platform.
#[async_trait]
pub trait OrchestrationClient: Send + Sync {
    /// Look up the phase of `job_name` with a bounded timeout.
    async fn get_job_phase(&self, job_name: &str) -> Result<PhaseReport, OrchestrationError>;

    /// Fetch the most recent `tail_lines` of output for `job_name`.
    ///
    /// Best-effort: `Ok(None)` means no execution units were found, which
    /// is not an error condition for the caller.
    async fn get_logs(
        &self,
        job_name: &str,
        tail_lines: i64,
    ) -> Result<Option<String>, OrchestrationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_mapping_covers_known_stages() {
        assert_eq!(phase_from_stage("initialization"), JobPhase::Queued);
        assert_eq!(phase_from_stage("initialized"), JobPhase::Queued);
        assert_eq!(phase_from_stage("created"), JobPhase::Running);
        assert_eq!(phase_from_stage("started"), JobPhase::Running);
        assert_eq!(phase_from_stage("finished"), JobPhase::Succeeded);
        assert_eq!(phase_from_stage("stopped"), JobPhase::Cancelled);
        assert_eq!(phase_from_stage("error"), JobPhase::Failed);
    }

    #[test]
    fn unknown_stage_maps_to_queued() {
        assert_eq!(phase_from_stage("warming-up"), JobPhase::Queued);
        assert_eq!(phase_from_stage(""), JobPhase::Queued);
    }

    #[test]
    fn phase_to_status_decision_table() {
        assert_eq!(JobPhase::Queued.step_status(), StepStatus::Pending);
        assert_eq!(JobPhase::Running.step_status(), StepStatus::Running);
        assert_eq!(JobPhase::Succeeded.step_status(), StepStatus::Succeeded);
        assert_eq!(JobPhase::Failed.step_status(), StepStatus::Failed);
        assert_eq!(JobPhase::Cancelled.step_status(), StepStatus::Cancelled);
    }

    #[test]
    fn not_found_is_the_only_definitive_error() {
        assert!(OrchestrationError::NotFound("j".into()).is_not_found());
        assert!(!OrchestrationError::Timeout.is_not_found());
        assert!(!OrchestrationError::Transport("refused".into()).is_not_found());
        assert!(!OrchestrationError::Api {
            status: 500,
            message: "boom".into()
        }
        .is_not_found());
    }
}
