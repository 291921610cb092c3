//! Domain types for load-test runs and their steps.
//!
//! Statuses are exhaustive enums with a single canonical string form; the
//! persistence layer stores the labels and parses them back at the boundary,
//! so an unhandled status is a compile-time gap rather than a stray string
//! comparison.

use chrono::{DateTime, Utc};
use hackload_id::{RunId, StepId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised when a stored status label does not match any known variant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {kind} status '{value}'")]
pub struct StatusParseError {
    pub kind: &'static str,
    pub value: String,
}

/// Status of a single externally executed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// The backing job vanished without ever reporting a terminal phase.
    Deleted,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Succeeded => "SUCCEEDED",
            StepStatus::Failed => "FAILED",
            StepStatus::Cancelled => "CANCELLED",
            StepStatus::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StatusParseError> {
        match s {
            "PENDING" => Ok(StepStatus::Pending),
            "RUNNING" => Ok(StepStatus::Running),
            "SUCCEEDED" => Ok(StepStatus::Succeeded),
            "FAILED" => Ok(StepStatus::Failed),
            "CANCELLED" => Ok(StepStatus::Cancelled),
            "DELETED" => Ok(StepStatus::Deleted),
            other => Err(StatusParseError {
                kind: "step",
                value: other.to_string(),
            }),
        }
    }

    /// Terminal steps are never reconciled again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded
                | StepStatus::Failed
                | StepStatus::Cancelled
                | StepStatus::Deleted
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a whole test run, rolled up from its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StatusParseError> {
        match s {
            "PENDING" => Ok(RunStatus::Pending),
            "RUNNING" => Ok(RunStatus::Running),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            "CANCELLED" => Ok(RunStatus::Cancelled),
            other => Err(StatusParseError {
                kind: "run",
                value: other.to_string(),
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One externally executed unit of work within a run.
#[derive(Debug, Clone)]
pub struct TestRunStep {
    pub id: StepId,
    pub run_id: RunId,
    pub step_name: String,
    pub step_order: i32,
    /// Set once the step's workload has been submitted to the platform.
    /// A step without a job name is definitionally not yet reconcilable.
    pub external_job_name: Option<String>,
    pub status: StepStatus,
    pub last_status_check: Option<DateTime<Utc>>,
    pub container_logs: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A single step's update as computed by one reconciliation pass.
///
/// `None` fields mean "leave the stored value untouched"; `started_at` and
/// `completed_at` are only ever applied when still unset, so they are
/// written exactly once over a step's lifecycle.
#[derive(Debug, Clone)]
pub struct StepUpdate {
    pub step_id: StepId,
    pub last_status_check: DateTime<Utc>,
    pub status: Option<StepStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub container_logs: Option<String>,
    pub error_message: Option<String>,
}

impl StepUpdate {
    /// A pure status-check stamp with no other changes.
    pub fn checked_at(step_id: StepId, now: DateTime<Utc>) -> Self {
        Self {
            step_id,
            last_status_check: now,
            status: None,
            started_at: None,
            completed_at: None,
            container_logs: None,
            error_message: None,
        }
    }
}

/// A run together with the statuses of all its steps, for roll-up.
#[derive(Debug, Clone)]
pub struct RunRollup {
    pub run_id: RunId,
    pub status: RunStatus,
    pub step_statuses: Vec<StepStatus>,
}

/// Staleness signal over non-terminal, reconcilable steps.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StaleStats {
    /// Steps whose last successful check is older than the threshold.
    pub stale: i64,
    /// Steps that have a submitted job but were never checked at all.
    pub never_checked: i64,
    /// Oldest successful check among the stale steps.
    pub oldest_check: Option<DateTime<Utc>>,
}
