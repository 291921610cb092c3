//! Postgres-backed step store.
//!
//! Updates are keyed single statements with COALESCE guards and a
//! non-terminal predicate, so the set-once timestamp, keep-previous-logs,
//! and terminal-finality rules hold even when two writers race.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hackload_id::{RunId, StepId};
use sqlx::PgPool;

use super::DbError;
use crate::model::{RunRollup, RunStatus, StaleStats, StepStatus, StepUpdate, TestRunStep};
use crate::sync::StepStore;

pub struct PgStepStore {
    pool: PgPool,
}

impl PgStepStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const STEP_COLUMNS: &str = "s.id, s.run_id, s.step_name, s.step_order, s.external_job_name, \
     s.status, s.last_status_check, s.container_logs, s.error_message, \
     s.started_at, s.completed_at, s.created_at";

#[async_trait]
impl StepStore for PgStepStore {
    async fn list_reconcilable(&self) -> Result<Vec<TestRunStep>, DbError> {
        let rows = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            SELECT {STEP_COLUMNS}
            FROM test_run_steps s
            JOIN test_runs r ON r.id = s.run_id
            WHERE s.status IN ('PENDING', 'RUNNING')
              AND s.external_job_name IS NOT NULL
            ORDER BY r.created_at, s.step_order
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StepRow::into_step).collect()
    }

    async fn get_step(&self, step_id: &StepId) -> Result<Option<TestRunStep>, DbError> {
        let row = sqlx::query_as::<_, StepRow>(&format!(
            r#"
            SELECT {STEP_COLUMNS}
            FROM test_run_steps s
            WHERE s.id = $1
            "#
        ))
        .bind(step_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(StepRow::into_step).transpose()
    }

    async fn apply_update(&self, update: &StepUpdate) -> Result<(), DbError> {
        // Terminal rows are immutable; a writer that read the step
        // before a concurrent pass finished it matches zero rows.
        sqlx::query(
            r#"
            UPDATE test_run_steps
            SET last_status_check = $2,
                status            = COALESCE($3, status),
                started_at        = COALESCE(started_at, $4),
                completed_at      = COALESCE(completed_at, $5),
                container_logs    = COALESCE($6, container_logs),
                error_message     = COALESCE($7, error_message)
            WHERE id = $1
              AND status IN ('PENDING', 'RUNNING')
            "#,
        )
        .bind(update.step_id.to_string())
        .bind(update.last_status_check)
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.started_at)
        .bind(update.completed_at)
        .bind(update.container_logs.as_deref())
        .bind(update.error_message.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_logs(&self, step_id: &StepId, logs: &str) -> Result<(), DbError> {
        sqlx::query("UPDATE test_run_steps SET container_logs = $2 WHERE id = $1")
            .bind(step_id.to_string())
            .bind(logs)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn stale_stats(&self, cutoff: DateTime<Utc>) -> Result<StaleStats, DbError> {
        use sqlx::Row;

        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE last_status_check < $1)  AS stale,
                COUNT(*) FILTER (WHERE last_status_check IS NULL) AS never_checked,
                MIN(last_status_check) FILTER (WHERE last_status_check < $1) AS oldest_check
            FROM test_run_steps
            WHERE status IN ('PENDING', 'RUNNING')
              AND external_job_name IS NOT NULL
            "#,
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        Ok(StaleStats {
            stale: row.try_get("stale").map_err(DbError::Query)?,
            never_checked: row.try_get("never_checked").map_err(DbError::Query)?,
            oldest_check: row.try_get("oldest_check").map_err(DbError::Query)?,
        })
    }

    async fn list_active_run_rollups(&self) -> Result<Vec<RunRollup>, DbError> {
        use sqlx::Row;

        let rows = sqlx::query(
            r#"
            SELECT r.id AS run_id, r.status AS run_status, s.status AS step_status
            FROM test_runs r
            JOIN test_run_steps s ON s.run_id = r.id
            WHERE r.status IN ('PENDING', 'RUNNING')
            ORDER BY r.created_at, r.id, s.step_order
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        // Rows arrive grouped by run; fold them into one rollup per run.
        let mut rollups: Vec<RunRollup> = Vec::new();
        for row in rows {
            let run_id: String = row.try_get("run_id").map_err(DbError::Query)?;
            let run_id = RunId::parse(&run_id)?;
            let run_status: String = row.try_get("run_status").map_err(DbError::Query)?;
            let step_status: String = row.try_get("step_status").map_err(DbError::Query)?;
            let step_status = StepStatus::parse(&step_status)?;

            match rollups.last_mut() {
                Some(last) if last.run_id == run_id => {
                    last.step_statuses.push(step_status);
                }
                _ => rollups.push(RunRollup {
                    run_id,
                    status: RunStatus::parse(&run_status)?,
                    step_statuses: vec![step_status],
                }),
            }
        }

        Ok(rollups)
    }

    async fn transition_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE test_runs
            SET status = $2,
                started_at = CASE
                    WHEN $2 = 'RUNNING' AND started_at IS NULL THEN $3
                    ELSE started_at
                END,
                completed_at = CASE
                    WHEN $2 IN ('COMPLETED', 'FAILED', 'CANCELLED') AND completed_at IS NULL THEN $3
                    ELSE completed_at
                END
            WHERE id = $1
            "#,
        )
        .bind(run_id.to_string())
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(Debug)]
struct StepRow {
    id: String,
    run_id: String,
    step_name: String,
    step_order: i32,
    external_job_name: Option<String>,
    status: String,
    last_status_check: Option<DateTime<Utc>>,
    container_logs: Option<String>,
    error_message: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StepRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            step_name: row.try_get("step_name")?,
            step_order: row.try_get("step_order")?,
            external_job_name: row.try_get("external_job_name")?,
            status: row.try_get("status")?,
            last_status_check: row.try_get("last_status_check")?,
            container_logs: row.try_get("container_logs")?,
            error_message: row.try_get("error_message")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl StepRow {
    fn into_step(self) -> Result<TestRunStep, DbError> {
        Ok(TestRunStep {
            id: StepId::parse(&self.id)?,
            run_id: RunId::parse(&self.run_id)?,
            step_name: self.step_name,
            step_order: self.step_order,
            external_job_name: self.external_job_name,
            status: StepStatus::parse(&self.status)?,
            last_status_check: self.last_status_check,
            container_logs: self.container_logs,
            error_message: self.error_message,
            started_at: self.started_at,
            completed_at: self.completed_at,
            created_at: self.created_at,
        })
    }
}
