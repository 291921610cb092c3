//! Step log retrieval.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use hackload_id::StepId;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::error::ApiError;
use crate::model::StepStatus;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/{step_id}/logs", get(get_step_logs))
}

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    /// Force a fresh fetch from the platform for an active step.
    #[serde(default)]
    refresh: bool,
}

#[derive(Debug, Serialize)]
struct StepLogsResponse {
    step_id: StepId,
    step_name: String,
    status: StepStatus,
    /// Captured container output; absent when no pod produced any yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    logs: Option<String>,
    /// Whether the logs came from the platform on this request rather
    /// than from the stored capture.
    fresh: bool,
}

/// Stored logs for a step, optionally refreshed from the platform.
///
/// Terminal steps always serve the stored capture: their pods may be
/// gone, and the capture taken at the terminal transition is the record.
async fn get_step_logs(
    State(state): State<AppState>,
    Path(step_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let step_id = StepId::parse(&step_id)
        .map_err(|e| ApiError::bad_request("invalid_step_id", e.to_string()))?;

    let Some(step) = state.steps().get_step(&step_id).await? else {
        return Err(ApiError::not_found(
            "step_not_found",
            format!("no step with id '{step_id}'"),
        ));
    };

    let mut logs = step.container_logs.clone();
    let mut fresh = false;

    if query.refresh && !step.status.is_terminal() {
        if let Some(job_name) = &step.external_job_name {
            match state
                .orchestration()
                .get_logs(job_name, state.reconciler().config().log_tail_lines)
                .await
            {
                Ok(Some(fetched)) => {
                    state.steps().save_logs(&step_id, &fetched).await?;
                    logs = Some(fetched);
                    fresh = true;
                }
                Ok(None) => {}
                // Keep serving the stored capture when the platform is
                // unreachable.
                Err(e) => {
                    warn!(step_id = %step_id, error = %e, "Refreshing step logs failed");
                }
            }
        }
    }

    Ok(Json(StepLogsResponse {
        step_id,
        step_name: step.step_name,
        status: step.status,
        logs,
        fresh,
    }))
}
