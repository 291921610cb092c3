//! Lock administration endpoints.
//!
//! Operator-facing: inspect live leases, sweep expired rows, and break a
//! stuck lease by hand. Nothing here is called from the reconciliation
//! path.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;

use crate::api::error::ApiError;
use crate::locks::ActiveLock;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_locks))
        .route("/cleanup", post(cleanup_locks))
        .route("/{name}", delete(force_release_lock))
}

#[derive(Debug, Serialize)]
struct LockListResponse {
    locks: Vec<ActiveLock>,
    instance_id: String,
}

/// All currently held (unexpired) leases.
async fn list_locks(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let locks = state.locks().list_active().await?;
    Ok(Json(LockListResponse {
        locks,
        instance_id: state.locks().instance_id().to_string(),
    }))
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    removed: u64,
}

/// Delete every expired lease row immediately.
async fn cleanup_locks(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let removed = state.locks().cleanup_expired().await?;
    Ok(Json(CleanupResponse { removed }))
}

/// Break a lease regardless of owner. For recovery from a crashed holder
/// whose lease has not yet expired.
async fn force_release_lock(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if state.locks().force_release(&name).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(
            "lock_not_found",
            format!("no lock named '{name}'"),
        ))
    }
}
