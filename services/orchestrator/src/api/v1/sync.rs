//! Sync scheduler control endpoints.

use std::time::Duration;

use axum::{
    extract::State,
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::locks::{ActiveLock, SYNC_LOCK_NAME};
use crate::model::StaleStats;
use crate::state::AppState;
use crate::sync::{SchedulerInfo, MAX_SYNC_INTERVAL, MIN_SYNC_INTERVAL};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(sync_info))
        .route("/start", post(start_sync))
        .route("/stop", post(stop_sync))
        .route("/restart", post(restart_sync))
        .route("/run", post(run_sync_now))
}

#[derive(Debug, Serialize)]
struct SyncInfoResponse {
    scheduler: SchedulerInfo,
    /// Current holder of the sync lock, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    lock: Option<ActiveLock>,
    /// Steps whose reconciliation is overdue.
    stale: StaleStats,
    instance_id: String,
}

/// Scheduler state, lock holder, and staleness counters in one view.
async fn sync_info(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let scheduler = state.scheduler().info().await;
    let lock = state.locks().lock_info(SYNC_LOCK_NAME).await?;
    let stale = state.reconciler().stale_stats().await?;

    Ok(Json(SyncInfoResponse {
        scheduler,
        lock,
        stale,
        instance_id: state.locks().instance_id().to_string(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct IntervalRequest {
    interval_seconds: Option<u64>,
}

fn parse_interval(request: &IntervalRequest) -> Result<Option<Duration>, ApiError> {
    let Some(seconds) = request.interval_seconds else {
        return Ok(None);
    };

    let interval = Duration::from_secs(seconds);
    if interval < MIN_SYNC_INTERVAL || interval > MAX_SYNC_INTERVAL {
        return Err(ApiError::bad_request(
            "invalid_interval",
            format!(
                "interval_seconds must be between {} and {}",
                MIN_SYNC_INTERVAL.as_secs(),
                MAX_SYNC_INTERVAL.as_secs()
            ),
        ));
    }
    Ok(Some(interval))
}

/// Start the sync loop. A no-op when already running; the running
/// interval is reported either way.
async fn start_sync(
    State(state): State<AppState>,
    body: Option<Json<IntervalRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let interval = parse_interval(&request)?;
    Ok(Json(state.scheduler().start(interval).await))
}

#[derive(Debug, Serialize)]
struct StopResponse {
    stopped: bool,
}

/// Stop the sync loop, draining any pass in flight.
async fn stop_sync(State(state): State<AppState>) -> impl IntoResponse {
    let stopped = state.scheduler().stop().await;
    Json(StopResponse { stopped })
}

/// Stop then start, optionally with a new interval.
async fn restart_sync(
    State(state): State<AppState>,
    body: Option<Json<IntervalRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let interval = parse_interval(&request)?;
    Ok(Json(state.scheduler().restart(interval).await))
}

/// Run one reconciliation pass immediately, without the lock and without
/// touching the periodic loop. Guarded by a shared secret when one is
/// configured.
async fn run_sync_now(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize_manual_run(&state, &headers)?;
    let summary = state.reconciler().run_pass().await?;
    Ok(Json(summary))
}

fn authorize_manual_run(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(secret) = state.sync_api_secret() else {
        return Ok(());
    };

    let presented = headers
        .get("x-sync-secret")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });

    if presented == Some(secret) {
        Ok(())
    } else {
        Err(ApiError::unauthorized(
            "invalid_sync_secret",
            "manual sync requires a valid secret",
        ))
    }
}
