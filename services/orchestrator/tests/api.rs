//! HTTP surface tests over in-memory stores.
//!
//! The router is served on an ephemeral port and exercised with a real
//! HTTP client; only the database behind the stores is faked, so these
//! run without Docker.

use std::sync::Arc;

use hackload_id::{RunId, StepId};
use hackload_orchestrator::{
    api,
    clock::Clock,
    db::{Database, DbConfig},
    locks::LockManager,
    model::{RunStatus, StepStatus},
    state::AppState,
    sync::{ReconcilerConfig, StepReconciler, SyncScheduler, SyncSchedulerConfig},
    testing::{step_fixture, InMemoryLockStore, InMemoryStepStore, ManualClock, ScriptedClient},
};
use tokio::net::TcpListener;

struct TestApp {
    base_url: String,
    client: reqwest::Client,
    steps: Arc<InMemoryStepStore>,
    orchestration: Arc<ScriptedClient>,
    clock: Arc<ManualClock>,
}

async fn spawn_app(sync_api_secret: Option<&str>) -> TestApp {
    let clock = Arc::new(ManualClock::default());
    let steps = Arc::new(InMemoryStepStore::default());
    let orchestration = Arc::new(ScriptedClient::default());
    let lock_store = Arc::new(InMemoryLockStore::default());

    let locks = Arc::new(LockManager::with_instance_id(
        lock_store,
        clock.clone(),
        "api-test-instance",
    ));
    let reconciler = Arc::new(StepReconciler::new(
        steps.clone(),
        orchestration.clone(),
        clock.clone(),
        ReconcilerConfig::default(),
    ));
    let scheduler = Arc::new(SyncScheduler::new(
        reconciler.clone(),
        locks.clone(),
        SyncSchedulerConfig::default(),
    ));

    // Lazy pool: handlers under test never touch the database.
    let db = Database::connect_lazy(&DbConfig::default()).unwrap();
    let state = AppState::new(
        db,
        locks,
        reconciler,
        scheduler,
        steps.clone(),
        orchestration.clone(),
        sync_api_secret.map(str::to_string),
    );

    let app = api::create_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        steps,
        orchestration,
        clock,
    }
}

#[tokio::test]
async fn healthz_reports_service_identity() {
    let app = spawn_app(None).await;

    let resp = app
        .client
        .get(format!("{}/healthz", app.base_url))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "orchestrator");
}

#[tokio::test]
async fn sync_info_reports_scheduler_and_instance() {
    let app = spawn_app(None).await;

    let resp = app
        .client
        .get(format!("{}/v1/sync", app.base_url))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["scheduler"]["running"], false);
    assert_eq!(body["scheduler"]["auto_start"], true);
    assert_eq!(body["instance_id"], "api-test-instance");
    assert_eq!(body["stale"]["stale"], 0);
}

#[tokio::test]
async fn sync_start_validates_interval_bounds() {
    let app = spawn_app(None).await;

    let resp = app
        .client
        .post(format!("{}/v1/sync/start", app.base_url))
        .json(&serde_json::json!({ "interval_seconds": 3 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    assert_eq!(
        resp.headers()["content-type"],
        "application/problem+json"
    );
    let problem: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(problem["code"], "invalid_interval");
}

#[tokio::test]
async fn sync_start_stop_lifecycle() {
    let app = spawn_app(None).await;

    let resp = app
        .client
        .post(format!("{}/v1/sync/start", app.base_url))
        .json(&serde_json::json!({ "interval_seconds": 60 }))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["outcome"], "started");
    assert_eq!(body["interval_seconds"], 60);

    // Second start is a no-op reporting the running interval.
    let resp = app
        .client
        .post(format!("{}/v1/sync/start", app.base_url))
        .json(&serde_json::json!({ "interval_seconds": 30 }))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["outcome"], "already_running");
    assert_eq!(body["interval_seconds"], 60);

    let resp = app
        .client
        .post(format!("{}/v1/sync/stop", app.base_url))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["stopped"], true);

    let resp = app
        .client
        .post(format!("{}/v1/sync/stop", app.base_url))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["stopped"], false);
}

#[tokio::test]
async fn manual_sync_requires_the_shared_secret_when_configured() {
    let app = spawn_app(Some("itest-secret")).await;

    let resp = app
        .client
        .post(format!("{}/v1/sync/run", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = app
        .client
        .post(format!("{}/v1/sync/run", app.base_url))
        .header("X-Sync-Secret", "itest-secret")
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let summary: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(summary["steps_examined"], 0);

    // Bearer form is accepted too.
    let resp = app
        .client
        .post(format!("{}/v1/sync/run", app.base_url))
        .header("Authorization", "Bearer itest-secret")
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
}

#[tokio::test]
async fn manual_sync_runs_a_pass_over_active_steps() {
    let app = spawn_app(None).await;

    let run = RunId::new();
    app.steps.insert_run(run, RunStatus::Running, app.clock.now());
    let step = step_fixture(&run, 0, Some("job-1"), StepStatus::Running, app.clock.now());
    app.steps.insert_step(step);

    let resp = app
        .client
        .post(format!("{}/v1/sync/run", app.base_url))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let summary: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(summary["steps_examined"], 1);
    assert_eq!(app.orchestration.phase_calls("job-1"), 1);
}

#[tokio::test]
async fn step_logs_endpoint_validates_and_serves() {
    let app = spawn_app(None).await;

    // Malformed id.
    let resp = app
        .client
        .get(format!("{}/v1/steps/not-an-id/logs", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Unknown but well-formed id.
    let resp = app
        .client
        .get(format!("{}/v1/steps/{}/logs", app.base_url, StepId::new()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Stored capture is served as-is.
    let run = RunId::new();
    app.steps.insert_run(run, RunStatus::Running, app.clock.now());
    let mut step = step_fixture(&run, 0, Some("job-1"), StepStatus::Running, app.clock.now());
    step.container_logs = Some("stored output".to_string());
    let step_id = step.id;
    app.steps.insert_step(step);

    let resp = app
        .client
        .get(format!("{}/v1/steps/{step_id}/logs", app.base_url))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["logs"], "stored output");
    assert_eq!(body["fresh"], false);

    // refresh=true pulls from the platform and persists the new capture.
    app.orchestration.set_logs("job-1", "fresh output");
    let resp = app
        .client
        .get(format!(
            "{}/v1/steps/{step_id}/logs?refresh=true",
            app.base_url
        ))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["logs"], "fresh output");
    assert_eq!(body["fresh"], true);
    assert_eq!(
        app.steps.step(&step_id).container_logs.as_deref(),
        Some("fresh output")
    );
}

#[tokio::test]
async fn lock_endpoints_list_and_force_release() {
    let app = spawn_app(None).await;

    // Nothing held yet.
    let resp = app
        .client
        .get(format!("{}/v1/locks", app.base_url))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["locks"].as_array().unwrap().len(), 0);
    assert_eq!(body["instance_id"], "api-test-instance");

    let resp = app
        .client
        .delete(format!("{}/v1/locks/no-such-lock", app.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = app
        .client
        .post(format!("{}/v1/locks/cleanup", app.base_url))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["removed"], 0);
}
