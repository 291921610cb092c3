//! hackload Load-Test Orchestrator
//!
//! Keeps persisted test-run state in agreement with the k6 jobs actually
//! running on Kubernetes: a lock-guarded sync loop reconciles step
//! statuses, and a REST API exposes operator controls over the loop and
//! the lock table.

use std::sync::Arc;

use anyhow::Result;
use hackload_orchestrator::{
    api,
    cleanup::{CleanupWorker, CleanupWorkerConfig},
    clock::SystemClock,
    config,
    db::Database,
    k6::K6Client,
    locks::LockManager,
    state::AppState,
    sync::{ReconcilerConfig, StepReconciler, SyncScheduler, SyncSchedulerConfig},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to HACKLOAD_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting hackload orchestrator");
    info!(
        listen_addr = %config.listen_addr,
        sync_interval_secs = config.sync.interval.as_secs(),
        sync_auto_start = config.sync.auto_start,
        "Configuration loaded"
    );

    // Connect to database
    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    // Run migrations in dev mode
    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    // Wire the reconciliation stack
    let clock = Arc::new(SystemClock);
    let locks = Arc::new(LockManager::new(Arc::new(db.lock_store()), clock.clone()));
    info!(instance_id = %locks.instance_id(), "Lock manager initialized");

    let orchestration = Arc::new(K6Client::new(config.kube.clone())?);
    let steps = Arc::new(db.step_store());
    let reconciler = Arc::new(StepReconciler::new(
        steps.clone(),
        orchestration.clone(),
        clock,
        ReconcilerConfig {
            log_tail_lines: config.sync.log_tail_lines,
            stale_after: config.sync.stale_after,
        },
    ));
    let scheduler = Arc::new(SyncScheduler::new(
        reconciler.clone(),
        locks.clone(),
        SyncSchedulerConfig {
            default_interval: config.sync.interval,
            lock_ttl_factor: config.sync.lock_ttl_factor,
            auto_start: config.sync.auto_start,
        },
    ));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start lock cleanup worker in background
    let cleanup_worker = CleanupWorker::new(locks.clone(), CleanupWorkerConfig::default());
    let cleanup_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            cleanup_worker.run(shutdown_rx).await;
        }
    });

    // Start the sync loop unless an operator wants to start it by hand
    if config.sync.auto_start {
        scheduler.start(None).await;
    } else {
        info!("Sync loop auto-start disabled, waiting for operator");
    }

    // Create application state
    let state = AppState::new(
        db,
        locks,
        reconciler,
        scheduler.clone(),
        steps,
        orchestration,
        config.sync.api_secret.clone(),
    );

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Drain the sync loop first so an in-flight pass finishes and the
    // lock is released promptly rather than left to expire.
    scheduler.stop().await;

    // Signal shutdown to remaining workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, cleanup_handle).await {
        warn!(error = %e, "Cleanup worker did not shut down in time");
    }

    info!("Orchestrator shutdown complete");
    Ok(())
}
