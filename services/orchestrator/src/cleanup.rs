//! Background removal of expired lock leases.
//!
//! Expired rows are already ignored by every read path; this job just
//! keeps the lease table from accumulating them. It runs on every
//! instance without coordination, because deleting an expired row twice
//! is harmless.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use crate::locks::LockManager;

#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    pub interval: Duration,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
        }
    }
}

pub struct CleanupWorker {
    locks: Arc<LockManager>,
    config: CleanupWorkerConfig,
}

impl CleanupWorker {
    pub fn new(locks: Arc<LockManager>, config: CleanupWorkerConfig) -> Self {
        Self { locks, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting lock cleanup worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.locks.cleanup_expired().await {
                        error!(error = %e, "Failed to cleanup expired locks");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Lock cleanup worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
