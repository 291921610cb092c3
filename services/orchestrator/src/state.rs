//! Application state shared across request handlers.

use std::sync::Arc;

use crate::db::Database;
use crate::k6::OrchestrationClient;
use crate::locks::LockManager;
use crate::sync::{StepReconciler, StepStore, SyncScheduler};

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    db: Database,
    locks: Arc<LockManager>,
    reconciler: Arc<StepReconciler>,
    scheduler: Arc<SyncScheduler>,
    steps: Arc<dyn StepStore>,
    orchestration: Arc<dyn OrchestrationClient>,
    sync_api_secret: Option<String>,
}

impl AppState {
    pub fn new(
        db: Database,
        locks: Arc<LockManager>,
        reconciler: Arc<StepReconciler>,
        scheduler: Arc<SyncScheduler>,
        steps: Arc<dyn StepStore>,
        orchestration: Arc<dyn OrchestrationClient>,
        sync_api_secret: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                db,
                locks,
                reconciler,
                scheduler,
                steps,
                orchestration,
                sync_api_secret,
            }),
        }
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    pub fn reconciler(&self) -> &StepReconciler {
        &self.inner.reconciler
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.inner.scheduler
    }

    pub fn steps(&self) -> &dyn StepStore {
        self.inner.steps.as_ref()
    }

    pub fn orchestration(&self) -> &dyn OrchestrationClient {
        self.inner.orchestration.as_ref()
    }

    /// Shared secret protecting the manual sync trigger, when configured.
    pub fn sync_api_secret(&self) -> Option<&str> {
        self.inner.sync_api_secret.as_deref()
    }
}
