//! Distributed lock manager.
//!
//! Multiple identical orchestrator replicas coordinate through named,
//! time-bounded leases persisted in the database. The manager is an
//! explicitly constructed service object with an injected store and clock;
//! there is no process-global instance.
//!
//! Acquisition is a single atomic conditional write at the store: a row is
//! inserted, or taken over when the existing lease has expired (or already
//! belongs to the caller). Two instances racing for an expired lease can
//! therefore never both believe they won.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::db::DbError;

/// Lock name guarding the step reconciliation pass.
pub const SYNC_LOCK_NAME: &str = "k6-steps-sync";

/// A persisted lease row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub name: String,
    pub instance_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Persistence port for lease rows.
///
/// `try_acquire` must be atomic at the storage layer: it is the one
/// operation exercised concurrently by multiple instances.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Insert a lease, or take over an existing one that is expired or
    /// already owned by `instance_id`. Returns the resulting row on
    /// success, `None` when the lease is held by another live owner.
    async fn try_acquire(
        &self,
        name: &str,
        instance_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, DbError>;

    /// Fetch a lease row regardless of expiry.
    async fn get(&self, name: &str) -> Result<Option<LockRecord>, DbError>;

    /// Extend the expiry of a lease still owned by `instance_id`.
    /// Returns false when ownership has been lost.
    async fn renew(
        &self,
        name: &str,
        instance_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DbError>;

    /// Delete a lease iff owned by `instance_id`. Returns whether a row
    /// was removed.
    async fn delete_owned(&self, name: &str, instance_id: &str) -> Result<bool, DbError>;

    /// Delete a lease regardless of owner. Returns whether a row existed.
    async fn delete_any(&self, name: &str) -> Result<bool, DbError>;

    /// All leases that have not expired as of `now`.
    async fn list_unexpired(&self, now: DateTime<Utc>) -> Result<Vec<LockRecord>, DbError>;

    /// Delete every lease whose expiry has passed. Returns the count.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, DbError>;
}

/// Errors from lock manager operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock storage error: {0}")]
    Storage(#[from] DbError),

    /// The lease was allowed to expire and another instance took over.
    #[error("lock '{name}' is no longer owned by this instance")]
    OwnershipLost { name: String },
}

/// Proof of a successfully acquired lease, needed to renew or release it.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub name: String,
    pub instance_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of an acquire attempt. Contention is not an error.
#[derive(Debug)]
pub enum AcquireOutcome {
    Acquired(LockHandle),
    HeldByOther {
        holder: String,
        expires_at: DateTime<Utc>,
        remaining: Duration,
    },
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired(_))
    }
}

/// An active lease as reported to operators.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveLock {
    pub name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub remaining_seconds: i64,
    pub owned_by_this_instance: bool,
}

/// Generate the identity of this process, stable for its lifetime.
fn generate_instance_id() -> String {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let pid = std::process::id();
    let entropy: u32 = rand::random();
    format!("{hostname}-{pid}-{entropy:08x}")
}

/// Distributed lock manager over a persisted lease table.
pub struct LockManager {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    instance_id: String,
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            instance_id: generate_instance_id(),
        }
    }

    /// Construct with a fixed instance identity (tests).
    pub fn with_instance_id(
        store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            instance_id: instance_id.into(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Attempt to acquire `name` for `ttl`.
    ///
    /// A lease held by another live owner yields `HeldByOther` with the
    /// owner's identity and time to expiry. A failed attempt is never
    /// retried here; callers skip their tick and let the next firing try
    /// again.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> Result<AcquireOutcome, LockError> {
        let now = self.clock.now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());

        if let Some(record) = self
            .store
            .try_acquire(name, &self.instance_id, now, expires_at)
            .await?
        {
            debug!(
                lock = name,
                instance_id = %self.instance_id,
                expires_at = %record.expires_at,
                "Acquired lock"
            );
            return Ok(AcquireOutcome::Acquired(LockHandle {
                name: record.name,
                instance_id: record.instance_id,
                expires_at: record.expires_at,
            }));
        }

        // Lost the race; report the current owner for observability.
        match self.store.get(name).await? {
            Some(record) => {
                let remaining = (record.expires_at - now).to_std().unwrap_or_default();
                Ok(AcquireOutcome::HeldByOther {
                    holder: record.instance_id,
                    expires_at: record.expires_at,
                    remaining,
                })
            }
            // Row vanished between the write and the read (released or
            // cleaned up); treat as contention, the next tick will win.
            None => Ok(AcquireOutcome::HeldByOther {
                holder: "unknown".to_string(),
                expires_at: now,
                remaining: Duration::ZERO,
            }),
        }
    }

    /// Extend a held lease by `ttl` from now.
    pub async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<LockHandle, LockError> {
        let now = self.clock.now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());

        let renewed = self
            .store
            .renew(&handle.name, &self.instance_id, expires_at)
            .await?;
        if !renewed {
            return Err(LockError::OwnershipLost {
                name: handle.name.clone(),
            });
        }

        Ok(LockHandle {
            name: handle.name.clone(),
            instance_id: handle.instance_id.clone(),
            expires_at,
        })
    }

    /// Release a held lease. A lease that is already gone is not an error.
    pub async fn release(&self, handle: LockHandle) -> Result<(), LockError> {
        let removed = self
            .store
            .delete_owned(&handle.name, &self.instance_id)
            .await?;
        if removed {
            debug!(lock = %handle.name, instance_id = %self.instance_id, "Released lock");
        }
        Ok(())
    }

    /// Administrative override: delete a lease regardless of owner.
    ///
    /// Only reachable from the operator API, never from the
    /// reconciliation path.
    pub async fn force_release(&self, name: &str) -> Result<bool, LockError> {
        let removed = self.store.delete_any(name).await?;
        if removed {
            info!(lock = name, "Force-released lock");
        }
        Ok(removed)
    }

    /// All unexpired leases, annotated for the caller's instance.
    pub async fn list_active(&self) -> Result<Vec<ActiveLock>, LockError> {
        let now = self.clock.now();
        let records = self.store.list_unexpired(now).await?;
        Ok(records
            .into_iter()
            .map(|r| ActiveLock {
                remaining_seconds: (r.expires_at - now).num_seconds().max(0),
                owned_by_this_instance: r.instance_id == self.instance_id,
                name: r.name,
                holder: r.instance_id,
                acquired_at: r.acquired_at,
                expires_at: r.expires_at,
            })
            .collect())
    }

    /// Current lease row for `name`, if any and unexpired.
    pub async fn lock_info(&self, name: &str) -> Result<Option<ActiveLock>, LockError> {
        let now = self.clock.now();
        let record = self.store.get(name).await?;
        Ok(record.filter(|r| r.expires_at > now).map(|r| ActiveLock {
            remaining_seconds: (r.expires_at - now).num_seconds().max(0),
            owned_by_this_instance: r.instance_id == self.instance_id,
            name: r.name,
            holder: r.instance_id,
            acquired_at: r.acquired_at,
            expires_at: r.expires_at,
        }))
    }

    /// Delete all expired leases.
    ///
    /// Safe to run concurrently from any instance: deleting an
    /// already-expired row twice is idempotent.
    pub async fn cleanup_expired(&self) -> Result<u64, LockError> {
        let now = self.clock.now();
        let removed = self.store.delete_expired(now).await?;
        if removed > 0 {
            info!(removed, "Cleaned up expired locks");
        }
        Ok(removed)
    }
}
