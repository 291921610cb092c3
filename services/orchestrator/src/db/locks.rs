//! Postgres-backed lock store.
//!
//! The acquire path is one conditional upsert so that takeover of an
//! expired lease and plain insertion are the same atomic statement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::DbError;
use crate::locks::{LockRecord, LockStore};

pub struct PgLockStore {
    pool: PgPool,
}

impl PgLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn try_acquire(
        &self,
        name: &str,
        instance_id: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<LockRecord>, DbError> {
        // The WHERE clause makes the update fire only when the existing
        // lease is expired or already ours; `acquired_at` is preserved on
        // an owner extension and reset on a takeover.
        let row = sqlx::query_as::<_, LockRow>(
            r#"
            INSERT INTO distributed_locks (name, instance_id, acquired_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE
            SET instance_id = EXCLUDED.instance_id,
                acquired_at = CASE
                    WHEN distributed_locks.instance_id = EXCLUDED.instance_id
                         AND distributed_locks.expires_at > $3
                    THEN distributed_locks.acquired_at
                    ELSE EXCLUDED.acquired_at
                END,
                expires_at = EXCLUDED.expires_at
            WHERE distributed_locks.expires_at <= $3
               OR distributed_locks.instance_id = EXCLUDED.instance_id
            RETURNING name, instance_id, acquired_at, expires_at
            "#,
        )
        .bind(name)
        .bind(instance_id)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(LockRecord::from))
    }

    async fn get(&self, name: &str) -> Result<Option<LockRecord>, DbError> {
        let row = sqlx::query_as::<_, LockRow>(
            r#"
            SELECT name, instance_id, acquired_at, expires_at
            FROM distributed_locks
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(LockRecord::from))
    }

    async fn renew(
        &self,
        name: &str,
        instance_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE distributed_locks
            SET expires_at = $3
            WHERE name = $1 AND instance_id = $2
            "#,
        )
        .bind(name)
        .bind(instance_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_owned(&self, name: &str, instance_id: &str) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            DELETE FROM distributed_locks
            WHERE name = $1 AND instance_id = $2
            "#,
        )
        .bind(name)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_any(&self, name: &str) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM distributed_locks WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_unexpired(&self, now: DateTime<Utc>) -> Result<Vec<LockRecord>, DbError> {
        let rows = sqlx::query_as::<_, LockRow>(
            r#"
            SELECT name, instance_id, acquired_at, expires_at
            FROM distributed_locks
            WHERE expires_at > $1
            ORDER BY acquired_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(LockRecord::from).collect())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM distributed_locks WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[derive(Debug)]
struct LockRow {
    name: String,
    instance_id: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for LockRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            name: row.try_get("name")?,
            instance_id: row.try_get("instance_id")?,
            acquired_at: row.try_get("acquired_at")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

impl From<LockRow> for LockRecord {
    fn from(row: LockRow) -> Self {
        LockRecord {
            name: row.name,
            instance_id: row.instance_id,
            acquired_at: row.acquired_at,
            expires_at: row.expires_at,
        }
    }
}
