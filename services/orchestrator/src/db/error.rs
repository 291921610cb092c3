//! Database error types.

use thiserror::Error;

use crate::model::StatusParseError;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}. Run from repo root or services/orchestrator.")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// A stored row carried a status label no enum variant covers.
    #[error("corrupt row: {0}")]
    CorruptStatus(#[from] StatusParseError),

    /// A stored row carried an ID that does not parse.
    #[error("corrupt row: invalid id: {0}")]
    CorruptId(#[from] hackload_id::IdError),
}

impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        DbError::Query(e)
    }
}
