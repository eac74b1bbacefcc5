//! Error types for hermes-db.

use thiserror::Error;

/// Errors from the upstream database and HermesIndex-owned tables.
#[derive(Error, Debug)]
pub enum DbError {
    /// Connection or query failure
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// A configured identifier is not a safe SQL identifier
    #[error("unsafe SQL identifier '{0}'")]
    UnsafeIdentifier(String),

    /// Row not found
    #[error("row '{pg_id}' not found in source '{source_name}'")]
    NotFound { source_name: String, pg_id: String },

    /// Statement exceeded its timeout budget
    #[error("statement timed out after {0} ms")]
    StatementTimeout(u64),
}

impl DbError {
    /// Stable error kind string used by the HTTP error body.
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::NotFound { .. } => "NOT_FOUND",
            DbError::StatementTimeout(_) => "EXPAND_TIMEOUT",
            _ => "DB_UNAVAILABLE",
        }
    }

    /// Whether this error is the Postgres statement-timeout condition.
    pub fn is_statement_timeout(err: &sqlx::Error) -> bool {
        matches!(
            err,
            sqlx::Error::Database(db) if db.code().as_deref() == Some("57014")
        )
    }
}

/// Result type for hermes-db operations.
pub type Result<T> = std::result::Result<T, DbError>;
