//! Error types for hermes-sync.

use thiserror::Error;

/// Errors that can occur in the sync pipeline and enrichment worker.
#[derive(Error, Debug)]
pub enum SyncError {
    /// State store or upstream read failure
    #[error(transparent)]
    Db(#[from] hermes_db::DbError),

    /// Embedding failure; fatal for the current batch
    #[error(transparent)]
    Embed(#[from] hermes_embed::EmbedError),

    /// Vector store failure; fails the batch, state stays unchanged
    #[error(transparent)]
    Store(#[from] hermes_store::StoreError),

    /// External metadata API failure
    #[error("metadata lookup failed: {0}")]
    Metadata(String),

    /// Worker asked to stop mid-cycle
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Stable error kind string used by the HTTP error body and `last_error`.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Db(e) => e.kind(),
            SyncError::Embed(e) => e.kind(),
            SyncError::Store(e) => e.kind(),
            SyncError::Metadata(_) => "ROW_FAILED",
            SyncError::Cancelled => "CANCELLED",
        }
    }
}

/// Result type for hermes-sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
