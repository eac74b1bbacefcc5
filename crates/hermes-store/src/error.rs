//! Error types for hermes-store.

use thiserror::Error;

/// Errors that can occur in vector store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backend unreachable or returned a transport-level failure
    #[error("vector store unavailable: {0}")]
    Unavailable(String),

    /// Existing store was created with a different dimension
    #[error("vector dimension mismatch: store has {existing}, configured {configured}")]
    DimMismatch { existing: usize, configured: usize },

    /// A vector in an upsert batch has the wrong length
    #[error("vector length {actual} does not match store dimension {expected}")]
    BadVector { expected: usize, actual: usize },

    /// Store has not been initialized with `ensure`
    #[error("store not initialized; call ensure() first")]
    NotReady,

    /// Persistence layer failure (local backend)
    #[error("store persistence error: {0}")]
    Persistence(String),

    /// Sidecar log line could not be decoded
    #[error("corrupt payload log: {0}")]
    CorruptLog(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Stable error kind string used by the HTTP error body.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::DimMismatch { .. } => "DIM_MISMATCH",
            _ => "VECTOR_UNAVAILABLE",
        }
    }
}

impl From<qdrant_client::QdrantError> for StoreError {
    fn from(err: qdrant_client::QdrantError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Result type for hermes-store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
