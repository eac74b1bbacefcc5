//! Error types for hermes-embed.

use thiserror::Error;

/// Errors that can occur while producing embeddings.
#[derive(Error, Debug)]
pub enum EmbedError {
    /// Service unreachable, timed out, or kept failing after retries
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),

    /// In-flight cap reached and the wait queue is full
    #[error("embedding service busy: {in_flight} in flight, {queued} queued")]
    Busy { in_flight: usize, queued: usize },

    /// Service answered with an unusable body
    #[error("bad embedding response: {0}")]
    BadResponse(String),

    /// Returned vector does not match the configured dimension
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Service runs a different model than configured
    #[error("embedding model mismatch: configured '{configured}', service runs '{actual}'")]
    VersionMismatch { configured: String, actual: String },

    /// Operation not supported by this provider
    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl EmbedError {
    /// Stable error kind string used by the HTTP error body.
    pub fn kind(&self) -> &'static str {
        match self {
            EmbedError::Busy { .. } => "EMBED_BUSY",
            EmbedError::VersionMismatch { .. } => "VERSION_MISMATCH",
            _ => "EMBED_UNAVAILABLE",
        }
    }
}

/// Result type for hermes-embed operations.
pub type Result<T> = std::result::Result<T, EmbedError>;
