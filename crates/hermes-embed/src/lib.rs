//! Embedding client for HermesIndex.
//!
//! Provides the [`Embedder`] abstraction with two implementations:
//!
//! - [`RemoteEmbedder`] - HTTP client for the inference service's `/infer`
//!   endpoint, with batching, bounded retry, and an in-flight cap.
//! - [`LocalEmbedder`] - fastembed ONNX fallback for deployments without the
//!   remote service.
//!
//! The [`text`] module owns the normalization rules and the
//! `embedding_version` contract that ties model, dimension, and
//! normalization together.

mod error;
mod local;
mod provider;
mod remote;
pub mod text;

use std::sync::Arc;

use tracing::warn;

pub use error::{EmbedError, Result};
pub use local::LocalEmbedder;
pub use provider::{EmbedHealth, EmbedRole, Embedder};
pub use remote::{RemoteEmbedder, RemoteEmbedderConfig};

/// Build the process-wide embedding provider.
///
/// Prefers the remote service. When it is unreachable at startup and
/// `local_fallback` is set, loads the local model instead; the fallback
/// carries a distinct embedding version, so switching providers re-embeds
/// the corpus rather than mixing vector spaces.
pub async fn create_embedder(
    config: RemoteEmbedderConfig,
    local_fallback: bool,
) -> Result<Arc<dyn Embedder>> {
    if config.url.is_empty() {
        if local_fallback {
            return Ok(Arc::new(LocalEmbedder::new()?));
        }
        return Err(EmbedError::Unavailable(
            "no embedding service configured".into(),
        ));
    }

    let remote = RemoteEmbedder::new(config)?;
    let status = remote.check_status().await;
    if status.ok {
        return Ok(Arc::new(remote));
    }

    if local_fallback {
        warn!(
            "Embedding service unreachable ({}), using local fallback",
            status.error.as_deref().unwrap_or("unknown")
        );
        return Ok(Arc::new(LocalEmbedder::new()?));
    }

    // Unreachable at startup is not fatal for the sync path; callers retry
    // per batch. Hand back the remote client as-is.
    warn!(
        "Embedding service unreachable at startup: {}",
        status.error.as_deref().unwrap_or("unknown")
    );
    Ok(Arc::new(remote))
}
