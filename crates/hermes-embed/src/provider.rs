//! Embedding provider trait and shared types.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

/// Role of the texts being embedded.
///
/// Retrieval-tuned models want different prefixes for queries and documents;
/// the provider applies the configured prefix before inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedRole {
    /// Search-side query text
    Query,
    /// Index-side document text
    Document,
}

/// Provider health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EmbedHealth {
    /// Whether the provider answered
    pub ok: bool,
    /// Active embedding version tag
    pub version: String,
    /// Vector dimension
    pub dim: usize,
    /// Health-probe latency
    pub latency_ms: Option<u64>,
    /// Error message when unavailable
    pub error: Option<String>,
}

/// Embedding provider abstraction.
///
/// Implemented by the remote inference client and the local fallback. All
/// methods are async; implementations must be `Send + Sync` so one provider
/// can serve every worker task.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts.
    ///
    /// Returns one vector per input, in input order. Batches larger than the
    /// provider's request cap are chunked internally.
    async fn embed(&self, texts: Vec<String>, role: EmbedRole) -> Result<Vec<Vec<f32>>>;

    /// NSFW-classify a batch of texts, one score in `[0, 1]` per input.
    async fn classify(&self, texts: Vec<String>) -> Result<Vec<f32>>;

    /// Vector dimension produced by this provider.
    fn dim(&self) -> usize;

    /// Embedding version tag (model + dimension + normalization contract).
    ///
    /// Providers must report distinct versions so the state store never
    /// treats their vectors as interchangeable.
    fn version(&self) -> &str;

    /// Probe provider reachability.
    async fn check_status(&self) -> EmbedHealth;

    /// Warm the provider up (first-request latency). Non-fatal on failure.
    async fn warmup(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_object_safe(_: &dyn Embedder) {}
}
