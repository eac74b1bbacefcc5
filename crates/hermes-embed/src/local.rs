//! Local embedding fallback.
//!
//! Runs an ONNX sentence-transformer via fastembed when the remote inference
//! service is unreachable at startup. Reports its own embedding version so
//! the state store never mixes local and remote vectors: a deployment that
//! flips between providers re-embeds everything, by contract.
//!
//! Classification has no local model; [`Embedder::classify`] is unsupported
//! here and callers treat the score as absent.

use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{EmbedError, Result};
use crate::provider::{EmbedHealth, EmbedRole, Embedder};
use crate::text::embedding_version;

/// Model used for the fallback path.
const FALLBACK_MODEL: EmbeddingModel = EmbeddingModel::AllMiniLML6V2;
/// Its dimension.
const FALLBACK_DIM: usize = 384;
/// Its identity inside the embedding version tag.
const FALLBACK_MODEL_TAG: &str = "fastembed-MiniLM-L6-v2";

/// Local fastembed-backed provider.
pub struct LocalEmbedder {
    // fastembed inference takes &mut self; serialize access behind a mutex.
    model: Arc<Mutex<TextEmbedding>>,
    version: String,
}

impl LocalEmbedder {
    /// Load the fallback model. Downloads weights on first use.
    pub fn new() -> Result<Self> {
        info!("Loading local embedding fallback ({FALLBACK_MODEL_TAG})");
        let options = InitOptions::new(FALLBACK_MODEL).with_show_download_progress(false);
        let model = TextEmbedding::try_new(options)
            .map_err(|e| EmbedError::Unavailable(format!("failed to load local model: {e}")))?;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            version: embedding_version(FALLBACK_MODEL_TAG, FALLBACK_DIM),
        })
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, texts: Vec<String>, _role: EmbedRole) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        // No role prefixes: the fallback model is not retrieval-tuned.
        let model = Arc::clone(&self.model);
        let vectors = tokio::task::spawn_blocking(move || {
            let mut guard = model.blocking_lock();
            guard.embed(texts, None)
        })
        .await
        .map_err(|e| EmbedError::Unavailable(format!("embedding task panicked: {e}")))?
        .map_err(|e| EmbedError::Unavailable(format!("local inference failed: {e}")))?;

        Ok(vectors)
    }

    async fn classify(&self, _texts: Vec<String>) -> Result<Vec<f32>> {
        Err(EmbedError::Unsupported(
            "classification requires the remote inference service".into(),
        ))
    }

    fn dim(&self) -> usize {
        FALLBACK_DIM
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn check_status(&self) -> EmbedHealth {
        EmbedHealth {
            ok: true,
            version: self.version.clone(),
            dim: FALLBACK_DIM,
            latency_ms: None,
            error: None,
        }
    }

    async fn warmup(&self) -> Result<()> {
        self.embed(vec!["warmup".to_string()], EmbedRole::Query)
            .await?;
        Ok(())
    }
}
