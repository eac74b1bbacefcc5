//! Remote embedding client.
//!
//! Talks to the inference service's `POST {url}/infer` endpoint:
//!
//! - Request: `{"model": "...", "task": "embed"|"classify", "texts": [...]}`
//! - Embed response: `{"vectors": [[f32; dim], ...]}`
//! - Classify response: `{"scores": [f32, ...]}`
//!
//! Requests are chunked to the configured batch cap, retried on transient
//! network errors with bounded exponential backoff, and funneled through an
//! in-flight gate: callers beyond the cap queue up to a bounded depth, then
//! fail `EMBED_BUSY`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{EmbedError, Result};
use crate::provider::{EmbedHealth, EmbedRole, Embedder};
use crate::text::embedding_version;

/// Base delay for exponential backoff.
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Configuration for the remote embedding client.
#[derive(Debug, Clone)]
pub struct RemoteEmbedderConfig {
    /// Service base URL (e.g. `http://localhost:9100`)
    pub url: String,
    /// Model identifier sent with every request
    pub model: String,
    /// Vector dimension the service produces
    pub dim: usize,
    /// Per-call timeout in seconds
    pub timeout_seconds: u64,
    /// Prefix applied to query-role texts
    pub query_prefix: String,
    /// Prefix applied to document-role texts
    pub document_prefix: String,
    /// Maximum texts per request
    pub max_batch: usize,
    /// Maximum concurrent in-flight requests
    pub max_in_flight: usize,
    /// Callers queued beyond the cap before `EMBED_BUSY`
    pub queue_depth: usize,
    /// Retry attempts for transient failures
    pub max_retries: u32,
}

#[derive(Debug, Serialize)]
struct InferRequest<'a> {
    model: &'a str,
    task: &'a str,
    texts: &'a [String],
}

#[derive(Debug, Deserialize, Default)]
struct InferResponse {
    #[serde(default)]
    vectors: Vec<Vec<f32>>,
    #[serde(default)]
    scores: Vec<f32>,
    /// Model the service actually ran, when it reports one
    #[serde(default)]
    model: Option<String>,
}

/// In-flight gate with a bounded wait queue.
struct Gate {
    permits: Semaphore,
    max_in_flight: usize,
    queued: AtomicUsize,
    queue_depth: usize,
}

impl Gate {
    fn new(max_in_flight: usize, queue_depth: usize) -> Self {
        Self {
            permits: Semaphore::new(max_in_flight.max(1)),
            max_in_flight: max_in_flight.max(1),
            queued: AtomicUsize::new(0),
            queue_depth,
        }
    }

    async fn acquire(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        // Fast path: a permit is free, no queueing involved.
        if let Ok(permit) = self.permits.try_acquire() {
            return Ok(permit);
        }

        let queued = self.queued.fetch_add(1, Ordering::SeqCst);
        if queued >= self.queue_depth {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(EmbedError::Busy {
                in_flight: self.max_in_flight,
                queued,
            });
        }

        let permit = self.permits.acquire().await;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        permit.map_err(|_| EmbedError::Unavailable("embedding gate closed".into()))
    }
}

/// HTTP client for the remote inference service.
pub struct RemoteEmbedder {
    client: Client,
    config: RemoteEmbedderConfig,
    version: String,
    gate: Gate,
}

impl RemoteEmbedder {
    /// Create a new remote embedding client.
    pub fn new(config: RemoteEmbedderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| EmbedError::Unavailable(format!("HTTP client error: {e}")))?;

        let version = embedding_version(&config.model, config.dim);
        let gate = Gate::new(config.max_in_flight, config.queue_depth);

        Ok(Self {
            client,
            config,
            version,
            gate,
        })
    }

    fn infer_url(&self) -> String {
        format!("{}/infer", self.config.url.trim_end_matches('/'))
    }

    fn prefix_for(&self, role: EmbedRole) -> &str {
        match role {
            EmbedRole::Query => &self.config.query_prefix,
            EmbedRole::Document => &self.config.document_prefix,
        }
    }

    /// Send one request with bounded exponential backoff.
    async fn request_with_retry(&self, task: &str, texts: &[String]) -> Result<InferResponse> {
        let mut retry_delay = Duration::from_millis(RETRY_BASE_DELAY_MS);
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match self.send_request(task, texts).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    // Malformed or wrong-model responses won't improve on retry.
                    if matches!(
                        e,
                        EmbedError::BadResponse(_)
                            | EmbedError::DimensionMismatch { .. }
                            | EmbedError::VersionMismatch { .. }
                    ) {
                        return Err(e);
                    }
                    if attempt < self.config.max_retries {
                        debug!("Embedding request failed (attempt {}): {}", attempt + 1, e);
                        tokio::time::sleep(retry_delay).await;
                        retry_delay *= 2;
                        last_error = Some(e);
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| EmbedError::Unavailable("request failed after retries".into())))
    }

    async fn send_request(&self, task: &str, texts: &[String]) -> Result<InferResponse> {
        let body = InferRequest {
            model: &self.config.model,
            task,
            texts,
        };

        let response = self
            .client
            .post(self.infer_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EmbedError::Unavailable("request timed out".into())
                } else if e.is_connect() {
                    EmbedError::Unavailable(format!("connection failed: {e}"))
                } else {
                    EmbedError::Unavailable(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status == StatusCode::UNPROCESSABLE_ENTITY || status == StatusCode::BAD_REQUEST {
            let detail = response.text().await.unwrap_or_default();
            return Err(EmbedError::BadResponse(format!(
                "service rejected request: {detail}"
            )));
        }
        if !status.is_success() {
            return Err(EmbedError::Unavailable(format!(
                "service returned {status}"
            )));
        }

        let parsed = response
            .json::<InferResponse>()
            .await
            .map_err(|e| EmbedError::BadResponse(e.to_string()))?;

        // A service answering with a different model would silently poison
        // the stored vectors under the configured version tag.
        if let Some(actual) = &parsed.model {
            if actual != &self.config.model {
                return Err(EmbedError::VersionMismatch {
                    configured: self.config.model.clone(),
                    actual: actual.clone(),
                });
            }
        }
        Ok(parsed)
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed(&self, texts: Vec<String>, role: EmbedRole) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let prefix = self.prefix_for(role);
        let prefixed: Vec<String> = if prefix.is_empty() {
            texts
        } else {
            texts.into_iter().map(|t| format!("{prefix}{t}")).collect()
        };

        let _permit = self.gate.acquire().await?;

        let mut vectors = Vec::with_capacity(prefixed.len());
        for chunk in prefixed.chunks(self.config.max_batch.max(1)) {
            let response = self.request_with_retry("embed", chunk).await?;
            if response.vectors.len() != chunk.len() {
                return Err(EmbedError::BadResponse(format!(
                    "expected {} vectors, got {}",
                    chunk.len(),
                    response.vectors.len()
                )));
            }
            for vector in &response.vectors {
                if vector.len() != self.config.dim {
                    return Err(EmbedError::DimensionMismatch {
                        expected: self.config.dim,
                        actual: vector.len(),
                    });
                }
            }
            vectors.extend(response.vectors);
        }

        Ok(vectors)
    }

    async fn classify(&self, texts: Vec<String>) -> Result<Vec<f32>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let _permit = self.gate.acquire().await?;

        let mut scores = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.config.max_batch.max(1)) {
            let response = self.request_with_retry("classify", chunk).await?;
            if response.scores.len() != chunk.len() {
                return Err(EmbedError::BadResponse(format!(
                    "expected {} scores, got {}",
                    chunk.len(),
                    response.scores.len()
                )));
            }
            scores.extend(response.scores.iter().map(|s| s.clamp(0.0, 1.0)));
        }

        Ok(scores)
    }

    fn dim(&self) -> usize {
        self.config.dim
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn check_status(&self) -> EmbedHealth {
        let start = Instant::now();
        let probe = self
            .send_request("embed", std::slice::from_ref(&"ping".to_string()))
            .await;
        match probe {
            Ok(_) => EmbedHealth {
                ok: true,
                version: self.version.clone(),
                dim: self.config.dim,
                latency_ms: Some(start.elapsed().as_millis() as u64),
                error: None,
            },
            Err(e) => EmbedHealth {
                ok: false,
                version: self.version.clone(),
                dim: self.config.dim,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    }

    async fn warmup(&self) -> Result<()> {
        let status = self.check_status().await;
        if !status.ok {
            warn!(
                "Embedding service warmup failed: {}",
                status.error.as_deref().unwrap_or("unknown")
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str) -> RemoteEmbedderConfig {
        RemoteEmbedderConfig {
            url: url.to_string(),
            model: "bge-m3".into(),
            dim: 4,
            timeout_seconds: 5,
            query_prefix: "query: ".into(),
            document_prefix: String::new(),
            max_batch: 2,
            max_in_flight: 2,
            queue_depth: 4,
            max_retries: 2,
        }
    }

    #[tokio::test]
    async fn test_embed_chunks_and_orders() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/infer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "vectors": [[0.1, 0.2, 0.3, 0.4], [0.5, 0.6, 0.7, 0.8]]
            })))
            .expect(2)
            .mount(&server)
            .await;

        // Four texts with max_batch=2 produce exactly two requests.
        let embedder = RemoteEmbedder::new(config(&server.uri())).unwrap();
        let result = embedder
            .embed(
                vec!["a".into(), "b".into(), "c".into(), "d".into()],
                EmbedRole::Document,
            )
            .await
            .unwrap();
        assert_eq!(result.len(), 4);
        assert_eq!(result[0], vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(result[3], vec![0.5, 0.6, 0.7, 0.8]);
    }

    #[tokio::test]
    async fn test_query_role_applies_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/infer"))
            .and(body_partial_json(serde_json::json!({
                "texts": ["query: jojo"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "vectors": [[1.0, 0.0, 0.0, 0.0]]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let embedder = RemoteEmbedder::new(config(&server.uri())).unwrap();
        let result = embedder
            .embed(vec!["jojo".into()], EmbedRole::Query)
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/infer"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/infer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "vectors": [[1.0, 0.0, 0.0, 0.0]]
            })))
            .mount(&server)
            .await;

        let embedder = RemoteEmbedder::new(config(&server.uri())).unwrap();
        let result = embedder
            .embed(vec!["a".into()], EmbedRole::Document)
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_is_unavailable() {
        // Nothing listens on this port.
        let mut cfg = config("http://127.0.0.1:9");
        cfg.max_retries = 0;
        let embedder = RemoteEmbedder::new(cfg).unwrap();
        let err = embedder
            .embed(vec!["a".into()], EmbedRole::Document)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "EMBED_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/infer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "vectors": [[0.1, 0.2]]
            })))
            .mount(&server)
            .await;

        let embedder = RemoteEmbedder::new(config(&server.uri())).unwrap();
        let err = embedder
            .embed(vec!["a".into()], EmbedRole::Document)
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedError::DimensionMismatch { expected: 4, actual: 2 }));
    }

    #[tokio::test]
    async fn test_model_mismatch_rejected_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/infer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "some-other-model",
                "vectors": [[0.1, 0.2, 0.3, 0.4]]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let embedder = RemoteEmbedder::new(config(&server.uri())).unwrap();
        let err = embedder
            .embed(vec!["a".into()], EmbedRole::Document)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "VERSION_MISMATCH");
    }

    #[tokio::test]
    async fn test_classify_clamps_scores() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/infer"))
            .and(body_partial_json(serde_json::json!({"task": "classify"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "scores": [1.5, -0.2]
            })))
            .mount(&server)
            .await;

        let embedder = RemoteEmbedder::new(config(&server.uri())).unwrap();
        let scores = embedder
            .classify(vec!["a".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(scores, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_gate_rejects_when_queue_full() {
        let gate = Gate::new(1, 0);
        let held = gate.acquire().await.unwrap();
        let err = gate.acquire().await.unwrap_err();
        assert_eq!(err.kind(), "EMBED_BUSY");
        drop(held);
        assert!(gate.acquire().await.is_ok());
    }
}
