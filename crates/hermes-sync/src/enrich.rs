//! Enrichment worker loop.
//!
//! Selects content rows lacking enrichment, asks the external metadata API
//! about each under a global token-bucket rate limit and per-request timeout,
//! and writes results into the enrichment table. Failures mark the row with
//! `status = 'error'` and never stop the pass.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use hermes_config::{SourceConfig, TmdbConfig};
use hermes_db::{ContentKey, EnrichmentRow, PgEnrichmentStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

/// Token-bucket limiter shared by every enrichment worker.
pub type EnrichRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Build the process-wide metadata rate limiter.
///
/// One bucket serves all workers: the configured rate bounds calls to the
/// external API globally, not per source.
pub fn metadata_rate_limiter(config: &TmdbConfig) -> Arc<EnrichRateLimiter> {
    let rps = NonZeroU32::new(config.requests_per_second.max(1))
        .unwrap_or(NonZeroU32::new(1).unwrap());
    Arc::new(RateLimiter::direct(Quota::per_second(rps)))
}

/// External metadata lookup seam.
///
/// The real implementation talks to TMDB; tests substitute a canned one.
#[async_trait]
pub trait MetadataLookup: Send + Sync {
    /// Look a candidate up. `Ok(None)` means the API answered but had no
    /// match; errors mean the API misbehaved.
    async fn lookup(&self, key: &ContentKey) -> Result<Option<EnrichmentRow>>;
}

/// Enrichment table writes used by the worker.
#[async_trait]
pub trait EnrichmentSink: Send + Sync {
    async fn candidates(&self, source: &SourceConfig, limit: i64) -> Result<Vec<ContentKey>>;
    async fn upsert(&self, row: &EnrichmentRow) -> Result<()>;
    async fn mark_error(&self, key: &ContentKey, reason: &str) -> Result<()>;
}

#[async_trait]
impl EnrichmentSink for PgEnrichmentStore {
    async fn candidates(&self, source: &SourceConfig, limit: i64) -> Result<Vec<ContentKey>> {
        Ok(PgEnrichmentStore::candidates(self, source, limit).await?)
    }

    async fn upsert(&self, row: &EnrichmentRow) -> Result<()> {
        Ok(PgEnrichmentStore::upsert(self, row).await?)
    }

    async fn mark_error(&self, key: &ContentKey, reason: &str) -> Result<()> {
        Ok(PgEnrichmentStore::mark_error(self, key, reason).await?)
    }
}

/// Counters for one enrichment pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnrichStats {
    pub candidates: usize,
    pub enriched: usize,
    pub misses: usize,
    pub failed: usize,
}

/// Rate-limited enrichment worker for one content source.
pub struct EnrichmentWorker {
    source: SourceConfig,
    sink: Arc<dyn EnrichmentSink>,
    lookup: Arc<dyn MetadataLookup>,
    limiter: Arc<EnrichRateLimiter>,
    limit: i64,
    sleep_seconds: u64,
    request_timeout: Duration,
}

impl EnrichmentWorker {
    /// Create a worker. `limiter` must be the one shared bucket from
    /// [`metadata_rate_limiter`]; handing each worker its own would multiply
    /// the configured rate by the number of enriched sources.
    pub fn new(
        source: SourceConfig,
        sink: Arc<dyn EnrichmentSink>,
        lookup: Arc<dyn MetadataLookup>,
        limiter: Arc<EnrichRateLimiter>,
        config: &TmdbConfig,
    ) -> Self {
        Self {
            source,
            sink,
            lookup,
            limiter,
            limit: config.limit,
            sleep_seconds: config.sleep_seconds,
            request_timeout: Duration::from_secs(config.request_timeout_seconds.max(1)),
        }
    }

    /// Run one pass over the candidate set.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<EnrichStats> {
        let candidates = self.sink.candidates(&self.source, self.limit).await?;
        let mut stats = EnrichStats {
            candidates: candidates.len(),
            ..Default::default()
        };

        for key in candidates {
            if cancel.is_cancelled() {
                break;
            }

            self.limiter.until_ready().await;

            let result = tokio::time::timeout(self.request_timeout, self.lookup.lookup(&key)).await;
            match result {
                Ok(Ok(Some(row))) => {
                    self.sink.upsert(&row).await?;
                    stats.enriched += 1;
                }
                Ok(Ok(None)) => {
                    self.sink.mark_error(&key, "no metadata match").await?;
                    stats.misses += 1;
                }
                Ok(Err(e)) => {
                    debug!("Metadata lookup failed for {:?}: {}", key.content_id, e);
                    self.sink.mark_error(&key, &e.to_string()).await?;
                    stats.failed += 1;
                }
                Err(_) => {
                    self.sink.mark_error(&key, "lookup timed out").await?;
                    stats.failed += 1;
                }
            }
        }

        info!(
            source = %self.source.name,
            candidates = stats.candidates,
            enriched = stats.enriched,
            misses = stats.misses,
            failed = stats.failed,
            "Enrichment pass complete"
        );
        Ok(stats)
    }

    /// Run passes until cancelled, sleeping between them.
    pub async fn run_loop(&self, cancel: CancellationToken) {
        loop {
            match self.run_pass(&cancel).await {
                Ok(_) => {}
                Err(SyncError::Cancelled) => break,
                Err(e) => warn!(source = %self.source.name, "Enrichment pass failed: {}", e),
            }
            if cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(self.sleep_seconds)) => {}
            }
        }
        info!(source = %self.source.name, "Enrichment worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CannedLookup {
        rows: Mutex<Vec<Option<EnrichmentRow>>>,
    }

    #[async_trait]
    impl MetadataLookup for CannedLookup {
        async fn lookup(&self, key: &ContentKey) -> Result<Option<EnrichmentRow>> {
            let mut rows = self.rows.lock().unwrap();
            match rows.pop() {
                Some(Some(mut row)) => {
                    row.content_id = key.content_id.clone();
                    Ok(Some(row))
                }
                Some(None) => Ok(None),
                None => Err(SyncError::Metadata("exhausted".into())),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        keys: Vec<ContentKey>,
        upserts: Mutex<Vec<EnrichmentRow>>,
        errors: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl EnrichmentSink for RecordingSink {
        async fn candidates(&self, _: &SourceConfig, _: i64) -> Result<Vec<ContentKey>> {
            Ok(self.keys.clone())
        }

        async fn upsert(&self, row: &EnrichmentRow) -> Result<()> {
            self.upserts.lock().unwrap().push(row.clone());
            Ok(())
        }

        async fn mark_error(&self, key: &ContentKey, reason: &str) -> Result<()> {
            self.errors
                .lock()
                .unwrap()
                .push((key.content_id.clone(), reason.to_string()));
            Ok(())
        }
    }

    fn key(id: &str) -> ContentKey {
        ContentKey {
            content_type: "movie".into(),
            content_source: "tmdb".into(),
            content_id: id.into(),
            title: Some("The Matrix".into()),
            release_year: Some(1999),
        }
    }

    fn worker(sink: Arc<RecordingSink>, lookup: Arc<CannedLookup>) -> EnrichmentWorker {
        let source = SourceConfig {
            name: "bitmagnet_content".into(),
            table_or_view: "v_hermes_content".into(),
            id_field: "content_key".into(),
            text_field: "title".into(),
            tmdb_enrich: true,
            ..Default::default()
        };
        let config = TmdbConfig::default();
        EnrichmentWorker::new(source, sink, lookup, metadata_rate_limiter(&config), &config)
    }

    #[tokio::test]
    async fn test_pass_writes_hits_and_marks_misses() {
        let sink = Arc::new(RecordingSink {
            keys: vec![key("1"), key("2"), key("3")],
            ..Default::default()
        });
        // Popped from the back: key 1 hits, key 2 misses, key 3 errors.
        let lookup = Arc::new(CannedLookup {
            rows: Mutex::new(vec![
                None,
                Some(EnrichmentRow {
                    aka: Some("Matrix".into()),
                    ..Default::default()
                }),
            ]),
        });

        let w = worker(Arc::clone(&sink), lookup);
        let stats = w.run_pass(&CancellationToken::new()).await.unwrap();

        assert_eq!(stats.candidates, 3);
        assert_eq!(stats.enriched, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.failed, 1);

        let upserts = sink.upserts.lock().unwrap();
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].content_id, "1");

        let errors = sink.errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn test_rate_limiter_zero_rps_still_admits() {
        let config = TmdbConfig {
            requests_per_second: 0,
            ..Default::default()
        };
        let limiter = metadata_rate_limiter(&config);
        limiter.until_ready().await;
    }

    #[tokio::test]
    async fn test_pass_stops_on_cancel() {
        let sink = Arc::new(RecordingSink {
            keys: vec![key("1"), key("2")],
            ..Default::default()
        });
        let lookup = Arc::new(CannedLookup {
            rows: Mutex::new(vec![]),
        });

        let w = worker(Arc::clone(&sink), lookup);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = w.run_pass(&cancel).await.unwrap();
        assert_eq!(stats.enriched + stats.misses + stats.failed, 0);
    }
}
