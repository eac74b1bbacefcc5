//! Incremental sync pipeline.
//!
//! One cycle per source: resume at the committed watermark, pull ordered
//! batches, diff each row's content hash against the state table, embed what
//! is new or changed, upsert vectors, then commit state in watermark order.
//! Replaying a batch whose hashes match is a no-op, so every step is safe to
//! retry after a crash.
//!
//! Per row the flow is absent -> pending -> embedded -> indexed ->
//! committed; rows that fail individually land in `last_error` and retry on
//! the next cycle as long as their hash still differs.

use std::sync::Arc;

use hermes_config::SourceConfig;
use hermes_db::{BatchCursor, SourceReader, SourceRow, StateStore, SyncEntry};
use hermes_embed::{text, EmbedRole, Embedder};
use hermes_store::{PointRecord, VectorPayload, VectorStore};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Counters for one sync cycle.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CycleStats {
    /// Rows read from the source
    pub scanned: usize,
    /// Rows whose hash and version already matched
    pub unchanged: usize,
    /// Rows embedded and committed this cycle
    pub embedded: usize,
    /// Rows that failed individually
    pub failed: usize,
}

impl CycleStats {
    fn add(&mut self, other: CycleStats) {
        self.scanned += other.scanned;
        self.unchanged += other.unchanged;
        self.embedded += other.embedded;
        self.failed += other.failed;
    }
}

/// Per-source sync pipeline.
///
/// Reader -> embedder -> vector store -> state store is a DAG; the pipeline
/// owns no state beyond its collaborators and can be dropped and rebuilt at
/// any batch boundary.
pub struct SyncPipeline {
    source: SourceConfig,
    reader: Arc<dyn SourceReader>,
    state: Arc<dyn StateStore>,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
}

impl SyncPipeline {
    pub fn new(
        source: SourceConfig,
        reader: Arc<dyn SourceReader>,
        state: Arc<dyn StateStore>,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            source,
            reader,
            state,
            store,
            embedder,
        }
    }

    /// Source this pipeline serves.
    pub fn source_name(&self) -> &str {
        &self.source.name
    }

    /// Run one full cycle: batches until the reader returns a short batch.
    ///
    /// Honors `cancel` at batch boundaries so the current batch always
    /// commits before the worker exits.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleStats> {
        // A version bump invalidates everything already embedded; drop the
        // watermark and rescan so old rows get re-embedded too.
        let version = self.embedder.version();
        let watermark = if self
            .state
            .stale_version_exists(&self.source.name, version)
            .await?
        {
            info!(
                source = %self.source.name,
                version,
                "Embedding version changed, full rescan"
            );
            None
        } else {
            self.state.max_updated_at(&self.source.name).await?
        };
        let limit = self.source.batch_size as i64;
        let mut cursor = BatchCursor::start(watermark);
        let mut stats = CycleStats::default();

        loop {
            let rows = self
                .reader
                .fetch_batch(&self.source, &cursor, limit)
                .await?;
            let fetched = rows.len();
            if let Some(last) = rows.last() {
                cursor.advance(last);
            }

            stats.add(self.process_batch(rows).await?);

            if fetched < limit as usize || cancel.is_cancelled() {
                break;
            }
        }

        info!(
            source = %self.source.name,
            scanned = stats.scanned,
            unchanged = stats.unchanged,
            embedded = stats.embedded,
            failed = stats.failed,
            "Sync cycle complete"
        );
        Ok(stats)
    }

    /// Run cycles until cancelled, sleeping `idle_seconds` between them.
    ///
    /// TODO: schedule a compaction pass that diffs state against upstream ids
    /// and deletes vectors for rows that disappeared; deletions are currently
    /// not propagated.
    pub async fn run_loop(&self, cancel: CancellationToken, idle_seconds: u64) {
        loop {
            match self.run_cycle(&cancel).await {
                Ok(_) => {}
                Err(e) => warn!(source = %self.source.name, "Sync cycle failed: {}", e),
            }
            if cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_secs(idle_seconds)) => {}
            }
        }
        info!(source = %self.source.name, "Sync worker stopped");
    }

    /// Diff, embed, upsert, and commit one batch.
    async fn process_batch(&self, rows: Vec<SourceRow>) -> Result<CycleStats> {
        let mut stats = CycleStats {
            scanned: rows.len(),
            ..Default::default()
        };
        if rows.is_empty() {
            return Ok(stats);
        }

        let version = self.embedder.version().to_string();

        // Hash every row, flagging empties as per-row failures.
        let mut pending: Vec<(SourceRow, String)> = Vec::with_capacity(rows.len());
        for row in rows {
            if row.text.trim().is_empty() {
                self.state
                    .mark_error(&row.source, &row.pg_id, "empty search text")
                    .await?;
                stats.failed += 1;
                continue;
            }
            let hash = text::content_hash(&row.text);
            pending.push((row, hash));
        }

        let ids: Vec<String> = pending.iter().map(|(row, _)| row.pg_id.clone()).collect();
        let existing = self.state.get_many(&self.source.name, &ids).await?;

        // Partition: unchanged rows drop out here, which is what makes a
        // replayed batch free of embedding calls.
        let mut to_embed: Vec<(SourceRow, String, Option<i64>)> = Vec::new();
        for (row, hash) in pending {
            match existing.get(&row.pg_id) {
                Some(entry) if entry.is_current(&hash, &version) => {
                    stats.unchanged += 1;
                }
                Some(entry) => to_embed.push((row, hash, entry.vector_id)),
                None => to_embed.push((row, hash, None)),
            }
        }
        if to_embed.is_empty() {
            return Ok(stats);
        }

        debug!(
            source = %self.source.name,
            count = to_embed.len(),
            "Embedding new and changed rows"
        );

        let texts: Vec<String> = to_embed
            .iter()
            .map(|(row, _, _)| text::normalize(&row.text))
            .collect();
        let vectors = self.embedder.embed(texts.clone(), EmbedRole::Document).await?;
        if vectors.len() != to_embed.len() {
            return Err(hermes_embed::EmbedError::BadResponse(format!(
                "expected {} vectors, got {}",
                to_embed.len(),
                vectors.len()
            ))
            .into());
        }

        // Classification is best-effort; rows without a score stay null.
        let nsfw_scores: Vec<Option<f32>> = match self.embedder.classify(texts).await {
            Ok(scores) if scores.len() == to_embed.len() => {
                scores.into_iter().map(Some).collect()
            }
            Ok(_) | Err(_) => {
                debug!(source = %self.source.name, "NSFW classification unavailable");
                vec![None; to_embed.len()]
            }
        };

        // Vector upsert is atomic per batch; on failure the state table is
        // untouched and the next cycle retries from the same watermark.
        let mut points = Vec::with_capacity(to_embed.len());
        for (((row, hash, vector_id), vector), nsfw) in
            to_embed.iter().zip(vectors).zip(&nsfw_scores)
        {
            points.push(PointRecord {
                id: *vector_id,
                vector,
                payload: build_payload(&self.source, row, hash, &version, *nsfw),
            });
        }
        let assigned = self.store.upsert(points).await?;

        let mut entries: Vec<SyncEntry> = to_embed
            .iter()
            .zip(assigned)
            .zip(nsfw_scores)
            .map(|(((row, hash, _), vector_id), nsfw_score)| SyncEntry {
                source: row.source.clone(),
                pg_id: row.pg_id.clone(),
                text_hash: hash.clone(),
                embedding_version: version.clone(),
                vector_id: Some(vector_id),
                nsfw_score,
                updated_at: row.updated_at,
                last_error: None,
            })
            .collect();

        // Commit in watermark order so max_updated_at never jumps ahead of
        // an uncommitted row.
        entries.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.pg_id.cmp(&b.pg_id))
        });
        self.state.upsert_many(&entries).await?;

        stats.embedded += entries.len();
        Ok(stats)
    }
}

/// Build the vector payload for a row.
fn build_payload(
    source: &SourceConfig,
    row: &SourceRow,
    text_hash: &str,
    embedding_version: &str,
    nsfw_score: Option<f32>,
) -> VectorPayload {
    let extras = &row.extras;
    let tmdb_id = extras
        .get("tmdb_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| extras.get("tmdb_id").and_then(Value::as_i64).map(|i| i.to_string()));

    VectorPayload {
        source: row.source.clone(),
        pg_id: row.pg_id.clone(),
        text_hash: text_hash.to_string(),
        embedding_version: embedding_version.to_string(),
        nsfw_score,
        content_type: source
            .content_type
            .clone()
            .or_else(|| extras.get("content_type").and_then(Value::as_str).map(str::to_string)),
        has_tmdb: Some(tmdb_id.is_some()),
        tmdb_id,
        size: extras.get("size").and_then(Value::as_i64),
        languages: string_list(extras.get("languages")),
        subtitles: string_list(extras.get("subtitles")),
        genres: string_list(extras.get("genres")).or_else(|| {
            // Enriched views expose genres as a comma-joined string.
            extras
                .get("genres")
                .and_then(Value::as_str)
                .map(|s| {
                    s.split(',')
                        .map(|g| g.trim().to_string())
                        .filter(|g| !g.is_empty())
                        .collect::<Vec<_>>()
                })
                .filter(|v| !v.is_empty())
        }),
    }
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    match value {
        Some(Value::Array(items)) => {
            let list: Vec<String> = items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            (!list.is_empty()).then_some(list)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(extras: Value) -> SourceRow {
        SourceRow {
            source: "bitmagnet_torrents".into(),
            pg_id: "abc".into(),
            text: "The Matrix".into(),
            extras,
            updated_at: None,
        }
    }

    #[test]
    fn test_build_payload_extracts_extras() {
        let source = SourceConfig {
            name: "bitmagnet_torrents".into(),
            table_or_view: "torrents".into(),
            id_field: "info_hash".into(),
            text_field: "name".into(),
            content_type: Some("movie".into()),
            ..Default::default()
        };
        let row = row(json!({
            "size": 734003200_i64,
            "languages": ["en", "fr"],
            "tmdb_id": 603,
            "genres": "Action, Sci-Fi",
        }));

        let payload = build_payload(&source, &row, "hash", "v@768+norm1", Some(0.1));
        assert_eq!(payload.size, Some(734003200));
        assert_eq!(payload.languages, Some(vec!["en".into(), "fr".into()]));
        assert_eq!(payload.tmdb_id, Some("603".into()));
        assert_eq!(payload.has_tmdb, Some(true));
        assert_eq!(payload.content_type, Some("movie".into()));
        assert_eq!(
            payload.genres,
            Some(vec!["Action".to_string(), "Sci-Fi".to_string()])
        );
    }

    #[test]
    fn test_build_payload_without_tmdb() {
        let source = SourceConfig::default();
        let payload = build_payload(&source, &row(json!({})), "h", "v", None);
        assert_eq!(payload.has_tmdb, Some(false));
        assert!(payload.tmdb_id.is_none());
        assert!(payload.genres.is_none());
    }
}
