//! Shared in-memory collaborators for pipeline tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hermes_config::SourceConfig;
use hermes_db::{
    BatchCursor, DbError, SourceReader, SourceRow, SourceSyncStats, StateStore, SyncEntry,
};
use hermes_embed::{text, EmbedError, EmbedHealth, EmbedRole, Embedder};
use hermes_store::{PayloadFilter, PointRecord, ScoredPoint, StoreError, StoreHealth, VectorStore};

pub fn torrents_source() -> SourceConfig {
    SourceConfig {
        name: "bitmagnet_torrents".into(),
        table_or_view: "torrents".into(),
        id_field: "info_hash".into(),
        text_field: "name".into(),
        updated_at_field: Some("updated_at".into()),
        batch_size: 100,
        ..Default::default()
    }
}

pub fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

pub fn source_row(pg_id: &str, text: &str, seconds: i64) -> SourceRow {
    SourceRow {
        source: "bitmagnet_torrents".into(),
        pg_id: pg_id.into(),
        text: text.into(),
        extras: serde_json::json!({}),
        updated_at: Some(ts(seconds)),
    }
}

/// In-memory reader mirroring the Postgres keyset semantics.
pub struct MemoryReader {
    pub rows: Mutex<Vec<SourceRow>>,
}

impl MemoryReader {
    pub fn new(rows: Vec<SourceRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    pub fn replace(&self, rows: Vec<SourceRow>) {
        *self.rows.lock().unwrap() = rows;
    }
}

#[async_trait]
impl SourceReader for MemoryReader {
    async fn fetch_batch(
        &self,
        _source: &SourceConfig,
        cursor: &BatchCursor,
        limit: i64,
    ) -> Result<Vec<SourceRow>, DbError> {
        let mut rows = self.rows.lock().unwrap().clone();
        rows.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.pg_id.cmp(&b.pg_id))
        });

        let filtered: Vec<SourceRow> = rows
            .into_iter()
            .filter(|row| match cursor {
                BatchCursor::Start { watermark: None } => true,
                BatchCursor::Start {
                    watermark: Some(wm),
                } => row.updated_at.map(|u| u >= *wm).unwrap_or(true),
                BatchCursor::After { updated_at, pg_id } => {
                    (row.updated_at, row.pg_id.as_str()) > (*updated_at, pg_id.as_str())
                }
            })
            .take(limit as usize)
            .collect();
        Ok(filtered)
    }

    async fn fetch_by_ids(
        &self,
        _source: &SourceConfig,
        ids: &[String],
    ) -> Result<Vec<SourceRow>, DbError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|row| ids.contains(&row.pg_id))
            .cloned()
            .collect())
    }

    async fn keyword_search(
        &self,
        _source: &SourceConfig,
        query: &str,
        limit: i64,
    ) -> Result<Vec<SourceRow>, DbError> {
        let needle = query.to_lowercase();
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|row| row.text.to_lowercase().contains(&needle))
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

/// In-memory state store keyed by `(source, pg_id)`.
#[derive(Default)]
pub struct MemoryState {
    pub entries: Mutex<HashMap<(String, String), SyncEntry>>,
}

impl MemoryState {
    pub fn get(&self, source: &str, pg_id: &str) -> Option<SyncEntry> {
        self.entries
            .lock()
            .unwrap()
            .get(&(source.to_string(), pg_id.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[async_trait]
impl StateStore for MemoryState {
    async fn get_many(
        &self,
        source: &str,
        ids: &[String],
    ) -> Result<HashMap<String, SyncEntry>, DbError> {
        let entries = self.entries.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| {
                entries
                    .get(&(source.to_string(), id.clone()))
                    .map(|e| (id.clone(), e.clone()))
            })
            .collect())
    }

    async fn upsert_many(&self, new_entries: &[SyncEntry]) -> Result<(), DbError> {
        let mut entries = self.entries.lock().unwrap();
        for entry in new_entries {
            entries.insert(
                (entry.source.clone(), entry.pg_id.clone()),
                entry.clone(),
            );
        }
        Ok(())
    }

    async fn mark_error(&self, source: &str, pg_id: &str, error: &str) -> Result<(), DbError> {
        let mut entries = self.entries.lock().unwrap();
        let key = (source.to_string(), pg_id.to_string());
        entries
            .entry(key)
            .or_insert_with(|| SyncEntry {
                source: source.into(),
                pg_id: pg_id.into(),
                text_hash: String::new(),
                embedding_version: String::new(),
                vector_id: None,
                nsfw_score: None,
                updated_at: None,
                last_error: None,
            })
            .last_error = Some(error.to_string());
        Ok(())
    }

    async fn max_updated_at(&self, source: &str) -> Result<Option<DateTime<Utc>>, DbError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .values()
            .filter(|e| e.source == source)
            .filter_map(|e| e.updated_at)
            .max())
    }

    async fn stale_version_exists(&self, source: &str, version: &str) -> Result<bool, DbError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .values()
            .any(|e| e.source == source && !e.embedding_version.is_empty() && e.embedding_version != version))
    }

    async fn missing_since(
        &self,
        source: &str,
        _since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, DbError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .values()
            .filter(|e| e.source == source && e.vector_id.is_none())
            .map(|e| e.pg_id.clone())
            .take(limit as usize)
            .collect())
    }

    async fn source_stats(&self, source: &str) -> Result<SourceSyncStats, DbError> {
        let entries = self.entries.lock().unwrap();
        let rows: Vec<&SyncEntry> = entries.values().filter(|e| e.source == source).collect();
        Ok(SourceSyncStats {
            total: rows.len() as i64,
            synced: rows.iter().filter(|e| e.vector_id.is_some()).count() as i64,
            errors: rows.iter().filter(|e| e.last_error.is_some()).count() as i64,
            max_updated_at: rows.iter().filter_map(|e| e.updated_at).max(),
            last_sync_at: None,
        })
    }
}

/// Deterministic embedder that counts invocations and embedded texts.
pub struct CountingEmbedder {
    pub calls: AtomicUsize,
    pub texts_embedded: AtomicUsize,
    pub version: String,
    pub dim: usize,
}

impl CountingEmbedder {
    pub fn new(version: &str, dim: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            texts_embedded: AtomicUsize::new(0),
            version: version.into(),
            dim,
        }
    }

    /// Deterministic unit vector derived from the text hash.
    pub fn vector_for(&self, input: &str) -> Vec<f32> {
        let hash = text::content_hash(input);
        let mut v: Vec<f32> = hash
            .bytes()
            .take(self.dim)
            .map(|b| f32::from(b) / 255.0 + 0.01)
            .collect();
        v.resize(self.dim, 0.5);
        v
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    async fn embed(
        &self,
        texts: Vec<String>,
        _role: EmbedRole,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    async fn classify(&self, texts: Vec<String>) -> Result<Vec<f32>, EmbedError> {
        Ok(vec![0.1; texts.len()])
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn check_status(&self) -> EmbedHealth {
        EmbedHealth {
            ok: true,
            version: self.version.clone(),
            dim: self.dim,
            latency_ms: None,
            error: None,
        }
    }

    async fn warmup(&self) -> Result<(), EmbedError> {
        Ok(())
    }
}

/// Vector store wrapper that can be switched into a failing state.
pub struct FlakyStore<S> {
    pub inner: S,
    pub fail_upserts: AtomicBool,
}

impl<S> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_upserts: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_upserts.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: VectorStore> VectorStore for FlakyStore<S> {
    async fn ensure(&self, dim: usize) -> Result<(), StoreError> {
        self.inner.ensure(dim).await
    }

    async fn upsert(&self, batch: Vec<PointRecord>) -> Result<Vec<i64>, StoreError> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("backend down".into()));
        }
        self.inner.upsert(batch).await
    }

    async fn delete(&self, ids: Vec<i64>) -> Result<(), StoreError> {
        self.inner.delete(ids).await
    }

    async fn query(
        &self,
        vector: Vec<f32>,
        k: usize,
        filter: Option<PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>, StoreError> {
        self.inner.query(vector, k, filter).await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        self.inner.count().await
    }

    async fn health(&self) -> Result<StoreHealth, StoreError> {
        self.inner.health().await
    }
}
