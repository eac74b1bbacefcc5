//! Local HNSW vector store.
//!
//! Persists an HNSW graph (`graph.bin`) next to an append-only JSON-lines
//! sidecar (`payloads.jsonl`) holding `{id, vector, payload}` records and
//! tombstones. The sidecar is the source of truth: on open it is replayed
//! into a map, and the dumped graph is only trusted when its recorded id set
//! matches the replay. A crash mid-upsert therefore recovers to the
//! intersection of graph and log, never to dangling ids.
//!
//! Writes are serialized by a single writer lock; queries run against an
//! immutable snapshot taken at call time, so readers never block on a write.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use hora::core::ann_index::{ANNIndex, SerializableIndex};
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::traits::VectorStore;
use crate::types::{
    point_id, sort_scored, PayloadFilter, PointRecord, ScoredPoint, StoreHealth, VectorPayload,
};

const GRAPH_FILE: &str = "graph.bin";
const LOG_FILE: &str = "payloads.jsonl";
const META_FILE: &str = "meta.json";

/// Compact the sidecar once dead lines outnumber live records by this factor.
const COMPACT_DEAD_RATIO: usize = 2;
/// Never compact below this many dead lines.
const COMPACT_MIN_DEAD: usize = 1024;

/// One sidecar line: an upsert record or a tombstone.
#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vector: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<VectorPayload>,
    #[serde(default)]
    deleted: bool,
}

/// Sidecar metadata validating the dumped graph against the log.
#[derive(Debug, Serialize, Deserialize)]
struct StoreMeta {
    dim: usize,
    count: usize,
    ids_xor: u64,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    vector: Vec<f32>,
    payload: VectorPayload,
}

/// Immutable query snapshot: a built graph plus the records it was built from.
struct Snapshot {
    index: HNSWIndex<f32, usize>,
    records: Arc<BTreeMap<i64, StoredRecord>>,
}

struct Shared {
    records: BTreeMap<i64, StoredRecord>,
    snapshot: Arc<Snapshot>,
    log: File,
    dead_lines: usize,
}

/// Local HNSW store with sidecar payload log.
pub struct LocalHnswStore {
    dir: PathBuf,
    dim: usize,
    ef_search: usize,
    state: RwLock<Option<Shared>>,
}

impl LocalHnswStore {
    /// Create a handle rooted at `dir`. No IO happens until [`ensure`].
    ///
    /// [`ensure`]: VectorStore::ensure
    pub fn new(dir: impl Into<PathBuf>, dim: usize, ef_search: usize) -> Self {
        Self {
            dir: dir.into(),
            dim,
            ef_search,
            state: RwLock::new(None),
        }
    }

    fn graph_path(&self) -> PathBuf {
        self.dir.join(GRAPH_FILE)
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    /// Replay the sidecar into a record map, counting superseded lines.
    fn replay_log(path: &Path) -> Result<(BTreeMap<i64, StoredRecord>, usize)> {
        let mut records = BTreeMap::new();
        let mut dead = 0usize;

        if !path.exists() {
            return Ok((records, 0));
        }

        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: LogEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(e) => {
                    // A torn final line is the expected crash artifact; drop it.
                    warn!("Discarding corrupt sidecar line: {}", e);
                    dead += 1;
                    continue;
                }
            };
            if entry.deleted {
                if records.remove(&entry.id).is_some() {
                    dead += 1;
                }
                dead += 1;
                continue;
            }
            let (Some(vector), Some(payload)) = (entry.vector, entry.payload) else {
                warn!("Sidecar line for id {} lacks vector or payload", entry.id);
                dead += 1;
                continue;
            };
            if records
                .insert(
                    entry.id,
                    StoredRecord {
                        vector,
                        payload,
                    },
                )
                .is_some()
            {
                dead += 1;
            }
        }

        Ok((records, dead))
    }

    fn ids_xor(records: &BTreeMap<i64, StoredRecord>) -> u64 {
        records.keys().fold(0u64, |acc, id| acc ^ (*id as u64))
    }

    /// Build a fresh HNSW graph over the record map.
    fn build_index(dim: usize, records: &BTreeMap<i64, StoredRecord>) -> Result<HNSWIndex<f32, usize>> {
        let mut index = HNSWIndex::new(dim, &HNSWParams::default());
        for (id, record) in records {
            index
                .add(&record.vector, *id as usize)
                .map_err(|e| StoreError::Persistence(format!("index add: {e}")))?;
        }
        if !records.is_empty() {
            index
                .build(Metric::CosineSimilarity)
                .map_err(|e| StoreError::Persistence(format!("index build: {e}")))?;
        }
        Ok(index)
    }

    /// Load the dumped graph when meta agrees with the replayed log;
    /// otherwise rebuild from the log.
    fn open_index(
        &self,
        records: &BTreeMap<i64, StoredRecord>,
    ) -> Result<HNSWIndex<f32, usize>> {
        let meta_path = self.meta_path();
        let graph_path = self.graph_path();

        if meta_path.exists() && graph_path.exists() {
            let meta: StoreMeta = serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?;
            if meta.count == records.len() && meta.ids_xor == Self::ids_xor(records) {
                match HNSWIndex::<f32, usize>::load(graph_path.to_str().unwrap_or_default()) {
                    Ok(index) => {
                        debug!("Loaded HNSW graph with {} points", meta.count);
                        return Ok(index);
                    }
                    Err(e) => warn!("Failed to load graph, rebuilding from sidecar: {}", e),
                }
            } else {
                warn!(
                    "Graph/sidecar divergence (meta {} points, log {}), rebuilding",
                    meta.count,
                    records.len()
                );
            }
        }

        Self::build_index(self.dim, records)
    }

    /// Rebuild the query snapshot from the record map and persist graph and
    /// meta. The sidecar stays authoritative, so dump failures only cost a
    /// rebuild on the next open.
    fn rebuild_snapshot(&self, shared: &mut Shared) -> Result<()> {
        let mut index = Self::build_index(self.dim, &shared.records)?;

        if let Err(e) = index.dump(self.graph_path().to_str().unwrap_or_default()) {
            warn!("Failed to dump HNSW graph: {}", e);
        } else {
            let meta = StoreMeta {
                dim: self.dim,
                count: shared.records.len(),
                ids_xor: Self::ids_xor(&shared.records),
            };
            match serde_json::to_string(&meta) {
                Ok(json) => {
                    if let Err(e) = std::fs::write(self.meta_path(), json) {
                        warn!("Failed to write store meta: {}", e);
                    }
                }
                Err(e) => warn!("Failed to encode store meta: {}", e),
            }
        }

        shared.snapshot = Arc::new(Snapshot {
            index,
            records: Arc::new(shared.records.clone()),
        });
        Ok(())
    }

    /// Rewrite the sidecar from live records, dropping tombstones and
    /// superseded lines.
    fn compact(&self, shared: &mut Shared) -> Result<()> {
        info!(
            "Compacting sidecar: {} live records, {} dead lines",
            shared.records.len(),
            shared.dead_lines
        );
        let tmp_path = self.dir.join(format!("{LOG_FILE}.tmp"));
        {
            let mut tmp = File::create(&tmp_path)?;
            for (id, record) in &shared.records {
                let entry = LogEntry {
                    id: *id,
                    vector: Some(record.vector.clone()),
                    payload: Some(record.payload.clone()),
                    deleted: false,
                };
                serde_json::to_writer(&mut tmp, &entry)?;
                tmp.write_all(b"\n")?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, self.log_path())?;
        shared.log = OpenOptions::new().append(true).open(self.log_path())?;
        shared.dead_lines = 0;
        Ok(())
    }

    fn maybe_compact(&self, shared: &mut Shared) {
        if shared.dead_lines >= COMPACT_MIN_DEAD
            && shared.dead_lines > shared.records.len().saturating_mul(COMPACT_DEAD_RATIO)
        {
            if let Err(e) = self.compact(shared) {
                warn!("Sidecar compaction failed: {}", e);
            }
        }
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let mut dot = 0.0f32;
        let mut na = 0.0f32;
        let mut nb = 0.0f32;
        for (x, y) in a.iter().zip(b.iter()) {
            dot += x * y;
            na += x * x;
            nb += y * y;
        }
        if na == 0.0 || nb == 0.0 {
            return 0.0;
        }
        dot / (na.sqrt() * nb.sqrt())
    }
}

#[async_trait]
impl VectorStore for LocalHnswStore {
    async fn ensure(&self, dim: usize) -> Result<()> {
        if dim != self.dim {
            return Err(StoreError::DimMismatch {
                existing: self.dim,
                configured: dim,
            });
        }

        let mut guard = self.state.write().await;
        if guard.is_some() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.dir)?;

        // A persisted store created at another dimension is unusable.
        let meta_path = self.meta_path();
        if meta_path.exists() {
            let meta: StoreMeta = serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?;
            if meta.dim != dim {
                return Err(StoreError::DimMismatch {
                    existing: meta.dim,
                    configured: dim,
                });
            }
        }

        let (records, dead_lines) = Self::replay_log(&self.log_path())?;
        let index = self.open_index(&records)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;

        info!(
            "Opened local HNSW store at {:?} ({} points, dim {})",
            self.dir,
            records.len(),
            dim
        );

        let snapshot = Arc::new(Snapshot {
            records: Arc::new(records.clone()),
            index,
        });
        *guard = Some(Shared {
            records,
            snapshot,
            log,
            dead_lines,
        });
        Ok(())
    }

    async fn upsert(&self, batch: Vec<PointRecord>) -> Result<Vec<i64>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut guard = self.state.write().await;
        let shared = guard.as_mut().ok_or(StoreError::NotReady)?;

        // Validate and assign ids up front so a bad record fails the whole
        // batch before anything is written.
        let mut ids = Vec::with_capacity(batch.len());
        let mut buffer = String::new();
        for record in &batch {
            if record.vector.len() != self.dim {
                return Err(StoreError::BadVector {
                    expected: self.dim,
                    actual: record.vector.len(),
                });
            }
            let id = record
                .id
                .unwrap_or_else(|| point_id(&record.payload.source, &record.payload.pg_id));
            let entry = LogEntry {
                id,
                vector: Some(record.vector.clone()),
                payload: Some(record.payload.clone()),
                deleted: false,
            };
            buffer.push_str(&serde_json::to_string(&entry)?);
            buffer.push('\n');
            ids.push(id);
        }

        shared.log.write_all(buffer.as_bytes())?;
        shared.log.sync_data()?;

        for (record, id) in batch.into_iter().zip(ids.iter()) {
            let replaced = shared.records.insert(
                *id,
                StoredRecord {
                    vector: record.vector,
                    payload: record.payload,
                },
            );
            if replaced.is_some() {
                shared.dead_lines += 1;
            }
        }

        self.rebuild_snapshot(shared)?;
        self.maybe_compact(shared);

        debug!("Upserted {} points into local store", ids.len());
        Ok(ids)
    }

    async fn delete(&self, ids: Vec<i64>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut guard = self.state.write().await;
        let shared = guard.as_mut().ok_or(StoreError::NotReady)?;

        let mut buffer = String::new();
        let mut removed = 0usize;
        for id in &ids {
            if shared.records.contains_key(id) {
                let entry = LogEntry {
                    id: *id,
                    vector: None,
                    payload: None,
                    deleted: true,
                };
                buffer.push_str(&serde_json::to_string(&entry)?);
                buffer.push('\n');
                removed += 1;
            }
        }
        if removed == 0 {
            return Ok(());
        }

        shared.log.write_all(buffer.as_bytes())?;
        shared.log.sync_data()?;

        for id in ids {
            if shared.records.remove(&id).is_some() {
                shared.dead_lines += 2;
            }
        }

        self.rebuild_snapshot(shared)?;
        self.maybe_compact(shared);
        Ok(())
    }

    async fn query(
        &self,
        vector: Vec<f32>,
        k: usize,
        filter: Option<PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>> {
        if vector.len() != self.dim {
            return Err(StoreError::BadVector {
                expected: self.dim,
                actual: vector.len(),
            });
        }

        // Clone the snapshot handle and release the lock before searching.
        let snapshot = {
            let guard = self.state.read().await;
            let shared = guard.as_ref().ok_or(StoreError::NotReady)?;
            Arc::clone(&shared.snapshot)
        };

        if snapshot.records.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        // The graph cannot pre-filter on payload, so over-fetch when a
        // filter is present and trim after the predicate pass.
        let filter = filter.unwrap_or_default();
        let fetch = if filter.is_empty() {
            k
        } else {
            k.saturating_mul(4).max(self.ef_search)
        }
        .min(snapshot.records.len());

        let candidate_ids = snapshot.index.search(&vector, fetch);

        let mut hits = Vec::with_capacity(candidate_ids.len());
        for raw_id in candidate_ids {
            let id = raw_id as i64;
            let Some(record) = snapshot.records.get(&id) else {
                continue;
            };
            if !filter.matches(&record.payload) {
                continue;
            }
            hits.push(ScoredPoint {
                id,
                score: Self::cosine(&vector, &record.vector),
                payload: record.payload.clone(),
            });
        }

        sort_scored(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn count(&self) -> Result<u64> {
        let guard = self.state.read().await;
        let shared = guard.as_ref().ok_or(StoreError::NotReady)?;
        Ok(shared.records.len() as u64)
    }

    async fn health(&self) -> Result<StoreHealth> {
        let guard = self.state.read().await;
        let points = guard.as_ref().map(|s| s.records.len() as u64).unwrap_or(0);
        Ok(StoreHealth {
            ok: guard.is_some(),
            backend: "hnsw",
            points,
            dim: self.dim,
        })
    }
}
