//! Orchestrator tests against a seeded local store and canned collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hermes_config::{SearchConfig, SourceConfig, SourceRegistry};
use hermes_db::{
    BatchCursor, DbError, ExpansionHit, ExpansionLookup, SourceReader, SourceRow,
};
use hermes_embed::{EmbedError, EmbedHealth, EmbedRole, Embedder};
use hermes_search::{QueryExpander, SearchError, SearchOrchestrator, SearchRequest};
use hermes_store::{LocalHnswStore, PointRecord, VectorPayload, VectorStore};

const DIM: usize = 4;

fn torrents_source() -> SourceConfig {
    SourceConfig {
        name: "bitmagnet_torrents".into(),
        table_or_view: "torrents".into(),
        id_field: "info_hash".into(),
        text_field: "name".into(),
        keyword_search: true,
        ..Default::default()
    }
}

/// Embedder routing by substring so cross-language queries map to planned
/// vectors.
struct RuleEmbedder {
    rules: Vec<(&'static str, Vec<f32>)>,
    default: Vec<f32>,
}

#[async_trait]
impl Embedder for RuleEmbedder {
    async fn embed(&self, texts: Vec<String>, _role: EmbedRole) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts
            .iter()
            .map(|text| {
                self.rules
                    .iter()
                    .find(|(needle, _)| text.contains(needle))
                    .map(|(_, v)| v.clone())
                    .unwrap_or_else(|| self.default.clone())
            })
            .collect())
    }

    async fn classify(&self, texts: Vec<String>) -> Result<Vec<f32>, EmbedError> {
        Ok(vec![0.0; texts.len()])
    }

    fn dim(&self) -> usize {
        DIM
    }

    fn version(&self) -> &str {
        "rule@4+norm1"
    }

    async fn check_status(&self) -> EmbedHealth {
        EmbedHealth {
            ok: true,
            version: "rule@4+norm1".into(),
            dim: DIM,
            latency_ms: None,
            error: None,
        }
    }

    async fn warmup(&self) -> Result<(), EmbedError> {
        Ok(())
    }
}

/// Reader over canned rows; optionally fails hydration, counts keyword calls.
struct CannedReader {
    rows: Vec<SourceRow>,
    fail_hydration: bool,
    keyword_calls: AtomicUsize,
}

impl CannedReader {
    fn new(rows: Vec<SourceRow>) -> Self {
        Self {
            rows,
            fail_hydration: false,
            keyword_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SourceReader for CannedReader {
    async fn fetch_batch(
        &self,
        _source: &SourceConfig,
        _cursor: &BatchCursor,
        _limit: i64,
    ) -> Result<Vec<SourceRow>, DbError> {
        Ok(Vec::new())
    }

    async fn fetch_by_ids(
        &self,
        source: &SourceConfig,
        ids: &[String],
    ) -> Result<Vec<SourceRow>, DbError> {
        if self.fail_hydration {
            return Err(DbError::StatementTimeout(0));
        }
        Ok(self
            .rows
            .iter()
            .filter(|row| row.source == source.name && ids.contains(&row.pg_id))
            .cloned()
            .collect())
    }

    async fn keyword_search(
        &self,
        _source: &SourceConfig,
        query: &str,
        limit: i64,
    ) -> Result<Vec<SourceRow>, DbError> {
        self.keyword_calls.fetch_add(1, Ordering::SeqCst);
        let needle = query.to_lowercase();
        Ok(self
            .rows
            .iter()
            .filter(|row| row.text.to_lowercase().contains(&needle))
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

struct CannedExpansion {
    hits: Vec<ExpansionHit>,
    delay_ms: u64,
}

#[async_trait]
impl ExpansionLookup for CannedExpansion {
    async fn search_expansion(
        &self,
        _query: &str,
        _limit: i64,
        _timeout_ms: u64,
    ) -> Result<Vec<ExpansionHit>, DbError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        Ok(self.hits.clone())
    }
}

fn row(pg_id: &str, name: &str) -> SourceRow {
    SourceRow {
        source: "bitmagnet_torrents".into(),
        pg_id: pg_id.into(),
        text: name.into(),
        extras: serde_json::json!({ "name": name, "info_hash": pg_id }),
        updated_at: None,
    }
}

fn payload(pg_id: &str, nsfw: Option<f32>) -> VectorPayload {
    VectorPayload {
        source: "bitmagnet_torrents".into(),
        pg_id: pg_id.into(),
        text_hash: "00".into(),
        embedding_version: "rule@4+norm1".into(),
        nsfw_score: nsfw,
        ..Default::default()
    }
}

struct Harness {
    orchestrator: SearchOrchestrator,
    reader: Arc<CannedReader>,
    _dir: tempfile::TempDir,
}

async fn harness(
    points: Vec<(VectorPayload, Vec<f32>)>,
    rows: Vec<SourceRow>,
    expansion: CannedExpansion,
    expand_timeout_ms: u64,
    fail_hydration: bool,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalHnswStore::new(dir.path(), DIM, 16));
    store.ensure(DIM).await.unwrap();
    store
        .upsert(
            points
                .into_iter()
                .map(|(payload, vector)| PointRecord {
                    id: None,
                    vector,
                    payload,
                })
                .collect(),
        )
        .await
        .unwrap();

    let mut reader = CannedReader::new(rows);
    reader.fail_hydration = fail_hydration;
    let reader = Arc::new(reader);

    let embedder = Arc::new(RuleEmbedder {
        rules: vec![
            // Any text carrying the raw CJK query (the expanded primary
            // query does) points away from the JoJo document.
            ("jojo奇妙冒险", vec![0.0, 1.0, 0.0, 0.0]),
            // The English expansion alone lands exactly on it.
            ("JoJo's Bizarre Adventure", vec![1.0, 0.0, 0.0, 0.0]),
        ],
        default: vec![0.0, 0.0, 1.0, 0.0],
    });

    let registry = SourceRegistry::from_sources(vec![torrents_source()]).unwrap();
    let expander = QueryExpander::new(Arc::new(expansion), expand_timeout_ms);

    let orchestrator = SearchOrchestrator::new(
        registry,
        Arc::clone(&reader) as _,
        store as _,
        embedder as _,
        expander,
        SearchConfig {
            topk: 5,
            fetch_k: 50,
            ..Default::default()
        },
        true,
    );

    Harness {
        orchestrator,
        reader,
        _dir: dir,
    }
}

fn jojo_expansion() -> CannedExpansion {
    CannedExpansion {
        hits: vec![ExpansionHit {
            title: Some("JoJo's Bizarre Adventure".into()),
            aka: Some("JoJo's Bizarre Adventure,ジョジョの奇妙な冒険".into()),
            keywords: None,
        }],
        delay_ms: 0,
    }
}

#[tokio::test]
async fn test_empty_query_rejected() {
    let h = harness(vec![], vec![], jojo_expansion(), 1500, false).await;
    let err = h
        .orchestrator
        .search(&SearchRequest {
            q: "   ".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SearchError::EmptyQuery));
    assert_eq!(err.kind(), "EMPTY_QUERY");
}

#[tokio::test]
async fn test_cross_language_hit_ranks_first() {
    // The JoJo torrent only matches the English expansion vector; a filler
    // row weakly matches both queries.
    let h = harness(
        vec![
            (payload("jojohash", None), vec![1.0, 0.0, 0.0, 0.0]),
            (payload("fillerhash", None), vec![0.5, 0.866, 0.0, 0.0]),
        ],
        vec![
            row("jojohash", "JoJo's Bizarre Adventure S01 1080p"),
            row("fillerhash", "Unrelated Release"),
        ],
        jojo_expansion(),
        1500,
        false,
    )
    .await;

    let response = h
        .orchestrator
        .search(&SearchRequest {
            q: "jojo奇妙冒险".into(),
            topk: Some(5),
            debug: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(!response.results.is_empty());
    let top = &response.results[0];
    assert_eq!(top.source, "bitmagnet_torrents");
    assert_eq!(top.pg_id, "jojohash");
    assert!(top.score >= 0.8, "score {} below 0.8", top.score);

    // The weaker same-query hit ranks below.
    let filler = response
        .results
        .iter()
        .find(|r| r.pg_id == "fillerhash")
        .unwrap();
    assert!(top.score > filler.score);

    // Hydration produced a real title.
    assert!(top.title.contains("JoJo's Bizarre Adventure"));

    let debug = response.debug.unwrap();
    assert!(debug.english_expansion.contains("JoJo's Bizarre Adventure"));
}

#[tokio::test]
async fn test_ascii_query_skips_english_hop() {
    let h = harness(
        vec![(payload("jojohash", None), vec![1.0, 0.0, 0.0, 0.0])],
        vec![row("jojohash", "JoJo's Bizarre Adventure")],
        jojo_expansion(),
        1500,
        false,
    )
    .await;

    let response = h
        .orchestrator
        .search(&SearchRequest {
            q: "jojo bizarre".into(),
            debug: true,
            ..Default::default()
        })
        .await
        .unwrap();

    // Hop timing stays zero for ASCII queries.
    assert_eq!(response.debug.unwrap().timings.english_search, 0);
}

#[tokio::test]
async fn test_expansion_timeout_degrades_silently() {
    let h = harness(
        vec![(payload("jojohash", None), vec![0.0, 1.0, 0.0, 0.0])],
        vec![row("jojohash", "Some Release")],
        CannedExpansion {
            hits: vec![ExpansionHit {
                title: Some("x".into()),
                aka: Some("y".into()),
                keywords: None,
            }],
            delay_ms: 3000,
        },
        500,
        false,
    )
    .await;

    let response = h
        .orchestrator
        .search(&SearchRequest {
            q: "jojo奇妙冒险".into(),
            debug: true,
            ..Default::default()
        })
        .await
        .unwrap();

    // Results still come back, within the expansion budget.
    assert!(!response.results.is_empty());
    let debug = response.debug.unwrap();
    assert!(
        debug.timings.tmdb_expand < 600,
        "expansion took {} ms",
        debug.timings.tmdb_expand
    );
    assert!(debug.warnings.is_empty());
}

#[tokio::test]
async fn test_cursor_pagination_is_stable() {
    let points: Vec<(VectorPayload, Vec<f32>)> = (0..6)
        .map(|i| {
            let weight = 1.0 - (i as f32) * 0.1;
            (
                payload(&format!("hash{i}"), None),
                vec![0.0, weight, (1.0 - weight * weight).sqrt(), 0.0],
            )
        })
        .collect();
    let rows: Vec<SourceRow> = (0..6)
        .map(|i| row(&format!("hash{i}"), &format!("Release {i}")))
        .collect();

    let h = harness(points, rows, jojo_expansion(), 1500, false).await;
    let base = SearchRequest {
        q: "jojo奇妙冒险".into(),
        topk: Some(2),
        tmdb_expand: Some(false),
        ..Default::default()
    };

    let first = h.orchestrator.search(&base).await.unwrap();
    assert_eq!(first.results.len(), 2);
    assert_eq!(first.next_cursor, Some(2));

    let second = h
        .orchestrator
        .search(&SearchRequest {
            cursor: first.next_cursor,
            ..base.clone()
        })
        .await
        .unwrap();
    assert_eq!(second.results.len(), 2);

    let first_ids: Vec<&str> = first.results.iter().map(|r| r.pg_id.as_str()).collect();
    let second_ids: Vec<&str> = second.results.iter().map(|r| r.pg_id.as_str()).collect();
    assert!(first_ids.iter().all(|id| !second_ids.contains(id)));
}

#[tokio::test]
async fn test_exclude_nsfw_filters_scores_above_threshold() {
    let h = harness(
        vec![
            (payload("clean", None), vec![0.0, 1.0, 0.0, 0.0]),
            (payload("dirty", Some(0.95)), vec![0.0, 0.99, 0.14, 0.0]),
        ],
        vec![row("clean", "Clean Release"), row("dirty", "Dirty Release")],
        jojo_expansion(),
        1500,
        false,
    )
    .await;

    let base = SearchRequest {
        q: "jojo奇妙冒险".into(),
        tmdb_expand: Some(false),
        ..Default::default()
    };

    let filtered = h
        .orchestrator
        .search(&SearchRequest {
            exclude_nsfw: Some(true),
            ..base.clone()
        })
        .await
        .unwrap();
    assert!(filtered.results.iter().all(|r| r.pg_id != "dirty"));

    let unfiltered = h
        .orchestrator
        .search(&SearchRequest {
            exclude_nsfw: Some(false),
            ..base
        })
        .await
        .unwrap();
    assert!(unfiltered.results.iter().any(|r| r.pg_id == "dirty"));
}

#[tokio::test]
async fn test_hydration_failure_drops_source_without_5xx() {
    let h = harness(
        vec![(payload("jojohash", None), vec![0.0, 1.0, 0.0, 0.0])],
        vec![row("jojohash", "Some Release")],
        jojo_expansion(),
        1500,
        true,
    )
    .await;

    let response = h
        .orchestrator
        .search(&SearchRequest {
            q: "jojo奇妙冒险".into(),
            tmdb_expand: Some(false),
            debug: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(response.results.is_empty());
    let debug = response.debug.unwrap();
    assert!(debug.warnings.iter().any(|w| w.contains("hydration failed")));
}

#[tokio::test]
async fn test_semantic_path_never_calls_keyword_search() {
    let h = harness(
        vec![(payload("jojohash", None), vec![0.0, 1.0, 0.0, 0.0])],
        vec![row("jojohash", "Some Release")],
        jojo_expansion(),
        1500,
        false,
    )
    .await;

    h.orchestrator
        .search(&SearchRequest {
            q: "jojo奇妙冒险".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    // The source is flagged keyword_search: true, but the semantic path must
    // leave that to /search_keyword.
    assert_eq!(h.reader.keyword_calls.load(Ordering::SeqCst), 0);

    let keyword = h.orchestrator.search_keyword("release", 10).await.unwrap();
    assert_eq!(h.reader.keyword_calls.load(Ordering::SeqCst), 1);
    assert_eq!(keyword.results.len(), 1);
}

#[tokio::test]
async fn test_hydrate_one_found_and_missing() {
    let h = harness(
        vec![],
        vec![row("jojohash", "JoJo's Bizarre Adventure")],
        jojo_expansion(),
        1500,
        false,
    )
    .await;

    let hit = h
        .orchestrator
        .hydrate_one("bitmagnet_torrents", "jojohash")
        .await
        .unwrap();
    assert_eq!(hit.title, "JoJo's Bizarre Adventure");

    let err = h
        .orchestrator
        .hydrate_one("bitmagnet_torrents", "missing")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NOT_FOUND");

    let err = h
        .orchestrator
        .hydrate_one("unknown_source", "x")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NOT_FOUND");
}
