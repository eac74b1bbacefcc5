//! Cross-language search orchestrator.
//!
//! One request flows clean -> expand -> embed -> primary vector query ->
//! optional cross-language hop -> merge -> paginate -> hydrate. Each stage is
//! timed; expansion and the secondary query degrade silently, embedding and
//! primary store failures surface as errors for the HTTP layer to map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hermes_config::{SearchConfig, SourceConfig, SourceRegistry};
use hermes_db::{SourceReader, SourceRow};
use hermes_embed::{EmbedError, EmbedRole, Embedder};
use hermes_store::{PayloadFilter, ScoredPoint, VectorStore};
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{Result, SearchError};
use crate::expand::{Expansion, QueryExpander};

/// Genre words recognized inside queries and turned into payload filters.
static KNOWN_GENRES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "action", "adventure", "animation", "comedy", "crime", "documentary", "drama", "family",
        "fantasy", "history", "horror", "music", "mystery", "romance", "sci-fi", "thriller",
        "war", "western",
    ]
});

/// One search request, normalized from query parameters.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub q: String,
    pub topk: Option<usize>,
    pub fetch_k: Option<usize>,
    pub exclude_nsfw: Option<bool>,
    pub tmdb_only: bool,
    pub size_min_bytes: Option<i64>,
    pub tmdb_expand: Option<bool>,
    pub lite: bool,
    pub debug: bool,
    pub cursor: Option<usize>,
}

/// One hydrated result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub source: String,
    pub pg_id: String,
    pub title: String,
    pub score: f32,
    pub metadata: Value,
}

/// Per-stage timings in milliseconds, reported when `debug=true`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DebugTimings {
    pub tmdb_expand: u64,
    pub embed: u64,
    pub qdrant: u64,
    pub english_search: u64,
    pub pg_loop: u64,
    pub total: u64,
    pub pg_sources: Vec<PgSourceTiming>,
}

/// Per-source hydration timing.
#[derive(Debug, Clone, Serialize)]
pub struct PgSourceTiming {
    pub source: String,
    pub pg_fetch_ms: u64,
}

/// Debug block attached to responses when requested.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DebugInfo {
    #[serde(flatten)]
    pub timings: DebugTimings,
    pub expanded_query: String,
    pub english_expansion: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Search response body.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<usize>,
    #[serde(rename = "_debug", skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugInfo>,
}

/// Cross-language hybrid search over the vector store plus hydration.
pub struct SearchOrchestrator {
    registry: SourceRegistry,
    reader: Arc<dyn SourceReader>,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    expander: QueryExpander,
    config: SearchConfig,
    expand_default: bool,
}

impl SearchOrchestrator {
    pub fn new(
        registry: SourceRegistry,
        reader: Arc<dyn SourceReader>,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        expander: QueryExpander,
        config: SearchConfig,
        expand_default: bool,
    ) -> Self {
        Self {
            registry,
            reader,
            store,
            embedder,
            expander,
            config,
            expand_default,
        }
    }

    /// Run the full semantic search path.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let started = Instant::now();
        let mut timings = DebugTimings::default();
        let mut warnings: Vec<String> = Vec::new();

        let cleaned = clean_query(&request.q);
        if cleaned.is_empty() {
            return Err(SearchError::EmptyQuery);
        }

        let topk = request.topk.unwrap_or(self.config.topk).max(1);
        let fetch_k = request
            .fetch_k
            .unwrap_or(self.config.fetch_k)
            .max(topk);

        // Stage: query expansion (degrades silently).
        let expand = request.tmdb_expand.unwrap_or(self.expand_default);
        let stage = Instant::now();
        let expansion = if expand {
            self.expander.expand(&cleaned).await
        } else {
            Expansion::unexpanded(&cleaned)
        };
        timings.tmdb_expand = stage.elapsed().as_millis() as u64;

        // Stage: query embedding. Failure here is fatal for the request.
        let stage = Instant::now();
        let primary_vector = self
            .embed_query(expansion.expanded_query.clone())
            .await?;
        timings.embed = stage.elapsed().as_millis() as u64;

        // Stage: primary vector query.
        let filter = self.primary_filter(request, &cleaned);
        let stage = Instant::now();
        let primary = self
            .store
            .query(primary_vector, fetch_k, Some(filter))
            .await?;
        timings.qdrant = stage.elapsed().as_millis() as u64;

        // Stage: cross-language hop. Raw torrent rows carry no enrichment
        // metadata, so the secondary query keeps only the size bound.
        let mut secondary = Vec::new();
        if !cleaned.is_ascii() && !expansion.english_expansion.is_empty() {
            let stage = Instant::now();
            match self.english_hop(&expansion, request, fetch_k).await {
                Ok(hits) => secondary = hits,
                Err(e) => {
                    debug!("Cross-language hop failed: {}", e);
                    warnings.push(format!("english_search failed: {e}"));
                }
            }
            timings.english_search = stage.elapsed().as_millis() as u64;
        }

        // Merge, paginate.
        let merged = merge_hits(primary, secondary, fetch_k);
        let offset = request.cursor.unwrap_or(0);
        let page: Vec<ScoredPoint> = merged.iter().skip(offset).take(topk).cloned().collect();
        let next_cursor =
            (offset + page.len() < merged.len()).then_some(offset + page.len());

        // Stage: hydration.
        let stage = Instant::now();
        let results = if request.lite {
            page.iter().map(lite_hit).collect()
        } else {
            self.hydrate(&page, &mut timings, &mut warnings).await
        };
        timings.pg_loop = stage.elapsed().as_millis() as u64;
        timings.total = started.elapsed().as_millis() as u64;

        info!(
            q = %cleaned,
            hits = results.len(),
            total_ms = timings.total,
            "Search complete"
        );

        let debug_info = request.debug.then(|| DebugInfo {
            timings,
            expanded_query: expansion.expanded_query.clone(),
            english_expansion: expansion.english_expansion.clone(),
            warnings,
        });

        Ok(SearchResponse {
            results,
            next_cursor,
            debug: debug_info,
        })
    }

    /// Per-source ILIKE fallback with the same hydration shape.
    ///
    /// Only sources flagged `keyword_search: true` participate; the semantic
    /// path never calls this.
    pub async fn search_keyword(&self, query: &str, topk: usize) -> Result<SearchResponse> {
        let cleaned = clean_query(query);
        if cleaned.is_empty() {
            return Err(SearchError::EmptyQuery);
        }

        let mut results = Vec::new();
        for source in self.registry.iter().filter(|s| s.keyword_search) {
            let rows = self
                .reader
                .keyword_search(source, &cleaned, topk as i64)
                .await?;
            results.extend(rows.iter().map(|row| hydrated_hit(source, row, 1.0)));
        }
        results.truncate(topk);

        Ok(SearchResponse {
            results,
            next_cursor: None,
            debug: None,
        })
    }

    /// Single-record lookup for `/hydrate`.
    pub async fn hydrate_one(&self, source_name: &str, pg_id: &str) -> Result<SearchHit> {
        let source = self
            .registry
            .get(source_name)
            .ok_or_else(|| SearchError::UnknownSource(source_name.to_string()))?;
        let rows = self
            .reader
            .fetch_by_ids(source, std::slice::from_ref(&pg_id.to_string()))
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| SearchError::Db(hermes_db::DbError::NotFound {
                source_name: source_name.to_string(),
                pg_id: pg_id.to_string(),
            }))?;
        Ok(hydrated_hit(source, &row, 1.0))
    }

    async fn embed_query(&self, text: String) -> Result<Vec<f32>> {
        let budget = Duration::from_secs(self.config.gpu_timeout_seconds.max(1));
        let embedded = tokio::time::timeout(
            budget,
            self.embedder.embed(vec![text], EmbedRole::Query),
        )
        .await
        .map_err(|_| EmbedError::Unavailable("query embedding timed out".into()))??;
        embedded
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::BadResponse("no query vector returned".into()).into())
    }

    fn primary_filter(&self, request: &SearchRequest, cleaned: &str) -> PayloadFilter {
        let exclude_nsfw = request
            .exclude_nsfw
            .unwrap_or(self.config.exclude_nsfw_default);
        PayloadFilter {
            nsfw_below: exclude_nsfw.then_some(self.config.nsfw_threshold),
            tmdb_only: request.tmdb_only,
            size_min: request.size_min_bytes,
            genres_any: extract_genres(cleaned),
        }
    }

    async fn english_hop(
        &self,
        expansion: &Expansion,
        request: &SearchRequest,
        fetch_k: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let vector = self.embed_query(expansion.english_expansion.clone()).await?;
        let filter = PayloadFilter {
            size_min: request.size_min_bytes,
            ..Default::default()
        };
        Ok(self.store.query(vector, fetch_k, Some(filter)).await?)
    }

    /// Group page hits by source and re-read their rows, preserving score
    /// order across sources. A failing source drops its hits with a warning;
    /// sources missing from the registry are logged and skipped.
    async fn hydrate(
        &self,
        page: &[ScoredPoint],
        timings: &mut DebugTimings,
        warnings: &mut Vec<String>,
    ) -> Vec<SearchHit> {
        let mut by_source: HashMap<&str, Vec<&ScoredPoint>> = HashMap::new();
        for point in page {
            by_source.entry(&point.payload.source).or_default().push(point);
        }

        let mut rows_by_key: HashMap<(String, String), SourceRow> = HashMap::new();
        for (source_name, points) in by_source {
            let Some(source) = self.registry.get(source_name) else {
                warn!("Skipping hits from unregistered source '{}'", source_name);
                continue;
            };
            let ids: Vec<String> = points.iter().map(|p| p.payload.pg_id.clone()).collect();

            let fetch_started = Instant::now();
            match self.reader.fetch_by_ids(source, &ids).await {
                Ok(rows) => {
                    for row in rows {
                        rows_by_key.insert((row.source.clone(), row.pg_id.clone()), row);
                    }
                }
                Err(e) => {
                    warn!("Hydration failed for source '{}': {}", source_name, e);
                    warnings.push(format!("hydration failed for {source_name}: {e}"));
                }
            }
            timings.pg_sources.push(PgSourceTiming {
                source: source_name.to_string(),
                pg_fetch_ms: fetch_started.elapsed().as_millis() as u64,
            });
        }

        // Walk the page in merge order so scores stay descending.
        page.iter()
            .filter_map(|point| {
                let key = (point.payload.source.clone(), point.payload.pg_id.clone());
                let source = self.registry.get(&point.payload.source)?;
                rows_by_key
                    .get(&key)
                    .map(|row| hydrated_hit(source, row, point.score))
            })
            .collect()
    }
}

/// Collapse whitespace and trim; an empty result rejects the request.
pub fn clean_query(q: &str) -> String {
    q.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Pull known genre words out of a query.
pub fn extract_genres(query: &str) -> Vec<String> {
    let lowered = query.to_lowercase();
    KNOWN_GENRES
        .iter()
        .filter(|genre| {
            lowered
                .split_whitespace()
                .any(|word| word == **genre)
        })
        .map(|genre| genre.to_string())
        .collect()
}

/// Merge primary and secondary hits: dedupe by `(source, pg_id)` keeping the
/// max score, sort by score descending with ascending-id tie-break, truncate
/// to `fetch_k`. Deterministic regardless of which query finished first.
pub fn merge_hits(
    primary: Vec<ScoredPoint>,
    secondary: Vec<ScoredPoint>,
    fetch_k: usize,
) -> Vec<ScoredPoint> {
    let mut best: HashMap<(String, String), ScoredPoint> = HashMap::new();
    for point in primary.into_iter().chain(secondary) {
        let key = (point.payload.source.clone(), point.payload.pg_id.clone());
        match best.get(&key) {
            Some(existing) if existing.score >= point.score => {}
            _ => {
                best.insert(key, point);
            }
        }
    }

    let mut merged: Vec<ScoredPoint> = best.into_values().collect();
    hermes_store::sort_scored(&mut merged);
    merged.truncate(fetch_k);
    merged
}

/// Payload-only hit for `lite` responses.
fn lite_hit(point: &ScoredPoint) -> SearchHit {
    SearchHit {
        source: point.payload.source.clone(),
        pg_id: point.payload.pg_id.clone(),
        title: String::new(),
        score: point.score,
        metadata: json!({
            "content_type": point.payload.content_type,
            "has_tmdb": point.payload.has_tmdb,
            "tmdb_id": point.payload.tmdb_id,
            "size": point.payload.size,
            "nsfw_score": point.payload.nsfw_score,
        }),
    }
}

/// Build a hit from a hydrated row.
fn hydrated_hit(source: &SourceConfig, row: &SourceRow, score: f32) -> SearchHit {
    let title = row
        .extras
        .get(&source.text_field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| row.text.clone());
    SearchHit {
        source: row.source.clone(),
        pg_id: row.pg_id.clone(),
        title,
        score,
        metadata: row.extras.clone(),
    }
}
