//! Point, payload, and filter types shared by both store backends.

use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};

type Blake2b128 = Blake2b<U16>;

/// Payload field names for indexed filtering.
pub mod fields {
    /// Source name (partition key)
    pub const SOURCE: &str = "source";
    /// Natural identifier within the source, normalized to text
    pub const PG_ID: &str = "pg_id";
    /// Hash of the normalized embedding input
    pub const TEXT_HASH: &str = "text_hash";
    /// Model + normalization contract tag
    pub const EMBEDDING_VERSION: &str = "embedding_version";
    /// NSFW classifier score in [0, 1]
    pub const NSFW_SCORE: &str = "nsfw_score";
    /// Content-type tag (movie, tv_show, ...)
    pub const CONTENT_TYPE: &str = "content_type";
    /// Whether the row carries TMDB enrichment
    pub const HAS_TMDB: &str = "has_tmdb";
    /// TMDB identifier when enriched
    pub const TMDB_ID: &str = "tmdb_id";
    /// Torrent size in bytes
    pub const SIZE: &str = "size";
    /// Audio languages
    pub const LANGUAGES: &str = "languages";
    /// Subtitle languages
    pub const SUBTITLES: &str = "subtitles";
    /// Genres from enrichment
    pub const GENRES: &str = "genres";
}

/// Metadata attached to every vector.
///
/// `source` and `pg_id` together identify the upstream row; the remaining
/// fields exist for payload filtering and result display.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VectorPayload {
    /// Source name (partition key)
    pub source: String,
    /// Natural identifier within the source
    pub pg_id: String,
    /// Hash of the normalized embedding input
    pub text_hash: String,
    /// Model + normalization contract tag
    pub embedding_version: String,
    /// NSFW classifier score, when classified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nsfw_score: Option<f32>,
    /// Content-type tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Whether the row carries TMDB enrichment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_tmdb: Option<bool>,
    /// TMDB identifier when enriched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmdb_id: Option<String>,
    /// Torrent size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    /// Audio languages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub languages: Option<Vec<String>>,
    /// Subtitle languages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitles: Option<Vec<String>>,
    /// Genres from enrichment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genres: Option<Vec<String>>,
}

/// A point to upsert into the store.
///
/// When `id` is omitted, the store derives a stable one from the payload's
/// `(source, pg_id)` so re-upserts land on the same vector.
#[derive(Debug, Clone)]
pub struct PointRecord {
    /// Vector id; allocated by the store when absent
    pub id: Option<i64>,
    /// Embedding vector
    pub vector: Vec<f32>,
    /// Metadata payload
    pub payload: VectorPayload,
}

/// A scored result from a vector query.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    /// Vector id
    pub id: i64,
    /// Cosine similarity, higher is better
    pub score: f32,
    /// Metadata payload
    pub payload: VectorPayload,
}

/// Payload filter applied at query time.
///
/// The local backend evaluates this as a predicate; the remote backend
/// translates it to the collection's payload-filter grammar. An empty filter
/// matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadFilter {
    /// Drop rows whose `nsfw_score` is at or above this threshold.
    /// Rows without a score pass.
    pub nsfw_below: Option<f32>,
    /// Require `has_tmdb == true`
    pub tmdb_only: bool,
    /// Require `size >= size_min`
    pub size_min: Option<i64>,
    /// Require at least one of these genres
    pub genres_any: Vec<String>,
}

impl PayloadFilter {
    /// Whether the filter imposes no constraints.
    pub fn is_empty(&self) -> bool {
        self.nsfw_below.is_none()
            && !self.tmdb_only
            && self.size_min.is_none()
            && self.genres_any.is_empty()
    }

    /// Evaluate against a payload (local backend path).
    pub fn matches(&self, payload: &VectorPayload) -> bool {
        if let Some(threshold) = self.nsfw_below {
            if let Some(score) = payload.nsfw_score {
                if score >= threshold {
                    return false;
                }
            }
        }
        if self.tmdb_only && payload.has_tmdb != Some(true) {
            return false;
        }
        if let Some(min) = self.size_min {
            match payload.size {
                Some(size) if size >= min => {}
                _ => return false,
            }
        }
        if !self.genres_any.is_empty() {
            let Some(genres) = &payload.genres else {
                return false;
            };
            if !self
                .genres_any
                .iter()
                .any(|wanted| genres.iter().any(|g| g.eq_ignore_ascii_case(wanted)))
            {
                return false;
            }
        }
        true
    }
}

/// Store health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    /// Whether the backend answered
    pub ok: bool,
    /// Backend tag (`hnsw` or `remote`)
    pub backend: &'static str,
    /// Points currently stored
    pub points: u64,
    /// Configured dimension
    pub dim: usize,
}

/// Derive the stable vector id for a `(source, pg_id)` pair.
///
/// First eight bytes of BLAKE2b-128 over `source:pg_id`, masked positive so
/// the id survives an int64 state column. Stable across restarts and
/// processes, which makes it the sole cross-reference between the store and
/// the state table.
pub fn point_id(source: &str, pg_id: &str) -> i64 {
    let mut hasher = Blake2b128::new();
    hasher.update(source.as_bytes());
    hasher.update(b":");
    hasher.update(pg_id.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) & (i64::MAX as u64)) as i64
}

/// Sort scored points by descending score, ties broken by ascending id.
pub fn sort_scored(points: &mut [ScoredPoint]) {
    points.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}
