//! Cross-language semantic search for HermesIndex.
//!
//! [`QueryExpander`] widens queries with enrichment-table aka titles and
//! keywords; [`SearchOrchestrator`] drives the hybrid search path: embed,
//! primary vector query, cross-language hop for non-ASCII queries, merge,
//! pagination, and per-source hydration with stage timings.

mod error;
mod expand;
mod orchestrator;

pub use error::{Result, SearchError};
pub use expand::{rank_tokens, split_tokens, Expansion, QueryExpander};
pub use orchestrator::{
    clean_query, extract_genres, merge_hits, DebugInfo, DebugTimings, PgSourceTiming,
    SearchHit, SearchOrchestrator, SearchRequest, SearchResponse,
};
