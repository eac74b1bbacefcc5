//! Incremental sync for HermesIndex.
//!
//! [`SyncPipeline`] drives one source through diff -> embed -> upsert ->
//! commit cycles; [`EnrichmentWorker`] fills the enrichment table from the
//! external metadata API under a token-bucket rate limit. Both run as
//! long-lived tasks coordinated by a shared cancellation token.

mod enrich;
mod error;
mod pipeline;
mod tmdb;

pub use enrich::{
    metadata_rate_limiter, EnrichRateLimiter, EnrichStats, EnrichmentSink, EnrichmentWorker,
    MetadataLookup,
};
pub use error::{Result, SyncError};
pub use pipeline::{CycleStats, SyncPipeline};
pub use tmdb::{TmdbClient, TmdbClientConfig};
