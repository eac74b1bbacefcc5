//! Postgres access for HermesIndex.
//!
//! Three concerns share one pool:
//!
//! - [`StateStore`] - the `(source, pg_id)` sync-state table that the
//!   pipeline diffs against and commits to.
//! - [`SourceReader`] - watermark-ordered batch reads over upstream tables,
//!   plus id fetches for hydration and the ILIKE keyword fallback.
//! - [`PgEnrichmentStore`] - the enrichment table owned by the enrichment
//!   worker and queried by search expansion.
//!
//! Table bootstrap is external; expected shapes are documented on each
//! module.

mod enrichment;
mod error;
mod pool;
mod reader;
mod rows;
mod state;

pub use enrichment::{
    ContentKey, EnrichmentRow, ExpansionHit, ExpansionLookup, PgEnrichmentStore,
};
pub use error::{DbError, Result};
pub use pool::connect;
pub use reader::{BatchCursor, PgSourceReader, SourceReader};
pub use rows::{check_ident, compose_search_text, composite_id, split_composite_id, SourceRow};
pub use state::{PgStateStore, SourceSyncStats, StateStore, SyncEntry};
