//! Vector store abstraction for HermesIndex.
//!
//! One capability set (ensure, upsert, query, delete, count, health) over
//! two backends:
//!
//! - [`LocalHnswStore`]: an on-disk HNSW graph with an append-only JSON-lines
//!   payload sidecar, for single-node deployments.
//! - [`RemoteStore`]: a collection on a remote Qdrant server.
//!
//! Vector ids are derived from `(source, pg_id)` via [`point_id`], making
//! upserts idempotent and the id the sole cross-reference between the store
//! and the sync-state table.

mod error;
mod local;
mod remote;
mod traits;
mod types;

pub use error::{Result, StoreError};
pub use local::LocalHnswStore;
pub use remote::{RemoteStore, RemoteStoreConfig};
pub use traits::VectorStore;
pub use types::{
    fields, point_id, sort_scored, PayloadFilter, PointRecord, ScoredPoint, StoreHealth,
    VectorPayload,
};
