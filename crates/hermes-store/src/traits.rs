//! Vector store trait definition.
//!
//! One capability set over both backends; no shared base state. All
//! operations are async to support the remote backend.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{PayloadFilter, PointRecord, ScoredPoint, StoreHealth};

/// Unified interface over the local HNSW and remote collection backends.
///
/// # Concurrency
///
/// Implementations allow many concurrent readers; writes are serialized by
/// the backend (an internal writer lock locally, the server remotely).
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Idempotently create or open the store at the given dimension.
    ///
    /// Fails with `DIM_MISMATCH` when an existing store disagrees.
    async fn ensure(&self, dim: usize) -> Result<()>;

    /// Upsert a batch of points, atomic per batch.
    ///
    /// Points without an id get a stable one derived from the payload's
    /// `(source, pg_id)`. Returns the ids in input order.
    async fn upsert(&self, batch: Vec<PointRecord>) -> Result<Vec<i64>>;

    /// Delete points by id. Unknown ids are ignored.
    async fn delete(&self, ids: Vec<i64>) -> Result<()>;

    /// Query the `k` most similar points, optionally payload-filtered.
    ///
    /// Results are ordered by descending similarity; ties break by ascending
    /// id.
    async fn query(
        &self,
        vector: Vec<f32>,
        k: usize,
        filter: Option<PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>>;

    /// Number of points in the store.
    async fn count(&self) -> Result<u64>;

    /// Backend health snapshot.
    async fn health(&self) -> Result<StoreHealth>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Trait must stay object-safe; it is handed around as Arc<dyn VectorStore>.
    fn _assert_object_safe(_: &dyn VectorStore) {}
}
