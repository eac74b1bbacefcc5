//! Per-source sync state.
//!
//! Backed by the schema-qualified `sync_state` table:
//!
//! ```sql
//! sync_state(
//!     source            text not null,
//!     pg_id             text not null,
//!     text_hash         text not null,
//!     embedding_version text not null,
//!     vector_id         bigint,
//!     nsfw_score        real,
//!     updated_at        timestamptz,
//!     last_synced_at    timestamptz not null default now(),
//!     last_error        text,
//!     primary key (source, pg_id)
//! )
//! -- index on (source, updated_at)
//! ```
//!
//! `updated_at` carries the upstream row's watermark value (it feeds
//! `max_updated_at`); `last_synced_at` is set server-side on every write.
//! Table bootstrap is external; this module only reads and upserts.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;
use crate::rows::check_ident;

/// One `(source, pg_id)` sync record.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SyncEntry {
    /// Source name
    pub source: String,
    /// Natural identifier within the source
    pub pg_id: String,
    /// Hash of the normalized embedding input
    pub text_hash: String,
    /// Embedding version active when the row was embedded
    pub embedding_version: String,
    /// Vector id in the store; null until the first successful upsert
    pub vector_id: Option<i64>,
    /// NSFW classifier score, when classified
    pub nsfw_score: Option<f32>,
    /// Upstream watermark value of the embedded revision
    pub updated_at: Option<DateTime<Utc>>,
    /// Last per-row failure, cleared on success
    pub last_error: Option<String>,
}

impl SyncEntry {
    /// Whether the stored state matches the given hash and version.
    ///
    /// This is the "up to date" predicate: a row is current iff both agree
    /// and a vector id exists.
    pub fn is_current(&self, text_hash: &str, embedding_version: &str) -> bool {
        self.vector_id.is_some()
            && self.text_hash == text_hash
            && self.embedding_version == embedding_version
    }
}

/// Aggregate counters for `/status`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SourceSyncStats {
    /// Rows tracked for the source
    pub total: i64,
    /// Rows with a vector in the store
    pub synced: i64,
    /// Rows carrying a `last_error`
    pub errors: i64,
    /// Highest upstream watermark committed
    pub max_updated_at: Option<DateTime<Utc>>,
    /// Last state write for the source
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Sync-state persistence seam.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch entries for the given ids, keyed by `pg_id`.
    async fn get_many(&self, source: &str, ids: &[String]) -> Result<HashMap<String, SyncEntry>>;

    /// Upsert entries on `(source, pg_id)`. Transactional per call.
    async fn upsert_many(&self, entries: &[SyncEntry]) -> Result<()>;

    /// Record a per-row failure without touching hash or vector id.
    async fn mark_error(&self, source: &str, pg_id: &str, error: &str) -> Result<()>;

    /// Highest committed upstream watermark for the source.
    async fn max_updated_at(&self, source: &str) -> Result<Option<DateTime<Utc>>>;

    /// Whether any entry was embedded under a different version.
    ///
    /// A positive answer makes the pipeline drop its watermark and rescan, so
    /// a version bump re-embeds the whole source instead of only rows the
    /// upstream happens to touch.
    async fn stale_version_exists(&self, source: &str, version: &str) -> Result<bool>;

    /// Ids seen since `since` that still lack a vector (retry feed).
    async fn missing_since(
        &self,
        source: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>>;

    /// Aggregate counters for `/status`.
    async fn source_stats(&self, source: &str) -> Result<SourceSyncStats>;
}

/// Postgres-backed state store.
pub struct PgStateStore {
    pool: PgPool,
    table: String,
}

impl PgStateStore {
    /// Create a store over `{schema}.sync_state`.
    pub fn new(pool: PgPool, schema: &str) -> Result<Self> {
        check_ident(schema)?;
        Ok(Self {
            pool,
            table: format!("{schema}.sync_state"),
        })
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn get_many(&self, source: &str, ids: &[String]) -> Result<HashMap<String, SyncEntry>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let sql = format!(
            "SELECT source, pg_id, text_hash, embedding_version, vector_id, nsfw_score, \
             updated_at, last_error \
             FROM {} WHERE source = $1 AND pg_id = ANY($2)",
            self.table
        );
        let entries: Vec<SyncEntry> = sqlx::query_as(&sql)
            .bind(source)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;

        Ok(entries
            .into_iter()
            .map(|entry| (entry.pg_id.clone(), entry))
            .collect())
    }

    async fn upsert_many(&self, entries: &[SyncEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "INSERT INTO {} \
             (source, pg_id, text_hash, embedding_version, vector_id, nsfw_score, updated_at, \
              last_synced_at, last_error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, now(), $8) \
             ON CONFLICT (source, pg_id) DO UPDATE SET \
               text_hash = EXCLUDED.text_hash, \
               embedding_version = EXCLUDED.embedding_version, \
               vector_id = EXCLUDED.vector_id, \
               nsfw_score = EXCLUDED.nsfw_score, \
               updated_at = EXCLUDED.updated_at, \
               last_synced_at = now(), \
               last_error = EXCLUDED.last_error",
            self.table
        );

        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(&sql)
                .bind(&entry.source)
                .bind(&entry.pg_id)
                .bind(&entry.text_hash)
                .bind(&entry.embedding_version)
                .bind(entry.vector_id)
                .bind(entry.nsfw_score)
                .bind(entry.updated_at)
                .bind(&entry.last_error)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!("Committed {} sync-state entries", entries.len());
        Ok(())
    }

    async fn mark_error(&self, source: &str, pg_id: &str, error: &str) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} \
             (source, pg_id, text_hash, embedding_version, last_synced_at, last_error) \
             VALUES ($1, $2, '', '', now(), $3) \
             ON CONFLICT (source, pg_id) DO UPDATE SET \
               last_synced_at = now(), \
               last_error = EXCLUDED.last_error",
            self.table
        );
        sqlx::query(&sql)
            .bind(source)
            .bind(pg_id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn max_updated_at(&self, source: &str) -> Result<Option<DateTime<Utc>>> {
        let sql = format!("SELECT max(updated_at) FROM {} WHERE source = $1", self.table);
        let max: Option<DateTime<Utc>> = sqlx::query_scalar(&sql)
            .bind(source)
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }

    async fn stale_version_exists(&self, source: &str, version: &str) -> Result<bool> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} \
             WHERE source = $1 AND embedding_version <> '' AND embedding_version <> $2)",
            self.table
        );
        let exists: bool = sqlx::query_scalar(&sql)
            .bind(source)
            .bind(version)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn missing_since(
        &self,
        source: &str,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT pg_id FROM {} \
             WHERE source = $1 AND vector_id IS NULL AND last_synced_at > $2 \
             ORDER BY last_synced_at ASC LIMIT $3",
            self.table
        );
        let ids: Vec<String> = sqlx::query_scalar(&sql)
            .bind(source)
            .bind(since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn source_stats(&self, source: &str) -> Result<SourceSyncStats> {
        let sql = format!(
            "SELECT count(*) AS total, \
                    count(vector_id) AS synced, \
                    count(last_error) AS errors, \
                    max(updated_at) AS max_updated_at, \
                    max(last_synced_at) AS last_sync_at \
             FROM {} WHERE source = $1",
            self.table
        );
        let row: (i64, i64, i64, Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
            sqlx::query_as(&sql).bind(source).fetch_one(&self.pool).await?;

        Ok(SourceSyncStats {
            total: row.0,
            synced: row.1,
            errors: row.2,
            max_updated_at: row.3,
            last_sync_at: row.4,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: &str, version: &str, vector_id: Option<i64>) -> SyncEntry {
        SyncEntry {
            source: "torrents".into(),
            pg_id: "abc".into(),
            text_hash: hash.into(),
            embedding_version: version.into(),
            vector_id,
            nsfw_score: None,
            updated_at: None,
            last_error: None,
        }
    }

    #[test]
    fn test_is_current_requires_hash_version_and_vector() {
        let current = entry("h1", "v1", Some(7));
        assert!(current.is_current("h1", "v1"));
        // Changed text
        assert!(!current.is_current("h2", "v1"));
        // Version bump forces re-embed
        assert!(!current.is_current("h1", "v2"));
        // Never embedded
        assert!(!entry("h1", "v1", None).is_current("h1", "v1"));
    }

    #[test]
    fn test_state_store_rejects_unsafe_schema() {
        // Pool construction is lazy, so this never touches the network.
        let pool = PgPool::connect_lazy("postgres://localhost/hermes").unwrap();
        assert!(PgStateStore::new(pool.clone(), "hermes").is_ok());
        assert!(PgStateStore::new(pool, "bad schema;--").is_err());
    }
}
