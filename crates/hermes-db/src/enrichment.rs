//! Enrichment table access.
//!
//! The enrichment worker owns `{schema}.content_enrichment`; everything else
//! reads it. Keyed by content identity `(content_type, content_source,
//! content_id)`:
//!
//! ```sql
//! content_enrichment(
//!     content_type   text not null,
//!     content_source text not null,
//!     content_id     text not null,
//!     title          text,
//!     aka            text,
//!     keywords       text,
//!     plot           text,
//!     genre          text,
//!     directors      text,
//!     actors         text,
//!     release_year   int,
//!     poster_path    text,
//!     updated_at     timestamptz not null default now(),
//!     status         text,
//!     last_error     text,
//!     primary key (content_type, content_source, content_id)
//! )
//! ```
//!
//! `last_error` holds the failure reason behind `status = 'error'`; a later
//! successful pass clears it.

use async_trait::async_trait;
use hermes_config::SourceConfig;
use sqlx::PgPool;
use tracing::debug;

use crate::error::{DbError, Result};
use crate::rows::check_ident;

/// Content identity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, sqlx::FromRow)]
pub struct ContentKey {
    pub content_type: String,
    pub content_source: String,
    pub content_id: String,
    /// Display title of the candidate row, used for the metadata lookup
    pub title: Option<String>,
    /// Release year when the upstream row carries one
    pub release_year: Option<i32>,
}

/// One enrichment record.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct EnrichmentRow {
    pub content_type: String,
    pub content_source: String,
    pub content_id: String,
    pub title: Option<String>,
    pub aka: Option<String>,
    pub keywords: Option<String>,
    pub plot: Option<String>,
    pub genre: Option<String>,
    pub directors: Option<String>,
    pub actors: Option<String>,
    pub release_year: Option<i32>,
    pub poster_path: Option<String>,
    pub status: Option<String>,
}

/// Slim projection used by query expansion.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct ExpansionHit {
    pub title: Option<String>,
    pub aka: Option<String>,
    pub keywords: Option<String>,
}

/// Expansion-lookup seam for the search side.
#[async_trait]
pub trait ExpansionLookup: Send + Sync {
    /// Case-insensitive substring match over title, aka, and keywords,
    /// bounded by a statement timeout. Timeouts surface as
    /// [`DbError::StatementTimeout`]; callers degrade silently.
    async fn search_expansion(
        &self,
        query: &str,
        limit: i64,
        timeout_ms: u64,
    ) -> Result<Vec<ExpansionHit>>;
}

/// Postgres-backed enrichment store.
pub struct PgEnrichmentStore {
    pool: PgPool,
    table: String,
}

impl PgEnrichmentStore {
    /// Create a store over `{schema}.content_enrichment`.
    pub fn new(pool: PgPool, schema: &str) -> Result<Self> {
        check_ident(schema)?;
        Ok(Self {
            pool,
            table: format!("{schema}.content_enrichment"),
        })
    }

    /// Select content rows still lacking enrichment, bounded to `limit`.
    ///
    /// A candidate either has no enrichment row at all or one whose `aka` and
    /// `keywords` are both null (a previous pass that found nothing useful).
    pub async fn candidates(&self, source: &SourceConfig, limit: i64) -> Result<Vec<ContentKey>> {
        let table = check_ident(&source.table_or_view)?;
        let sql = format!(
            "SELECT c.content_type, c.content_source, c.content_id, \
                    c.title::text AS title, c.release_year \
             FROM {table} c \
             LEFT JOIN {} e USING (content_type, content_source, content_id) \
             WHERE e.content_id IS NULL \
                OR (e.aka IS NULL AND e.keywords IS NULL AND e.status IS DISTINCT FROM 'error') \
             ORDER BY c.content_type, c.content_source, c.content_id \
             LIMIT $1",
            self.table
        );
        let keys: Vec<ContentKey> = sqlx::query_as(&sql).bind(limit).fetch_all(&self.pool).await?;
        debug!("Selected {} enrichment candidates", keys.len());
        Ok(keys)
    }

    /// Write one enrichment result transactionally with `status = 'ok'`.
    pub async fn upsert(&self, row: &EnrichmentRow) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} \
             (content_type, content_source, content_id, title, aka, keywords, plot, genre, \
              directors, actors, release_year, poster_path, updated_at, status, last_error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now(), 'ok', NULL) \
             ON CONFLICT (content_type, content_source, content_id) DO UPDATE SET \
               title = EXCLUDED.title, \
               aka = EXCLUDED.aka, \
               keywords = EXCLUDED.keywords, \
               plot = EXCLUDED.plot, \
               genre = EXCLUDED.genre, \
               directors = EXCLUDED.directors, \
               actors = EXCLUDED.actors, \
               release_year = EXCLUDED.release_year, \
               poster_path = EXCLUDED.poster_path, \
               updated_at = now(), \
               status = 'ok', \
               last_error = NULL",
            self.table
        );
        sqlx::query(&sql)
            .bind(&row.content_type)
            .bind(&row.content_source)
            .bind(&row.content_id)
            .bind(&row.title)
            .bind(&row.aka)
            .bind(&row.keywords)
            .bind(&row.plot)
            .bind(&row.genre)
            .bind(&row.directors)
            .bind(&row.actors)
            .bind(row.release_year)
            .bind(&row.poster_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record a failed lookup with `status = 'error'` and the reason.
    ///
    /// The update branch carries the reason too: a retried failure on an
    /// existing row replaces the old reason instead of dropping the new one.
    pub async fn mark_error(&self, key: &ContentKey, reason: &str) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} \
             (content_type, content_source, content_id, updated_at, status, last_error) \
             VALUES ($1, $2, $3, now(), 'error', $4) \
             ON CONFLICT (content_type, content_source, content_id) DO UPDATE SET \
               updated_at = now(), \
               status = 'error', \
               last_error = EXCLUDED.last_error",
            self.table
        );
        sqlx::query(&sql)
            .bind(&key.content_type)
            .bind(&key.content_source)
            .bind(&key.content_id)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Genres recorded for a content identity, split from the `genre` column.
    pub async fn genres_for(&self, key: &ContentKey) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT genre FROM {} \
             WHERE content_type = $1 AND content_source = $2 AND content_id = $3",
            self.table
        );
        let genre: Option<Option<String>> = sqlx::query_scalar(&sql)
            .bind(&key.content_type)
            .bind(&key.content_source)
            .bind(&key.content_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(genre
            .flatten()
            .map(|g| {
                g.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl ExpansionLookup for PgEnrichmentStore {
    async fn search_expansion(
        &self,
        query: &str,
        limit: i64,
        timeout_ms: u64,
    ) -> Result<Vec<ExpansionHit>> {
        let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        let sql = format!(
            "SELECT title, aka, keywords FROM {} \
             WHERE title ILIKE $1 OR aka ILIKE $1 OR keywords ILIKE $1 \
             LIMIT $2",
            self.table
        );

        // SET LOCAL scopes the timeout to this transaction only.
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("SET LOCAL statement_timeout = {timeout_ms}"))
            .execute(&mut *tx)
            .await?;
        let hits: Vec<ExpansionHit> = match sqlx::query_as(&sql)
            .bind(&pattern)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await
        {
            Ok(hits) => hits,
            Err(e) if DbError::is_statement_timeout(&e) => {
                return Err(DbError::StatementTimeout(timeout_ms));
            }
            Err(e) => return Err(e.into()),
        };
        tx.commit().await?;

        Ok(hits)
    }
}
