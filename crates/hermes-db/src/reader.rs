//! Source reader: watermark-cursor reads over upstream tables and views.
//!
//! Every query selects the same shape regardless of source layout: the id
//! cast to text, the text column, the watermark (or NULL for sources without
//! one), and `to_jsonb(t.*)` as the extras object. The reader composes
//! `search_text` per the source's extra-fields rule before handing rows to
//! the pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hermes_config::SourceConfig;
use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;
use crate::rows::{check_ident, compose_search_text, SourceRow};

/// Position within a source scan.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchCursor {
    /// Start of a cycle. The watermark bound is inclusive: rows sharing the
    /// committed maximum are re-read and no-op on matching hashes, so a crash
    /// between tied rows cannot lose the uncommitted ones.
    Start {
        watermark: Option<DateTime<Utc>>,
    },
    /// Keyset position after the last row of the previous batch.
    After {
        updated_at: Option<DateTime<Utc>>,
        pg_id: String,
    },
}

impl BatchCursor {
    /// Cursor for the beginning of a cycle.
    pub fn start(watermark: Option<DateTime<Utc>>) -> Self {
        Self::Start { watermark }
    }

    /// Advance past a row that has been read.
    pub fn advance(&mut self, row: &SourceRow) {
        *self = Self::After {
            updated_at: row.updated_at,
            pg_id: row.pg_id.clone(),
        };
    }
}

/// Read access to an upstream source.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Fetch the next batch at the cursor, ordered by `(updated_at, id)`
    /// ascending (id only for sources without a watermark column).
    async fn fetch_batch(
        &self,
        source: &SourceConfig,
        cursor: &BatchCursor,
        limit: i64,
    ) -> Result<Vec<SourceRow>>;

    /// Fetch specific rows for hydration. Order is unspecified; callers map
    /// by id.
    async fn fetch_by_ids(&self, source: &SourceConfig, ids: &[String]) -> Result<Vec<SourceRow>>;

    /// ILIKE fallback over the text column.
    async fn keyword_search(
        &self,
        source: &SourceConfig,
        query: &str,
        limit: i64,
    ) -> Result<Vec<SourceRow>>;
}

#[derive(sqlx::FromRow)]
struct RawRow {
    pg_id: String,
    row_text: Option<String>,
    row_updated_at: Option<DateTime<Utc>>,
    extras: serde_json::Value,
}

/// Postgres-backed source reader.
pub struct PgSourceReader {
    pool: PgPool,
}

impl PgSourceReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn convert(source: &SourceConfig, raw: RawRow) -> SourceRow {
        let text = compose_search_text(
            raw.row_text.as_deref().unwrap_or(""),
            &raw.extras,
            &source.extra_fields,
        );
        SourceRow {
            source: source.name.clone(),
            pg_id: raw.pg_id,
            text,
            extras: raw.extras,
            updated_at: raw.row_updated_at,
        }
    }
}

/// Render the shared SELECT prologue for a source.
fn select_clause(source: &SourceConfig) -> Result<String> {
    let table = check_ident(&source.table_or_view)?;
    let id = check_ident(&source.id_field)?;
    let text = check_ident(&source.text_field)?;
    let updated = match &source.updated_at_field {
        Some(field) => format!("t.{}::timestamptz", check_ident(field)?),
        None => "NULL::timestamptz".to_string(),
    };
    Ok(format!(
        "SELECT t.{id}::text AS pg_id, t.{text}::text AS row_text, \
         {updated} AS row_updated_at, to_jsonb(t.*) AS extras FROM {table} t"
    ))
}

#[async_trait]
impl SourceReader for PgSourceReader {
    async fn fetch_batch(
        &self,
        source: &SourceConfig,
        cursor: &BatchCursor,
        limit: i64,
    ) -> Result<Vec<SourceRow>> {
        let select = select_clause(source)?;
        let id = check_ident(&source.id_field)?;

        let raw: Vec<RawRow> = match (&source.updated_at_field, cursor) {
            (Some(updated), BatchCursor::Start { watermark: Some(wm) }) => {
                let updated = check_ident(updated)?;
                let sql = format!(
                    "{select} WHERE t.{updated} >= $1 \
                     ORDER BY t.{updated} ASC, t.{id}::text ASC LIMIT $2"
                );
                sqlx::query_as(&sql)
                    .bind(wm)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (Some(updated), BatchCursor::After { updated_at: Some(u), pg_id }) => {
                let updated = check_ident(updated)?;
                let sql = format!(
                    "{select} WHERE (t.{updated}, t.{id}::text) > ($1, $2) \
                     ORDER BY t.{updated} ASC, t.{id}::text ASC LIMIT $3"
                );
                sqlx::query_as(&sql)
                    .bind(u)
                    .bind(pg_id)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (Some(updated), _) => {
                let updated = check_ident(updated)?;
                let sql = format!(
                    "{select} ORDER BY t.{updated} ASC, t.{id}::text ASC LIMIT $1"
                );
                sqlx::query_as(&sql).bind(limit).fetch_all(&self.pool).await?
            }
            // Full-scan fallback: only hash-based change detection applies.
            (None, BatchCursor::After { pg_id, .. }) => {
                let sql = format!(
                    "{select} WHERE t.{id}::text > $1 ORDER BY t.{id}::text ASC LIMIT $2"
                );
                sqlx::query_as(&sql)
                    .bind(pg_id)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            (None, BatchCursor::Start { .. }) => {
                let sql = format!("{select} ORDER BY t.{id}::text ASC LIMIT $1");
                sqlx::query_as(&sql).bind(limit).fetch_all(&self.pool).await?
            }
        };

        debug!(
            "Fetched {} rows from source '{}' (limit {})",
            raw.len(),
            source.name,
            limit
        );
        Ok(raw
            .into_iter()
            .map(|row| Self::convert(source, row))
            .collect())
    }

    async fn fetch_by_ids(&self, source: &SourceConfig, ids: &[String]) -> Result<Vec<SourceRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let select = select_clause(source)?;
        let id = check_ident(&source.id_field)?;
        let sql = format!("{select} WHERE t.{id}::text = ANY($1)");

        let raw: Vec<RawRow> = sqlx::query_as(&sql).bind(ids).fetch_all(&self.pool).await?;
        Ok(raw
            .into_iter()
            .map(|row| Self::convert(source, row))
            .collect())
    }

    async fn keyword_search(
        &self,
        source: &SourceConfig,
        query: &str,
        limit: i64,
    ) -> Result<Vec<SourceRow>> {
        let select = select_clause(source)?;
        let text = check_ident(&source.text_field)?;
        let id = check_ident(&source.id_field)?;
        let sql = format!(
            "{select} WHERE t.{text}::text ILIKE $1 ORDER BY t.{id}::text ASC LIMIT $2"
        );

        let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        let raw: Vec<RawRow> = sqlx::query_as(&sql)
            .bind(pattern)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(raw
            .into_iter()
            .map(|row| Self::convert(source, row))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SourceConfig {
        SourceConfig {
            name: "bitmagnet_torrents".into(),
            table_or_view: "torrents".into(),
            id_field: "info_hash".into(),
            text_field: "name".into(),
            updated_at_field: Some("updated_at".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_select_clause_shape() {
        let sql = select_clause(&source()).unwrap();
        assert!(sql.contains("t.info_hash::text AS pg_id"));
        assert!(sql.contains("t.name::text AS row_text"));
        assert!(sql.contains("t.updated_at::timestamptz AS row_updated_at"));
        assert!(sql.contains("to_jsonb(t.*) AS extras"));
        assert!(sql.contains("FROM torrents t"));
    }

    #[test]
    fn test_select_clause_without_watermark_column() {
        let mut cfg = source();
        cfg.updated_at_field = None;
        let sql = select_clause(&cfg).unwrap();
        assert!(sql.contains("NULL::timestamptz AS row_updated_at"));
    }

    #[test]
    fn test_select_clause_rejects_injection() {
        let mut cfg = source();
        cfg.text_field = "name; DROP TABLE torrents".into();
        assert!(select_clause(&cfg).is_err());
    }

    #[test]
    fn test_cursor_advance() {
        let mut cursor = BatchCursor::start(None);
        let row = SourceRow {
            source: "s".into(),
            pg_id: "abc".into(),
            text: "t".into(),
            extras: serde_json::json!({}),
            updated_at: None,
        };
        cursor.advance(&row);
        assert_eq!(
            cursor,
            BatchCursor::After {
                updated_at: None,
                pg_id: "abc".into()
            }
        );
    }
}
