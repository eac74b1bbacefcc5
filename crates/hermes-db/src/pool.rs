//! Connection pool construction.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::error::Result;

/// Connect a pool to the upstream database.
///
/// `max_connections = 0` falls back to a small default sized for one worker
/// per source plus the HTTP surface.
pub async fn connect(dsn: &str, max_connections: u32) -> Result<PgPool> {
    let max = if max_connections == 0 { 8 } else { max_connections };
    let pool = PgPoolOptions::new()
        .max_connections(max)
        .acquire_timeout(Duration::from_secs(10))
        .connect(dsn)
        .await?;

    info!("Connected to Postgres ({} max connections)", max);
    Ok(pool)
}
