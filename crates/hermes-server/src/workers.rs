//! Background worker supervision.
//!
//! One long-lived sync task per source, plus one enrichment task per
//! `tmdb_enrich` source when auto-enrichment is on. All workers share a
//! cancellation token: on shutdown the current batch finishes, then the
//! worker exits.

use std::sync::Arc;

use hermes_config::HermesConfig;
use hermes_sync::{
    metadata_rate_limiter, EnrichmentWorker, MetadataLookup, SyncPipeline, TmdbClient,
    TmdbClientConfig,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::state::Components;

/// Idle time between sync cycles for a source.
const SYNC_IDLE_SECONDS: u64 = 30;

/// Spawn sync workers for every source and enrichment workers where
/// configured. Returns the join handles so the caller can await drain.
pub fn spawn_workers(
    components: &Components,
    config: &HermesConfig,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    for source in components.registry.iter() {
        let pipeline = SyncPipeline::new(
            source.clone(),
            Arc::clone(&components.reader),
            Arc::clone(&components.state_store),
            Arc::clone(&components.store),
            Arc::clone(&components.embedder),
        );
        let token = cancel.clone();
        info!(source = %source.name, "Starting sync worker");
        handles.push(tokio::spawn(async move {
            pipeline.run_loop(token, SYNC_IDLE_SECONDS).await;
        }));
    }

    if config.tmdb.auto_enrich {
        match metadata_client(config) {
            Some(client) => {
                // One bucket for all enrichment workers; the configured rate
                // is a global cap on the external API, not a per-source one.
                let limiter = metadata_rate_limiter(&config.tmdb);
                for source in components.registry.iter().filter(|s| s.tmdb_enrich) {
                    let worker = EnrichmentWorker::new(
                        source.clone(),
                        Arc::clone(&components.enrichment) as _,
                        Arc::clone(&client),
                        Arc::clone(&limiter),
                        &config.tmdb,
                    );
                    let token = cancel.clone();
                    info!(source = %source.name, "Starting enrichment worker");
                    handles.push(tokio::spawn(async move {
                        worker.run_loop(token).await;
                    }));
                }
            }
            None => warn!(
                "tmdb.auto_enrich is on but {} is not set; enrichment disabled",
                config.tmdb.api_key_env
            ),
        }
    }

    handles
}

/// Build the TMDB client from the configured key env var, if present.
pub fn metadata_client(config: &HermesConfig) -> Option<Arc<dyn MetadataLookup>> {
    let api_key = std::env::var(&config.tmdb.api_key_env).ok()?;
    let client = TmdbClient::new(TmdbClientConfig {
        api_url: config.tmdb.api_url.clone(),
        api_key,
        timeout_seconds: config.tmdb.request_timeout_seconds,
    })
    .ok()?;
    Some(Arc::new(client))
}
