//! HermesIndex - semantic search over torrent metadata
//!
//! # Usage
//!
//! ```bash
//! # Serve the search API with background sync workers
//! hermes-index serve
//!
//! # Run one sync cycle per source and exit
//! hermes-index sync
//!
//! # Run one enrichment pass and exit
//! hermes-index enrich
//!
//! # Validate configuration
//! hermes-index check-config
//! ```
//!
//! Exit codes: 0 success, 1 misconfiguration, 2 unrecoverable runtime error.

mod routes;
mod state;
mod workers;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hermes_config::{ConfigLoader, HermesConfig};
use hermes_sync::{EnrichmentWorker, SyncPipeline};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// HermesIndex - cross-language semantic torrent search
#[derive(Parser, Debug)]
#[command(name = "hermes-index")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (default: ./hermes.yaml or $HERMES_CONFIG)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API with background sync and enrichment workers
    Serve,

    /// Run one sync cycle per source, then exit
    Sync {
        /// Restrict to a single source
        #[arg(long)]
        source: Option<String>,
    },

    /// Run one enrichment pass, then exit
    Enrich,

    /// Validate configuration and print the source registry
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let config = match ConfigLoader::new().load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::from(1);
        }
    };

    let result = match cli.command {
        Commands::CheckConfig => check_config(&config),
        Commands::Serve => serve(&config).await,
        Commands::Sync { source } => sync_once(&config, source.as_deref()).await,
        Commands::Enrich => enrich_once(&config).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("Fatal: {:#}", e);
            // Dimension disagreements are deployment mistakes, not crashes.
            if format!("{e:#}").contains("dimension mismatch") {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            }
        }
    }
}

fn check_config(config: &HermesConfig) -> anyhow::Result<ExitCode> {
    println!("configuration ok");
    println!("schema: {}", config.bitmagnet.schema);
    println!(
        "vector store: {} (dim {})",
        config.vector_store.kind, config.vector_store.dim
    );
    for source in &config.sources {
        println!(
            "source {}: {} (batch {}, keyword_search {}, tmdb_enrich {})",
            source.name,
            source.table_or_view,
            source.batch_size,
            source.keyword_search,
            source.tmdb_enrich
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn serve(config: &HermesConfig) -> anyhow::Result<ExitCode> {
    let components = state::build(config).await?;
    if let Err(e) = components.embedder.warmup().await {
        // Warmup failures are advisory; sync retries per batch.
        tracing::warn!("Embedder warmup failed: {}", e);
    }

    let cancel = CancellationToken::new();
    let handles = workers::spawn_workers(&components, config, &cancel);

    let app = routes::router(components.app_state());
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    // Let workers finish their current batch.
    cancel.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    info!("Shutdown complete");
    Ok(ExitCode::SUCCESS)
}

async fn sync_once(config: &HermesConfig, only: Option<&str>) -> anyhow::Result<ExitCode> {
    let components = state::build(config).await?;
    let cancel = CancellationToken::new();

    for source in components.registry.iter() {
        if only.is_some_and(|name| name != source.name) {
            continue;
        }
        let pipeline = SyncPipeline::new(
            source.clone(),
            Arc::clone(&components.reader),
            Arc::clone(&components.state_store),
            Arc::clone(&components.store),
            Arc::clone(&components.embedder),
        );
        let stats = pipeline.run_cycle(&cancel).await?;
        info!(
            source = %source.name,
            scanned = stats.scanned,
            embedded = stats.embedded,
            failed = stats.failed,
            "Cycle finished"
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn enrich_once(config: &HermesConfig) -> anyhow::Result<ExitCode> {
    let components = state::build(config).await?;
    let Some(client) = workers::metadata_client(config) else {
        anyhow::bail!(
            "metadata API key not found in ${}",
            config.tmdb.api_key_env
        );
    };

    let cancel = CancellationToken::new();
    let limiter = hermes_sync::metadata_rate_limiter(&config.tmdb);
    for source in components.registry.iter().filter(|s| s.tmdb_enrich) {
        let worker = EnrichmentWorker::new(
            source.clone(),
            Arc::clone(&components.enrichment) as _,
            Arc::clone(&client),
            Arc::clone(&limiter),
            &config.tmdb,
        );
        let stats = worker.run_pass(&cancel).await?;
        info!(
            source = %source.name,
            enriched = stats.enriched,
            failed = stats.failed,
            "Enrichment pass finished"
        );
    }
    Ok(ExitCode::SUCCESS)
}
