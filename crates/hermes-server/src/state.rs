//! Component wiring.
//!
//! Builds the process-wide collaborators from configuration once at startup;
//! everything is handed around behind `Arc` and stays immutable afterwards.

use std::sync::Arc;

use anyhow::{bail, Context};
use hermes_config::{HermesConfig, SourceRegistry, VectorStoreKind};
use hermes_db::{
    PgEnrichmentStore, PgSourceReader, PgStateStore, SourceReader, StateStore,
};
use hermes_embed::{create_embedder, Embedder, RemoteEmbedderConfig};
use hermes_search::{QueryExpander, SearchOrchestrator};
use hermes_store::{LocalHnswStore, RemoteStore, RemoteStoreConfig, VectorStore};
use tracing::info;

/// Shared state handed to HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SearchOrchestrator>,
    pub state_store: Arc<dyn StateStore>,
    pub store: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub registry: SourceRegistry,
}

/// Everything the serve and sync paths need.
pub struct Components {
    pub registry: SourceRegistry,
    pub reader: Arc<dyn SourceReader>,
    pub state_store: Arc<dyn StateStore>,
    pub enrichment: Arc<PgEnrichmentStore>,
    pub store: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub orchestrator: Arc<SearchOrchestrator>,
}

/// Build all components from a validated configuration.
pub async fn build(config: &HermesConfig) -> anyhow::Result<Components> {
    let registry = config.registry()?;

    let pool = hermes_db::connect(&config.postgres.dsn, config.postgres.max_connections)
        .await
        .context("failed to connect to Postgres")?;
    let reader: Arc<dyn SourceReader> = Arc::new(PgSourceReader::new(pool.clone()));
    let state_store: Arc<dyn StateStore> =
        Arc::new(PgStateStore::new(pool.clone(), &config.bitmagnet.schema)?);
    let enrichment = Arc::new(PgEnrichmentStore::new(pool, &config.bitmagnet.schema)?);

    let embedder = create_embedder(
        RemoteEmbedderConfig {
            url: config.embedding.url.clone(),
            model: config.embedding.model.clone(),
            dim: config.embedding.dim,
            timeout_seconds: config.embedding.timeout_seconds,
            query_prefix: config.embedding.query_prefix.clone(),
            document_prefix: config.embedding.document_prefix.clone(),
            max_batch: config.embedding.max_batch,
            max_in_flight: config.embedding.max_in_flight,
            queue_depth: config.embedding.queue_depth,
            max_retries: config.embedding.max_retries,
        },
        config.embedding.local_fallback,
    )
    .await
    .context("failed to build embedding provider")?;

    // The store dimension follows the active provider, so a fallback with a
    // different model cannot silently write into the wrong space.
    let dim = embedder.dim();
    let store: Arc<dyn VectorStore> = match config.vector_store.kind {
        VectorStoreKind::Hnsw => {
            let Some(path) = &config.vector_store.path else {
                bail!("vector_store.path is required for the hnsw backend");
            };
            Arc::new(LocalHnswStore::new(
                path.clone(),
                dim,
                config.vector_store.ef_search,
            ))
        }
        VectorStoreKind::Remote => {
            let (Some(url), Some(collection)) = (
                config.vector_store.url.clone(),
                config.vector_store.collection.clone(),
            ) else {
                bail!("vector_store.url and .collection are required for the remote backend");
            };
            Arc::new(
                RemoteStore::connect(RemoteStoreConfig {
                    url,
                    collection,
                    dim,
                    timeout_seconds: config.vector_store.timeout_seconds,
                    http_timeout_seconds: config.vector_store.http_timeout_seconds,
                })
                .await?,
            )
        }
    };
    store.ensure(dim).await?;
    info!(
        "Vector store ready ({}, dim {})",
        config.vector_store.kind, dim
    );

    let expander = QueryExpander::new(
        Arc::clone(&enrichment) as _,
        config.tmdb.query_expand_timeout_ms,
    );
    let orchestrator = Arc::new(SearchOrchestrator::new(
        registry.clone(),
        Arc::clone(&reader),
        Arc::clone(&store),
        Arc::clone(&embedder),
        expander,
        config.search.clone(),
        config.tmdb.query_expand,
    ));

    Ok(Components {
        registry,
        reader,
        state_store,
        enrichment,
        store,
        embedder,
        orchestrator,
    })
}

impl Components {
    /// View of the components the HTTP layer needs.
    pub fn app_state(&self) -> AppState {
        AppState {
            orchestrator: Arc::clone(&self.orchestrator),
            state_store: Arc::clone(&self.state_store),
            store: Arc::clone(&self.store),
            embedder: Arc::clone(&self.embedder),
            registry: self.registry.clone(),
        }
    }
}
