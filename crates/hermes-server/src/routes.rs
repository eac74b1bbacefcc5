//! HTTP surface.
//!
//! `GET /search`, `GET /search_keyword`, `GET /hydrate`, `GET /status`, and
//! `GET /health`, all JSON. Errors use the uniform
//! `{"error": {"kind", "message"}}` body; expansion and secondary-search
//! problems never surface here because the orchestrator degrades them away.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use hermes_search::{SearchError, SearchRequest};

use crate::state::AppState;

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/search", get(search))
        .route("/search_keyword", get(search_keyword))
        .route("/hydrate", get(hydrate))
        .route("/status", get(status))
        .route("/health", get(health))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Uniform API error body.
pub struct ApiError {
    kind: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Map an error kind to its HTTP status.
    pub fn status_for(kind: &str) -> StatusCode {
        match kind {
            "EMPTY_QUERY" => StatusCode::BAD_REQUEST,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "EMBED_UNAVAILABLE" | "EMBED_BUSY" | "VECTOR_UNAVAILABLE" | "DB_UNAVAILABLE" => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SearchError> for ApiError {
    fn from(err: SearchError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = Self::status_for(self.kind);
        let body = json!({ "error": { "kind": self.kind, "message": self.message } });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct SearchParams {
    #[serde(default)]
    q: Option<String>,
    topk: Option<usize>,
    /// Alias for `topk` kept for older clients.
    page_size: Option<usize>,
    fetch_k: Option<usize>,
    cursor: Option<usize>,
    exclude_nsfw: Option<bool>,
    #[serde(default)]
    tmdb_only: bool,
    size_min_bytes: Option<i64>,
    tmdb_expand: Option<bool>,
    #[serde(default)]
    lite: bool,
    #[serde(default)]
    debug: bool,
}

impl SearchParams {
    fn into_request(self) -> SearchRequest {
        SearchRequest {
            q: self.q.unwrap_or_default(),
            topk: self.topk.or(self.page_size),
            fetch_k: self.fetch_k,
            exclude_nsfw: self.exclude_nsfw,
            tmdb_only: self.tmdb_only,
            size_min_bytes: self.size_min_bytes,
            tmdb_expand: self.tmdb_expand,
            lite: self.lite,
            debug: self.debug,
            cursor: self.cursor,
        }
    }
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let request = params.into_request();
    let response = state.orchestrator.search(&request).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct KeywordParams {
    #[serde(default)]
    q: Option<String>,
    topk: Option<usize>,
}

async fn search_keyword(
    State(state): State<AppState>,
    Query(params): Query<KeywordParams>,
) -> Result<impl IntoResponse, ApiError> {
    let q = params.q.unwrap_or_default();
    let response = state
        .orchestrator
        .search_keyword(&q, params.topk.unwrap_or(20))
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct HydrateParams {
    source: String,
    id: String,
}

async fn hydrate(
    State(state): State<AppState>,
    Query(params): Query<HydrateParams>,
) -> Result<impl IntoResponse, ApiError> {
    let hit = state
        .orchestrator
        .hydrate_one(&params.source, &params.id)
        .await?;
    Ok(Json(hit))
}

async fn status(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let mut sources = serde_json::Map::new();
    for source in state.registry.iter() {
        let stats = state
            .state_store
            .source_stats(&source.name)
            .await
            .map_err(|e| ApiError::new(e.kind(), e.to_string()))?;
        sources.insert(source.name.clone(), serde_json::to_value(stats).unwrap_or_default());
    }

    let store = state
        .store
        .health()
        .await
        .map_err(|e| ApiError::new(e.kind(), e.to_string()))?;

    Ok(Json(json!({
        "sources": sources,
        "vector_store": store,
    })))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.health().await.ok();
    let embedding = state.embedder.check_status().await;
    let ok = store.as_ref().map(|s| s.ok).unwrap_or(false) && embedding.ok;

    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "ok": ok,
            "vector_store": store,
            "embedding": embedding,
        })),
    )
}
