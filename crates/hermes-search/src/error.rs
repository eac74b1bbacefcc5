//! Error types for hermes-search.

use thiserror::Error;

/// Errors surfaced by the search orchestrator.
#[derive(Error, Debug)]
pub enum SearchError {
    /// Query was empty after cleaning
    #[error("empty query")]
    EmptyQuery,

    /// Query embedding failed or timed out
    #[error(transparent)]
    Embed(#[from] hermes_embed::EmbedError),

    /// Vector store query failed
    #[error(transparent)]
    Store(#[from] hermes_store::StoreError),

    /// Hydration or keyword lookup failed
    #[error(transparent)]
    Db(#[from] hermes_db::DbError),

    /// Unknown source name in a request
    #[error("unknown source '{0}'")]
    UnknownSource(String),
}

impl SearchError {
    /// Stable error kind string used by the HTTP error body.
    pub fn kind(&self) -> &'static str {
        match self {
            SearchError::EmptyQuery => "EMPTY_QUERY",
            SearchError::Embed(e) => e.kind(),
            SearchError::Store(e) => e.kind(),
            SearchError::Db(e) => e.kind(),
            SearchError::UnknownSource(_) => "NOT_FOUND",
        }
    }
}

/// Result type for hermes-search operations.
pub type Result<T> = std::result::Result<T, SearchError>;
