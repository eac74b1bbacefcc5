//! Enrichment-backed query expansion.
//!
//! Looks the user query up in the enrichment table and widens it with aka
//! titles and keywords. Everything here degrades silently: a slow or broken
//! lookup returns the query unexpanded and the search proceeds.

use std::sync::Arc;
use std::time::Duration;

use hermes_db::ExpansionLookup;
use tracing::debug;

/// Separators aka/keyword columns are split on. Never whitespace: multi-word
/// titles must survive splitting.
const TOKEN_SEPARATORS: [char; 6] = [',', '，', ';', '/', '·', '|'];

/// Most tokens appended to a query.
const MAX_TOKENS: usize = 8;
/// ASCII tokens forming the cross-language hop query.
const MAX_ENGLISH_TOKENS: usize = 3;

/// Result of one expansion pass.
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    /// Original query plus ranked expansion tokens
    pub expanded_query: String,
    /// Space-joined top ASCII tokens; empty when nothing matched
    pub english_expansion: String,
    /// Whether the lookup produced anything
    pub expanded: bool,
}

impl Expansion {
    /// Identity expansion for a query.
    pub fn unexpanded(query: &str) -> Self {
        Self {
            expanded_query: query.to_string(),
            english_expansion: String::new(),
            expanded: false,
        }
    }
}

/// Enrichment-backed query expander with a hard time budget.
pub struct QueryExpander {
    lookup: Arc<dyn ExpansionLookup>,
    timeout_ms: u64,
    lookup_limit: i64,
}

impl QueryExpander {
    pub fn new(lookup: Arc<dyn ExpansionLookup>, timeout_ms: u64) -> Self {
        Self {
            lookup,
            timeout_ms,
            lookup_limit: 20,
        }
    }

    /// Expand a query, returning it untouched on timeout or error.
    pub async fn expand(&self, query: &str) -> Expansion {
        let lookup = self.lookup.search_expansion(query, self.lookup_limit, self.timeout_ms);
        let hits = match tokio::time::timeout(Duration::from_millis(self.timeout_ms), lookup).await
        {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => {
                debug!("Query expansion skipped: {}", e);
                return Expansion::unexpanded(query);
            }
            Err(_) => {
                debug!("Query expansion timed out after {} ms", self.timeout_ms);
                return Expansion::unexpanded(query);
            }
        };
        if hits.is_empty() {
            return Expansion::unexpanded(query);
        }

        let mut raw: Vec<String> = Vec::new();
        for hit in &hits {
            for field in [&hit.aka, &hit.keywords] {
                if let Some(value) = field {
                    raw.extend(split_tokens(value));
                }
            }
        }

        let tokens = rank_tokens(query, raw);
        if tokens.is_empty() {
            return Expansion::unexpanded(query);
        }

        let english: Vec<&String> = tokens
            .iter()
            .filter(|t| t.is_ascii())
            .take(MAX_ENGLISH_TOKENS)
            .collect();

        Expansion {
            expanded_query: format!("{} {}", query, tokens.join(" ")),
            english_expansion: english
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" "),
            expanded: true,
        }
    }
}

/// Split an aka/keywords column into candidate tokens.
pub fn split_tokens(value: &str) -> Vec<String> {
    value
        .split(|c: char| TOKEN_SEPARATORS.contains(&c) || c == '\n')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Rank candidate tokens: ASCII tokens of length >= 3 first, then the rest,
/// both in order of appearance; dedupe case-insensitively; drop the query
/// itself; cap at [`MAX_TOKENS`].
pub fn rank_tokens(query: &str, candidates: Vec<String>) -> Vec<String> {
    let query_lower = query.to_lowercase();
    let mut seen: Vec<String> = Vec::new();
    let mut preferred: Vec<String> = Vec::new();
    let mut fallback: Vec<String> = Vec::new();

    for token in candidates {
        let lower = token.to_lowercase();
        if lower == query_lower || seen.contains(&lower) {
            continue;
        }
        seen.push(lower);
        if token.is_ascii() && token.len() >= 3 {
            preferred.push(token);
        } else {
            fallback.push(token);
        }
    }

    preferred.extend(fallback);
    preferred.truncate(MAX_TOKENS);
    preferred
}
