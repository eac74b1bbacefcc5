//! TMDB metadata client.
//!
//! Two calls per candidate: `GET /search/multi` to resolve the title, then a
//! detail fetch with `append_to_response=alternative_titles,keywords,credits`
//! to fill aka, keywords, genres, and people in one round trip. Rate limiting
//! and per-request timeouts live in the worker; this client only shapes
//! requests and responses.

use std::time::Duration;

use async_trait::async_trait;
use hermes_db::{ContentKey, EnrichmentRow};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::enrich::MetadataLookup;
use crate::error::{Result, SyncError};

/// Configuration for the TMDB client.
#[derive(Debug, Clone)]
pub struct TmdbClientConfig {
    /// API base URL (e.g. `https://api.themoviedb.org/3`)
    pub api_url: String,
    /// Bearer token
    pub api_key: String,
    /// HTTP timeout in seconds
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    id: i64,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    first_air_date: Option<String>,
    #[serde(default)]
    poster_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetailResponse {
    #[serde(default)]
    overview: Option<String>,
    #[serde(default)]
    genres: Vec<Genre>,
    #[serde(default)]
    alternative_titles: Option<AlternativeTitles>,
    #[serde(default)]
    keywords: Option<Keywords>,
    #[serde(default)]
    credits: Option<Credits>,
}

#[derive(Debug, Deserialize)]
struct Genre {
    name: String,
}

#[derive(Debug, Deserialize, Default)]
struct AlternativeTitles {
    // Movies use `titles`, TV uses `results`.
    #[serde(default)]
    titles: Vec<AltTitle>,
    #[serde(default)]
    results: Vec<AltTitle>,
}

#[derive(Debug, Deserialize)]
struct AltTitle {
    title: String,
}

#[derive(Debug, Deserialize, Default)]
struct Keywords {
    #[serde(default)]
    keywords: Vec<Named>,
    #[serde(default)]
    results: Vec<Named>,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

#[derive(Debug, Deserialize, Default)]
struct Credits {
    #[serde(default)]
    cast: Vec<CastMember>,
    #[serde(default)]
    crew: Vec<CrewMember>,
}

#[derive(Debug, Deserialize)]
struct CastMember {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CrewMember {
    name: String,
    #[serde(default)]
    job: Option<String>,
}

/// HTTP client for the TMDB API.
pub struct TmdbClient {
    client: Client,
    api_url: String,
    api_key: String,
}

impl TmdbClient {
    pub fn new(config: TmdbClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| SyncError::Metadata(format!("HTTP client error: {e}")))?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{}", self.api_url, path))
            .bearer_auth(&self.api_key)
            .query(query)
            .send()
            .await
            .map_err(|e| SyncError::Metadata(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SyncError::Metadata(format!(
                "API returned {}",
                response.status()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::Metadata(format!("bad response: {e}")))
    }

    /// Pick the best search result: same media type as the candidate when
    /// possible, then year agreement.
    fn pick_result<'a>(
        &self,
        key: &ContentKey,
        results: &'a [SearchResult],
    ) -> Option<&'a SearchResult> {
        let wanted_type = match key.content_type.as_str() {
            "movie" => "movie",
            "tv_show" | "tv" => "tv",
            other => other,
        };

        let typed: Vec<&SearchResult> = results
            .iter()
            .filter(|r| r.media_type.as_deref() == Some(wanted_type))
            .collect();
        let pool = if typed.is_empty() {
            results.iter().collect::<Vec<_>>()
        } else {
            typed
        };

        if let Some(year) = key.release_year {
            let year_prefix = year.to_string();
            if let Some(hit) = pool.iter().find(|r| {
                r.release_date
                    .as_deref()
                    .or(r.first_air_date.as_deref())
                    .map(|d| d.starts_with(&year_prefix))
                    .unwrap_or(false)
            }) {
                return Some(hit);
            }
        }
        pool.first().copied()
    }
}

#[async_trait]
impl MetadataLookup for TmdbClient {
    async fn lookup(&self, key: &ContentKey) -> Result<Option<EnrichmentRow>> {
        let Some(title) = key.title.as_deref().filter(|t| !t.trim().is_empty()) else {
            return Ok(None);
        };

        let search: SearchResponse = self
            .get_json("/search/multi", &[("query", title), ("include_adult", "true")])
            .await?;
        let Some(hit) = self.pick_result(key, &search.results) else {
            debug!("No TMDB match for '{}'", title);
            return Ok(None);
        };

        let media_type = hit.media_type.as_deref().unwrap_or("movie");
        let detail_path = format!("/{}/{}", media_type, hit.id);
        let detail: DetailResponse = self
            .get_json(
                &detail_path,
                &[(
                    "append_to_response",
                    "alternative_titles,keywords,credits",
                )],
            )
            .await?;

        let display_title = hit.title.clone().or_else(|| hit.name.clone());
        let aka = detail.alternative_titles.map(|alt| {
            alt.titles
                .iter()
                .chain(alt.results.iter())
                .map(|t| t.title.clone())
                .collect::<Vec<_>>()
                .join(",")
        });
        let keywords = detail.keywords.map(|kw| {
            kw.keywords
                .iter()
                .chain(kw.results.iter())
                .map(|k| k.name.clone())
                .collect::<Vec<_>>()
                .join(",")
        });
        let genre = (!detail.genres.is_empty()).then(|| {
            detail
                .genres
                .iter()
                .map(|g| g.name.clone())
                .collect::<Vec<_>>()
                .join(",")
        });
        let (directors, actors) = match detail.credits {
            Some(credits) => {
                let directors: Vec<String> = credits
                    .crew
                    .iter()
                    .filter(|c| c.job.as_deref() == Some("Director"))
                    .map(|c| c.name.clone())
                    .collect();
                let actors: Vec<String> =
                    credits.cast.iter().take(8).map(|c| c.name.clone()).collect();
                (
                    (!directors.is_empty()).then(|| directors.join(",")),
                    (!actors.is_empty()).then(|| actors.join(",")),
                )
            }
            None => (None, None),
        };
        let release_year = hit
            .release_date
            .as_deref()
            .or(hit.first_air_date.as_deref())
            .and_then(|d| d.get(..4))
            .and_then(|y| y.parse::<i32>().ok());

        Ok(Some(EnrichmentRow {
            content_type: key.content_type.clone(),
            content_source: key.content_source.clone(),
            content_id: key.content_id.clone(),
            title: display_title,
            aka: aka.filter(|s| !s.is_empty()),
            keywords: keywords.filter(|s| !s.is_empty()),
            plot: detail.overview,
            genre,
            directors,
            actors,
            release_year: release_year.or(key.release_year),
            poster_path: hit.poster_path.clone(),
            status: Some("ok".into()),
        }))
    }
}
