//! Remote collection-based vector store (Qdrant).
//!
//! Every operation is an RPC; payload filters are translated to the
//! collection's filter grammar for the keys in [`crate::types::fields`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    value::Kind, vectors_config::Config, Condition, CountPointsBuilder,
    CreateCollectionBuilder, CreateFieldIndexCollectionBuilder, DeletePointsBuilder, FieldType,
    Filter, MinShould, PointId, PointStruct, Range, SearchPointsBuilder, UpsertPointsBuilder,
    Value, VectorParams, VectorsConfig,
};
use qdrant_client::{Payload, Qdrant};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::traits::VectorStore;
use crate::types::{
    fields, point_id, sort_scored, PayloadFilter, PointRecord, ScoredPoint, StoreHealth,
    VectorPayload,
};

/// Configuration for the remote backend.
#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    /// Server URL (e.g. `http://localhost:6334`)
    pub url: String,
    /// Collection name
    pub collection: String,
    /// Vector dimension
    pub dim: usize,
    /// Search timeout in seconds
    pub timeout_seconds: u64,
    /// Metadata-operation timeout in seconds
    pub http_timeout_seconds: u64,
}

/// Qdrant-backed vector store.
pub struct RemoteStore {
    client: Qdrant,
    collection: String,
    dim: usize,
}

impl RemoteStore {
    /// Connect and verify the server answers.
    pub async fn connect(config: RemoteStoreConfig) -> Result<Self> {
        info!("Connecting to vector store at {}", config.url);

        let client = Qdrant::from_url(&config.url)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .connect_timeout(Duration::from_secs(config.http_timeout_seconds))
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build client: {e}")))?;

        client
            .list_collections()
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to connect: {e}")))?;

        Ok(Self {
            client,
            collection: config.collection,
            dim: config.dim,
        })
    }

    /// Create payload indexes for the filterable fields.
    async fn create_payload_indexes(&self) -> Result<()> {
        for (field, field_type) in [
            (fields::SOURCE, FieldType::Keyword),
            (fields::CONTENT_TYPE, FieldType::Keyword),
            (fields::GENRES, FieldType::Keyword),
            (fields::HAS_TMDB, FieldType::Bool),
            (fields::SIZE, FieldType::Integer),
            (fields::NSFW_SCORE, FieldType::Float),
        ] {
            self.client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    &self.collection,
                    field,
                    field_type,
                ))
                .await?;
        }
        debug!("Payload indexes created for '{}'", self.collection);
        Ok(())
    }

    /// Read the dimension of an existing collection, when reported.
    async fn existing_dim(&self) -> Result<Option<usize>> {
        let info = self.client.collection_info(&self.collection).await?;
        let dim = info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config)
            .and_then(|c| match c {
                Config::Params(params) => Some(params.size as usize),
                Config::ParamsMap(_) => None,
            });
        Ok(dim)
    }
}

/// Translate a payload filter to the collection's filter grammar.
///
/// `nsfw_below` uses `must_not gte` rather than `must lt` so unclassified
/// rows (no `nsfw_score` field) keep passing.
fn to_remote_filter(filter: &PayloadFilter) -> Option<Filter> {
    if filter.is_empty() {
        return None;
    }

    let mut result = Filter::default();

    if let Some(threshold) = filter.nsfw_below {
        result.must_not.push(Condition::range(
            fields::NSFW_SCORE,
            Range {
                gte: Some(f64::from(threshold)),
                ..Default::default()
            },
        ));
    }
    if filter.tmdb_only {
        result.must.push(Condition::matches(fields::HAS_TMDB, true));
    }
    if let Some(min) = filter.size_min {
        result.must.push(Condition::range(
            fields::SIZE,
            Range {
                gte: Some(min as f64),
                ..Default::default()
            },
        ));
    }
    if !filter.genres_any.is_empty() {
        result.should = filter
            .genres_any
            .iter()
            .map(|g| Condition::matches(fields::GENRES, g.clone()))
            .collect();
        result.min_should = Some(MinShould {
            conditions: vec![],
            min_count: 1,
        });
    }

    Some(result)
}

fn get_string(payload: &HashMap<String, Value>, key: &str) -> Option<String> {
    match payload.get(key).and_then(|v| v.kind.as_ref()) {
        Some(Kind::StringValue(s)) => Some(s.clone()),
        _ => None,
    }
}

fn get_f64(payload: &HashMap<String, Value>, key: &str) -> Option<f64> {
    match payload.get(key).and_then(|v| v.kind.as_ref()) {
        Some(Kind::DoubleValue(d)) => Some(*d),
        Some(Kind::IntegerValue(i)) => Some(*i as f64),
        _ => None,
    }
}

fn get_i64(payload: &HashMap<String, Value>, key: &str) -> Option<i64> {
    match payload.get(key).and_then(|v| v.kind.as_ref()) {
        Some(Kind::IntegerValue(i)) => Some(*i),
        _ => None,
    }
}

fn get_bool(payload: &HashMap<String, Value>, key: &str) -> Option<bool> {
    match payload.get(key).and_then(|v| v.kind.as_ref()) {
        Some(Kind::BoolValue(b)) => Some(*b),
        _ => None,
    }
}

fn get_string_list(payload: &HashMap<String, Value>, key: &str) -> Option<Vec<String>> {
    match payload.get(key).and_then(|v| v.kind.as_ref()) {
        Some(Kind::ListValue(list)) => Some(
            list.values
                .iter()
                .filter_map(|item| match item.kind.as_ref() {
                    Some(Kind::StringValue(s)) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
        ),
        _ => None,
    }
}

/// Decode a stored payload back into [`VectorPayload`].
fn decode_payload(payload: &HashMap<String, Value>) -> VectorPayload {
    VectorPayload {
        source: get_string(payload, fields::SOURCE).unwrap_or_default(),
        pg_id: get_string(payload, fields::PG_ID).unwrap_or_default(),
        text_hash: get_string(payload, fields::TEXT_HASH).unwrap_or_default(),
        embedding_version: get_string(payload, fields::EMBEDDING_VERSION).unwrap_or_default(),
        nsfw_score: get_f64(payload, fields::NSFW_SCORE).map(|d| d as f32),
        content_type: get_string(payload, fields::CONTENT_TYPE),
        has_tmdb: get_bool(payload, fields::HAS_TMDB),
        tmdb_id: get_string(payload, fields::TMDB_ID),
        size: get_i64(payload, fields::SIZE),
        languages: get_string_list(payload, fields::LANGUAGES),
        subtitles: get_string_list(payload, fields::SUBTITLES),
        genres: get_string_list(payload, fields::GENRES),
    }
}

#[async_trait]
impl VectorStore for RemoteStore {
    async fn ensure(&self, dim: usize) -> Result<()> {
        if dim != self.dim {
            return Err(StoreError::DimMismatch {
                existing: self.dim,
                configured: dim,
            });
        }

        if self.client.collection_exists(&self.collection).await? {
            if let Some(existing) = self.existing_dim().await? {
                if existing != dim {
                    return Err(StoreError::DimMismatch {
                        existing,
                        configured: dim,
                    });
                }
            }
            debug!("Collection '{}' already exists", self.collection);
            return Ok(());
        }

        info!(
            "Creating collection '{}' (dim={}, distance=Cosine)",
            self.collection, dim
        );

        let vectors_config = VectorsConfig {
            config: Some(Config::Params(VectorParams {
                size: dim as u64,
                distance: qdrant_client::qdrant::Distance::Cosine.into(),
                ..Default::default()
            })),
        };

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection).vectors_config(vectors_config),
            )
            .await?;

        self.create_payload_indexes().await?;

        info!("Collection '{}' created", self.collection);
        Ok(())
    }

    async fn upsert(&self, batch: Vec<PointRecord>) -> Result<Vec<i64>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(batch.len());
        let mut points = Vec::with_capacity(batch.len());
        for record in batch {
            if record.vector.len() != self.dim {
                return Err(StoreError::BadVector {
                    expected: self.dim,
                    actual: record.vector.len(),
                });
            }
            let id = record
                .id
                .unwrap_or_else(|| point_id(&record.payload.source, &record.payload.pg_id));
            let payload = Payload::try_from(serde_json::to_value(&record.payload)?)
                .map_err(|e| StoreError::Persistence(format!("payload conversion: {e}")))?;
            points.push(PointStruct::new(id as u64, record.vector, payload));
            ids.push(id);
        }

        debug!(
            "Upserting {} points to '{}'",
            points.len(),
            self.collection
        );
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, points).wait(true))
            .await?;

        Ok(ids)
    }

    async fn delete(&self, ids: Vec<i64>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let point_ids: Vec<PointId> = ids.into_iter().map(|id| PointId::from(id as u64)).collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(point_ids)
                    .wait(true),
            )
            .await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: Vec<f32>,
        k: usize,
        filter: Option<PayloadFilter>,
    ) -> Result<Vec<ScoredPoint>> {
        if vector.len() != self.dim {
            return Err(StoreError::BadVector {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut request = SearchPointsBuilder::new(&self.collection, vector, k as u64)
            .with_payload(true);
        if let Some(remote_filter) = filter.as_ref().and_then(to_remote_filter) {
            request = request.filter(remote_filter);
        }

        let response = self.client.search_points(request).await?;

        let mut hits: Vec<ScoredPoint> = response
            .result
            .into_iter()
            .filter_map(|point| {
                let id = match point.id?.point_id_options? {
                    qdrant_client::qdrant::point_id::PointIdOptions::Num(n) => n as i64,
                    qdrant_client::qdrant::point_id::PointIdOptions::Uuid(_) => return None,
                };
                Some(ScoredPoint {
                    id,
                    score: point.score,
                    payload: decode_payload(&point.payload),
                })
            })
            .collect();

        // The server sorts by score; re-sort for the deterministic id
        // tie-break the merge layer relies on.
        sort_scored(&mut hits);
        Ok(hits)
    }

    async fn count(&self) -> Result<u64> {
        let response = self
            .client
            .count(CountPointsBuilder::new(&self.collection).exact(true))
            .await?;
        Ok(response.result.map(|r| r.count).unwrap_or(0))
    }

    async fn health(&self) -> Result<StoreHealth> {
        let ok = self.client.health_check().await.is_ok();
        let points = if ok { self.count().await.unwrap_or(0) } else { 0 };
        Ok(StoreHealth {
            ok,
            backend: "remote",
            points,
            dim: self.dim,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_translates_to_none() {
        assert!(to_remote_filter(&PayloadFilter::default()).is_none());
    }

    #[test]
    fn test_filter_translation_shapes() {
        let filter = PayloadFilter {
            nsfw_below: Some(0.8),
            tmdb_only: true,
            size_min: Some(1_000_000),
            genres_any: vec!["Animation".into(), "Comedy".into()],
        };
        let remote = to_remote_filter(&filter).unwrap();

        // nsfw goes to must_not so unclassified rows pass
        assert_eq!(remote.must_not.len(), 1);
        // has_tmdb + size
        assert_eq!(remote.must.len(), 2);
        // genres as should with min_count 1
        assert_eq!(remote.should.len(), 2);
        assert_eq!(remote.min_should.as_ref().unwrap().min_count, 1);
    }

    #[test]
    fn test_decode_payload_roundtrip_fields() {
        let mut map = HashMap::new();
        map.insert(
            fields::SOURCE.to_string(),
            Value {
                kind: Some(Kind::StringValue("bitmagnet_torrents".into())),
            },
        );
        map.insert(
            fields::PG_ID.to_string(),
            Value {
                kind: Some(Kind::StringValue("abc123".into())),
            },
        );
        map.insert(
            fields::NSFW_SCORE.to_string(),
            Value {
                kind: Some(Kind::DoubleValue(0.25)),
            },
        );
        map.insert(
            fields::SIZE.to_string(),
            Value {
                kind: Some(Kind::IntegerValue(42)),
            },
        );
        map.insert(
            fields::HAS_TMDB.to_string(),
            Value {
                kind: Some(Kind::BoolValue(true)),
            },
        );

        let payload = decode_payload(&map);
        assert_eq!(payload.source, "bitmagnet_torrents");
        assert_eq!(payload.pg_id, "abc123");
        assert_eq!(payload.nsfw_score, Some(0.25));
        assert_eq!(payload.size, Some(42));
        assert_eq!(payload.has_tmdb, Some(true));
        assert!(payload.genres.is_none());
    }
}
