use std::sync::Arc;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::sync::OnceCell;

use super::{VectorStore, VectorStoreError};
use crate::config::VectorBackend;
use crate::mirror::MirrorStore;
use crate::selector::Selector;
use crate::types::{EmbeddingItem, Metadata, MirrorDocument, SearchResult};
use crate::upstream::{UpstreamError, send_json};

/// Metadata key listing which fields were JSON-stringified on the way in.
pub const JSON_FIELDS_KEY: &str = "__json_fields";

/// Chroma over its v1 REST API. Filters are pushed to the server.
pub struct ChromaStore {
    client: Client,
    host: String,
    collection: String,
    collection_id: OnceCell<String>,
    mirror: Arc<MirrorStore>,
}

#[derive(Deserialize)]
struct CollectionResponse {
    id: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    ids: Vec<Vec<String>>,
    #[serde(default)]
    distances: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<Map<String, Value>>>>>,
}

impl ChromaStore {
    pub fn new(host: &str, collection: &str, mirror: Arc<MirrorStore>) -> Self {
        Self {
            client: Client::new(),
            host: host.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            collection_id: OnceCell::new(),
            mirror,
        }
    }

    /// Resolve (creating if needed) the collection id once per store.
    async fn collection_id(&self) -> Result<&str, VectorStoreError> {
        let id = self
            .collection_id
            .get_or_try_init(|| async {
                let url = format!("{}/api/v1/collections", self.host);
                let response: CollectionResponse = send_json(
                    self.client
                        .post(&url)
                        .json(&json!({"name": self.collection, "get_or_create": true})),
                )
                .await?;
                log::debug!("chroma collection '{}' has id {}", self.collection, response.id);
                Ok::<_, VectorStoreError>(response.id)
            })
            .await?;
        Ok(id.as_str())
    }
}

/// Chroma only stores scalar metadata. Lists and objects travel as JSON
/// strings and their field names are recorded under [`JSON_FIELDS_KEY`].
/// Nulls are dropped.
pub fn encode_metadata(metadata: &Metadata) -> Metadata {
    let mut encoded = Map::new();
    let mut json_fields = Vec::new();

    for (key, value) in metadata {
        match value {
            Value::Null => {}
            Value::Array(_) | Value::Object(_) => {
                encoded.insert(key.clone(), Value::String(value.to_string()));
                json_fields.push(key.clone());
            }
            _ => {
                encoded.insert(key.clone(), value.clone());
            }
        }
    }

    if !json_fields.is_empty() {
        encoded.insert(
            JSON_FIELDS_KEY.to_string(),
            Value::String(Value::from(json_fields).to_string()),
        );
    }
    encoded
}

/// Inverse of [`encode_metadata`]. Fields that fail to parse stay strings.
pub fn decode_metadata(mut metadata: Metadata) -> Metadata {
    let Some(Value::String(fields)) = metadata.remove(JSON_FIELDS_KEY) else {
        return metadata;
    };
    let names: Vec<String> = serde_json::from_str(&fields).unwrap_or_default();

    for name in names {
        if let Some(Value::String(raw)) = metadata.get(&name) {
            match serde_json::from_str::<Value>(raw) {
                Ok(parsed) => {
                    metadata.insert(name, parsed);
                }
                Err(e) => log::warn!("chroma metadata field '{name}' is not valid JSON: {e}"),
            }
        }
    }
    metadata
}

/// Chroma rejects a top-level `where` with more than one key, so several
/// implicit conditions are combined under `$and`. Empty filters are omitted.
///
/// Chroma accepts a subset of the local selector: top-level field names only
/// (no dotted paths) and no `$exists`. Anything else is rejected here.
fn chroma_where(filter: Option<&Value>) -> Result<Option<Value>, VectorStoreError> {
    let Some(filter) = filter else {
        return Ok(None);
    };
    Selector::parse(filter)?;
    check_chroma_subset(filter)?;

    let Some(object) = filter.as_object() else {
        return Ok(None);
    };
    Ok(match object.len() {
        0 => None,
        1 => Some(filter.clone()),
        _ => Some(json!({
            "$and": object
                .iter()
                .map(|(k, v)| {
                    let mut condition = Map::new();
                    condition.insert(k.clone(), v.clone());
                    Value::Object(condition)
                })
                .collect::<Vec<_>>()
        })),
    })
}

fn check_chroma_subset(filter: &Value) -> Result<(), VectorStoreError> {
    let unsupported = |message: String| VectorStoreError::UnsupportedFilter {
        backend: VectorBackend::Chroma,
        message,
    };
    let Some(object) = filter.as_object() else {
        return Ok(());
    };
    for (key, value) in object {
        match key.as_str() {
            "$and" | "$or" => {
                for clause in value.as_array().into_iter().flatten() {
                    check_chroma_subset(clause)?;
                }
            }
            field if field.contains('.') => {
                return Err(unsupported(format!("nested field '{field}'")));
            }
            field => {
                if value.as_object().is_some_and(|ops| ops.contains_key("$exists")) {
                    return Err(unsupported(format!("$exists on '{field}'")));
                }
            }
        }
    }
    Ok(())
}

fn build_query_body(query_vector: &[f32], limit: usize, where_clause: Option<Value>) -> Value {
    let mut body = json!({
        "query_embeddings": [query_vector],
        "n_results": limit,
        "include": ["distances", "metadatas"],
    });
    if let Some(clause) = where_clause {
        body["where"] = clause;
    }
    body
}

fn parse_query_response(response: QueryResponse, limit: usize) -> Result<Vec<SearchResult>, VectorStoreError> {
    let ids = response.ids.into_iter().next().unwrap_or_default();
    let distances = response
        .distances
        .and_then(|d| d.into_iter().next())
        .unwrap_or_default();
    let mut metadatas = response
        .metadatas
        .and_then(|m| m.into_iter().next())
        .unwrap_or_default()
        .into_iter();

    if distances.len() != ids.len() {
        return Err(UpstreamError::MalformedResponse(format!(
            "chroma returned {} ids but {} distances",
            ids.len(),
            distances.len()
        ))
        .into());
    }

    Ok(ids
        .into_iter()
        .zip(distances)
        .map(|(id, distance)| SearchResult {
            id,
            distance,
            metadata: decode_metadata(metadatas.next().flatten().unwrap_or_default()),
        })
        .take(limit)
        .collect())
}

impl VectorStore for ChromaStore {
    async fn upsert_items(&self, items: &[EmbeddingItem]) -> Result<(), VectorStoreError> {
        if items.is_empty() {
            return Ok(());
        }

        let id = self.collection_id().await?;
        let body = json!({
            "ids": items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(),
            "embeddings": items.iter().map(|i| &i.vector).collect::<Vec<_>>(),
            "metadatas": items.iter().map(|i| encode_metadata(&i.metadata)).collect::<Vec<_>>(),
        });
        let url = format!("{}/api/v1/collections/{id}/upsert", self.host);
        let _: Value = send_json(self.client.post(&url).json(&body)).await?;
        log::debug!("chroma: upserted {} items into '{}'", items.len(), self.collection);

        self.mirror.put(items)?;
        Ok(())
    }

    async fn search_items(
        &self,
        _query_text: &str,
        query_vector: &[f32],
        limit: usize,
        where_filter: Option<&Value>,
    ) -> Result<Vec<SearchResult>, VectorStoreError> {
        let where_clause = chroma_where(where_filter)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let id = self.collection_id().await?;
        let url = format!("{}/api/v1/collections/{id}/query", self.host);
        let body = build_query_body(query_vector, limit, where_clause);
        let response: QueryResponse = send_json(self.client.post(&url).json(&body)).await?;
        parse_query_response(response, limit)
    }

    async fn retrieve_items(&self, ids: &[String]) -> Result<Vec<MirrorDocument>, VectorStoreError> {
        Ok(self.mirror.query(&Selector::id_in(ids))?)
    }

    fn backend(&self) -> VectorBackend {
        VectorBackend::Chroma
    }
}
