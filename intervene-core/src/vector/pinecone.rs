use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::OnceCell;

use super::{OVERSAMPLE_FACTOR, VectorStore, VectorStoreError, refine_candidates, sort_by_distance};
use crate::config::VectorBackend;
use crate::mirror::MirrorStore;
use crate::selector::Selector;
use crate::types::{EmbeddingItem, Metadata, MirrorDocument, SearchResult};
use crate::upstream::send_json;

/// Longest id Pinecone accepts, in characters.
pub const MAX_ID_CHARS: usize = 511;

/// Upper bound on the serialized size of one upsert request body.
pub const MAX_BATCH_BYTES: usize = 4_000_000;

/// Pinecone over its REST API. It has no metadata filtering here, so search
/// oversamples and filters client-side.
pub struct PineconeStore {
    client: Client,
    api_key: String,
    index: String,
    controller: String,
    host: OnceCell<String>,
    mirror: Arc<MirrorStore>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PineconeRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: Metadata,
}

#[derive(Deserialize)]
struct DescribeIndexResponse {
    host: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Deserialize)]
struct QueryMatch {
    id: String,
    score: f32,
    #[serde(default)]
    metadata: Option<Metadata>,
}

impl PineconeStore {
    pub fn new(
        api_key: &str,
        index: &str,
        controller: &str,
        host: Option<&str>,
        mirror: Arc<MirrorStore>,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            index: index.to_string(),
            controller: controller.trim_end_matches('/').to_string(),
            host: OnceCell::new_with(host.map(normalize_host)),
            mirror,
        }
    }

    /// Data-plane base URL, looked up from the control plane on first use.
    async fn host(&self) -> Result<&str, VectorStoreError> {
        let host = self
            .host
            .get_or_try_init(|| async {
                let url = format!("{}/indexes/{}", self.controller, self.index);
                let response: DescribeIndexResponse =
                    send_json(self.client.get(&url).header("Api-Key", &self.api_key)).await?;
                let host = normalize_host(&response.host);
                log::debug!("pinecone index '{}' is served from {host}", self.index);
                Ok::<_, VectorStoreError>(host)
            })
            .await?;
        Ok(host.as_str())
    }

    async fn upsert_batch(&self, host: &str, batch: &[PineconeRecord]) -> Result<(), VectorStoreError> {
        let url = format!("{host}/vectors/upsert");
        let _: Value = send_json(
            self.client
                .post(&url)
                .header("Api-Key", &self.api_key)
                .json(&json!({ "vectors": batch })),
        )
        .await?;
        Ok(())
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

/// Cut `id` to at most [`MAX_ID_CHARS`] characters.
pub fn truncate_id(id: &str) -> String {
    id.chars().take(MAX_ID_CHARS).collect()
}

/// Pinecone metadata values are strings, numbers, booleans or lists of
/// strings. Nulls are dropped and anything else is sent as a JSON string.
pub fn sanitize_metadata(metadata: &Metadata) -> Metadata {
    metadata
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let value = match v {
                Value::Array(items) if items.iter().all(Value::is_string) => v.clone(),
                Value::Array(_) | Value::Object(_) => Value::String(v.to_string()),
                _ => v.clone(),
            };
            (k.clone(), value)
        })
        .collect()
}

/// Split records into upsert batches whose `{"vectors":[..]}` body stays
/// under `max_bytes`. A record too large on its own still gets a batch.
pub fn batch_records(records: Vec<PineconeRecord>, max_bytes: usize) -> Vec<Vec<PineconeRecord>> {
    // `{"vectors":[` + `]}`
    const ENVELOPE_BYTES: usize = 14;

    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = ENVELOPE_BYTES;

    for record in records {
        let record_bytes = serde_json::to_vec(&record).map(|b| b.len()).unwrap_or(0);
        let separator = usize::from(!current.is_empty());

        if separator == 1 && current_bytes + separator + record_bytes > max_bytes {
            batches.push(std::mem::take(&mut current));
            current_bytes = ENVELOPE_BYTES + record_bytes;
        } else {
            current_bytes += separator + record_bytes;
        }
        current.push(record);
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn to_record(item: &EmbeddingItem) -> PineconeRecord {
    PineconeRecord {
        id: truncate_id(&item.id),
        values: item.vector.clone(),
        metadata: sanitize_metadata(&item.metadata),
    }
}

/// Key mirror documents by the truncated id Pinecone knows them under. When
/// two documents share a truncated id the first stored one wins.
fn index_by_truncated_id(docs: Vec<MirrorDocument>) -> HashMap<String, MirrorDocument> {
    let mut by_id: HashMap<String, MirrorDocument> = HashMap::new();
    for doc in docs {
        let key = truncate_id(&doc.id);
        if let Some(existing) = by_id.get(&key) {
            log::warn!(
                "pinecone id collision: '{}' and '{}' truncate to the same id; keeping the first",
                existing.id,
                doc.id
            );
            continue;
        }
        by_id.insert(key, doc);
    }
    by_id
}

impl VectorStore for PineconeStore {
    async fn upsert_items(&self, items: &[EmbeddingItem]) -> Result<(), VectorStoreError> {
        if items.is_empty() {
            return Ok(());
        }

        let host = self.host().await?;
        let batches = batch_records(items.iter().map(to_record).collect(), MAX_BATCH_BYTES);
        for (i, batch) in batches.iter().enumerate() {
            self.upsert_batch(host, batch).await?;
            log::debug!(
                "pinecone: upserted batch {}/{} ({} vectors)",
                i + 1,
                batches.len(),
                batch.len()
            );
        }

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
        let selector = Selector::from_filter(where_filter)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let host = self.host().await?;
        let url = format!("{host}/query");
        let response: QueryResponse = send_json(
            self.client
                .post(&url)
                .header("Api-Key", &self.api_key)
                .json(&json!({
                    "vector": query_vector,
                    "topK": limit * OVERSAMPLE_FACTOR,
                    "includeMetadata": true,
                })),
        )
        .await?;

        let mut candidates: Vec<SearchResult> = response
            .matches
            .into_iter()
            .map(|m| SearchResult {
                id: m.id,
                distance: 1.0 - m.score,
                metadata: m.metadata.unwrap_or_else(Map::new),
            })
            .collect();
        sort_by_distance(&mut candidates);

        let ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let authoritative =
            index_by_truncated_id(self.mirror.find_by_truncated_ids(&ids, MAX_ID_CHARS)?);

        Ok(refine_candidates(candidates, authoritative, &selector, limit))
    }

    async fn retrieve_items(&self, ids: &[String]) -> Result<Vec<MirrorDocument>, VectorStoreError> {
        let mut docs = self.mirror.query(&Selector::id_in(ids))?;

        // Ids that came straight from Pinecone may be truncated.
        let missing: Vec<String> = {
            let found: HashSet<&str> = docs.iter().map(|d| d.id.as_str()).collect();
            ids.iter()
                .filter(|id| !found.contains(id.as_str()) && id.chars().count() == MAX_ID_CHARS)
                .cloned()
                .collect()
        };
        if !missing.is_empty() {
            let resolved = index_by_truncated_id(self.mirror.find_by_truncated_ids(&missing, MAX_ID_CHARS)?);
            docs.extend(missing.iter().filter_map(|id| resolved.get(id).cloned()));
        }
        Ok(docs)
    }

    fn backend(&self) -> VectorBackend {
        VectorBackend::Pinecone
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::Json;
    use axum::extract::{Path, State};
    use axum::http::HeaderMap;
    use axum::routing::{get, post};

    use super::*;
    use crate::fake_http;

    fn record(id: &str, dims: usize) -> PineconeRecord {
        PineconeRecord {
            id: id.into(),
            values: vec![0.5; dims],
            metadata: Map::new(),
        }
    }

    fn item(id: &str, vector: Vec<f32>, method: &str) -> EmbeddingItem {
        EmbeddingItem {
            id: id.into(),
            vector,
            metadata: json!({"method": method, "paths": ["/pets"], "servers": [{"url": "https://x"}]})
                .as_object()
                .unwrap()
                .clone(),
        }
    }

    #[test]
    fn truncate_id_counts_characters() {
        let long: String = "é".repeat(600);
        let cut = truncate_id(&long);
        assert_eq!(cut.chars().count(), MAX_ID_CHARS);
        assert_eq!(truncate_id("short"), "short");
    }

    #[test]
    fn sanitize_keeps_string_lists_and_stringifies_the_rest() {
        let metadata = json!({
            "paths": ["/a", "/b"],
            "servers": [{"url": "https://x"}],
            "mixed": [1, "two"],
            "count": 3,
            "gone": null,
        })
        .as_object()
        .unwrap()
        .clone();

        let clean = sanitize_metadata(&metadata);
        assert_eq!(clean["paths"], json!(["/a", "/b"]));
        assert_eq!(clean["servers"], r#"[{"url":"https://x"}]"#);
        assert_eq!(clean["mixed"], r#"[1,"two"]"#);
        assert_eq!(clean["count"], 3);
        assert!(!clean.contains_key("gone"));
    }

    #[test]
    fn batches_respect_byte_threshold_and_flush_remainder() {
        let one = serde_json::to_vec(&record("r0", 8)).unwrap().len();
        let threshold = 14 + one * 2 + 1;

        let records: Vec<_> = (0..5).map(|i| record(&format!("r{i}"), 8)).collect();
        let batches = batch_records(records, threshold);

        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        for batch in &batches {
            let body = serde_json::to_vec(&json!({ "vectors": batch })).unwrap();
            assert!(body.len() <= threshold);
        }
    }

    #[test]
    fn oversized_record_gets_its_own_batch() {
        let records = vec![record("small", 1), record("huge", 1000), record("small2", 1)];
        let batches = batch_records(records, 200);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1, 1, 1]);
    }

    #[test]
    fn normalize_host_adds_scheme_once() {
        assert_eq!(normalize_host("idx.svc.pinecone.io"), "https://idx.svc.pinecone.io");
        assert_eq!(normalize_host("http://127.0.0.1:9/"), "http://127.0.0.1:9");
    }

    /// Stores upserted vectors and answers queries with dot-product scores.
    #[derive(Default)]
    struct FakePinecone {
        host: String,
        describes: usize,
        upsert_calls: usize,
        vectors: Vec<Value>,
        top_k: Vec<u64>,
    }

    type Shared = Arc<Mutex<FakePinecone>>;

    fn check_key(headers: &HeaderMap) {
        assert_eq!(headers.get("Api-Key").unwrap(), "pc-key");
    }

    async fn describe(
        State(state): State<Shared>,
        Path(index): Path<String>,
        headers: HeaderMap,
    ) -> Json<Value> {
        check_key(&headers);
        assert_eq!(index, "apis");
        let mut fake = state.lock().unwrap();
        fake.describes += 1;
        Json(json!({"name": index, "host": fake.host}))
    }

    async fn upsert(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
        check_key(&headers);
        let mut fake = state.lock().unwrap();
        fake.upsert_calls += 1;
        let vectors = body["vectors"].as_array().cloned().unwrap_or_default();
        let count = vectors.len();
        for v in vectors {
            fake.vectors.retain(|existing| existing["id"] != v["id"]);
            fake.vectors.push(v);
        }
        Json(json!({"upsertedCount": count}))
    }

    async fn query(State(state): State<Shared>, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
        check_key(&headers);
        let mut fake = state.lock().unwrap();
        let top_k = body["topK"].as_u64().unwrap();
        fake.top_k.push(top_k);
        let query: Vec<f64> = serde_json::from_value(body["vector"].clone()).unwrap();

        let mut matches: Vec<Value> = fake
            .vectors
            .iter()
            .map(|v| {
                let values: Vec<f64> = serde_json::from_value(v["values"].clone()).unwrap();
                let score: f64 = values.iter().zip(&query).map(|(a, b)| a * b).sum();
                json!({"id": v["id"], "score": score, "metadata": v["metadata"]})
            })
            .collect();
        matches.sort_by(|a, b| b["score"].as_f64().partial_cmp(&a["score"].as_f64()).unwrap());
        matches.truncate(top_k as usize);
        Json(json!({"matches": matches, "namespace": ""}))
    }

    async fn fake_pinecone() -> (PineconeStore, Shared) {
        let state: Shared = Arc::default();
        let router = axum::Router::new()
            .route("/indexes/{index}", get(describe))
            .route("/vectors/upsert", post(upsert))
            .route("/query", post(query))
            .with_state(state.clone());
        let base = fake_http::spawn(router).await;
        state.lock().unwrap().host = base.clone();

        let mirror = Arc::new(MirrorStore::open_in_memory().unwrap());
        (PineconeStore::new("pc-key", "apis", &base, None, mirror), state)
    }

    #[tokio::test]
    async fn long_ids_resolve_to_full_ids_through_mirror() {
        let (store, state) = fake_pinecone().await;
        let long_id = format!("Pets GET /{}", "a".repeat(600));
        store
            .upsert_items(&[item(&long_id, vec![1.0, 0.0], "GET")])
            .await
            .unwrap();

        {
            let fake = state.lock().unwrap();
            assert_eq!(fake.describes, 1);
            let sent = fake.vectors[0]["id"].as_str().unwrap();
            assert_eq!(sent.chars().count(), MAX_ID_CHARS);
        }

        let results = store.search_items("pets", &[1.0, 0.0], 1, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, long_id);
        // Metadata comes from the mirror, not the stringified copy in Pinecone.
        assert_eq!(results[0].metadata["servers"][0]["url"], "https://x");
        assert!(results[0].distance.abs() < 1e-6);

        let docs = store.retrieve_items(&[long_id.clone()]).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, long_id);

        let truncated = truncate_id(&long_id);
        let docs = store.retrieve_items(&[truncated]).await.unwrap();
        assert_eq!(docs[0].id, long_id);
    }

    #[tokio::test]
    async fn search_oversamples_filters_and_caps() {
        let (store, state) = fake_pinecone().await;
        store
            .upsert_items(&[
                item("a", vec![1.0, 0.0], "POST"),
                item("b", vec![0.9, 0.1], "GET"),
                item("c", vec![0.8, 0.2], "GET"),
                item("d", vec![0.1, 0.9], "GET"),
            ])
            .await
            .unwrap();
        assert_eq!(state.lock().unwrap().upsert_calls, 1);

        let filter = json!({"method": "GET"});
        let results = store
            .search_items("q", &[1.0, 0.0], 2, Some(&filter))
            .await
            .unwrap();

        assert_eq!(state.lock().unwrap().top_k, vec![4]);
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(results[0].distance <= results[1].distance);
    }

    #[tokio::test]
    async fn truncation_collision_keeps_first_document() {
        let (store, _state) = fake_pinecone().await;
        let prefix = "x".repeat(MAX_ID_CHARS);
        let first = format!("{prefix}-first");
        let second = format!("{prefix}-second");
        store
            .upsert_items(&[item(&first, vec![1.0, 0.0], "GET")])
            .await
            .unwrap();
        store
            .upsert_items(&[item(&second, vec![0.0, 1.0], "PUT")])
            .await
            .unwrap();

        // Both land on the same Pinecone id; the mirror keeps both.
        assert_eq!(store.mirror.count().unwrap(), 2);
        let results = store.search_items("q", &[0.0, 1.0], 5, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, first);
    }

    #[tokio::test]
    async fn mirror_failure_leaves_pinecone_write_in_place() {
        let (store, state) = fake_pinecone().await;
        store.mirror.break_for_test();

        let err = store
            .upsert_items(&[item("Pets GET /pets", vec![1.0, 0.0], "GET")])
            .await
            .unwrap_err();
        assert!(matches!(err, VectorStoreError::Mirror(_)), "error: {err}");

        let fake = state.lock().unwrap();
        assert_eq!(fake.upsert_calls, 1);
        assert_eq!(fake.vectors.len(), 1);
        assert_eq!(fake.vectors[0]["id"], "Pets GET /pets");
    }

    #[tokio::test]
    async fn configured_host_skips_describe() {
        let (_, state) = fake_pinecone().await;
        let base = state.lock().unwrap().host.clone();
        let mirror = Arc::new(MirrorStore::open_in_memory().unwrap());
        let store = PineconeStore::new("pc-key", "apis", "http://127.0.0.1:9", Some(&base), mirror);

        store
            .upsert_items(&[item("a", vec![1.0, 0.0], "GET")])
            .await
            .unwrap();
        assert_eq!(state.lock().unwrap().describes, 0);
    }
}
