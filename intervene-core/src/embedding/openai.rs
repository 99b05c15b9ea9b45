use reqwest::Client;
use serde::Deserialize;

use super::{EmbedError, Embedder, IndexedEmbedding, correlate};
use crate::upstream::send_json;

/// OpenAI-compatible embeddings client (`POST {endpoint}/embeddings`).
pub struct OpenAiEmbedder {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAiEmbedder {
    pub fn new(api_key: &str, model: &str, endpoint: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            endpoint: endpoint.to_string(),
        }
    }
}

fn build_request_body(texts: &[String], model: &str) -> serde_json::Value {
    serde_json::json!({
        "input": texts,
        "model": model,
    })
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<(String, Vec<f32>)>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.endpoint.trim_end_matches('/'));
        let body = build_request_body(texts, &self.model);

        let response: EmbeddingResponse = send_json(
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body),
        )
        .await?;

        log::debug!(
            "embedded {} texts with {} ({} vectors returned)",
            texts.len(),
            self.model,
            response.data.len()
        );

        let data = response
            .data
            .into_iter()
            .map(|d| IndexedEmbedding {
                index: d.index,
                embedding: d.embedding,
            })
            .collect();
        correlate(texts, data)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
