//! Scripted stand-ins for the embedding and chat providers.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::embedding::{EmbedError, Embedder};
use crate::llm::{ChatModel, Completion, CompletionRequest, FunctionCall, LlmError};
use crate::upstream::UpstreamError;

/// Embedder that never touches the network.
///
/// Texts with a pinned vector get it back; everything else gets a
/// deterministic vector derived from the text bytes.
pub struct MockEmbedder {
    dimensions: usize,
    pinned: HashMap<String, Vec<f32>>,
    calls: AtomicUsize,
    batches: Mutex<Vec<Vec<String>>>,
}

impl MockEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            pinned: HashMap::new(),
            calls: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
        }
    }

    /// Always return `vector` for `text`.
    pub fn pin(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.pinned.insert(text.into(), vector);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every batch passed to `embed`, in call order.
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.pinned.get(text) {
            return v.clone();
        }
        (0..self.dimensions)
            .map(|i| {
                let mut h: u32 = 2166136261 ^ i as u32;
                for b in text.bytes() {
                    h = (h ^ b as u32).wrapping_mul(16777619);
                }
                (h % 2000) as f32 / 1000.0 - 1.0
            })
            .collect()
    }
}

impl Embedder for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<(String, Vec<f32>)>, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().unwrap().push(texts.to_vec());
        Ok(texts
            .iter()
            .map(|t| (t.clone(), self.vector_for(t)))
            .collect())
    }

    fn model_name(&self) -> &str {
        "mock-embedder"
    }
}

/// Chat model that replays a fixed script of completions and records every
/// request it receives. Running past the end of the script is an error.
pub struct SequencedChatModel {
    script: Mutex<VecDeque<Result<Completion, UpstreamError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    calls: AtomicUsize,
}

impl SequencedChatModel {
    pub fn new(completions: Vec<Completion>) -> Self {
        Self::from_results(completions.into_iter().map(Ok).collect())
    }

    pub fn from_results(results: Vec<Result<Completion, UpstreamError>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// A completion that calls `name` with raw `arguments`.
    pub fn function_call(name: &str, arguments: &str) -> Completion {
        Completion {
            content: None,
            function_call: Some(FunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            }),
            usage: None,
        }
    }

    /// A plain text completion.
    pub fn text(content: &str) -> Completion {
        Completion {
            content: Some(content.to_string()),
            function_call: None,
            usage: None,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ChatModel for SequencedChatModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => Ok(result?),
            None => Err(UpstreamError::Api {
                status: 500,
                message: "scripted chat model has no completions left".into(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_embedder_is_deterministic() {
        let embedder = MockEmbedder::new(4).pin("fixed", vec![1.0, 0.0, 0.0, 0.0]);
        let texts = vec!["a".to_string(), "fixed".to_string(), "a".to_string()];
        let out = embedder.embed(&texts).await.unwrap();
        assert_eq!(out[0].1, out[2].1);
        assert_eq!(out[0].1.len(), 4);
        assert_eq!(out[1].1, vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(embedder.calls(), 1);
    }

    #[tokio::test]
    async fn sequenced_model_errors_when_script_runs_out() {
        let model = SequencedChatModel::new(vec![SequencedChatModel::text("one")]);
        let request = CompletionRequest {
            model: "m".into(),
            turns: vec![],
            function: None,
            extra: Default::default(),
        };
        assert!(model.complete(&request).await.is_ok());
        assert!(model.complete(&request).await.is_err());
        assert_eq!(model.calls(), 2);
    }
}
