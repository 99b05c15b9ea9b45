pub mod openai;

use std::future::Future;

use thiserror::Error;

use crate::upstream::UpstreamError;

/// Errors that can occur during embedding.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    /// The provider returned no vector for one of the inputs.
    #[error("embedding response is missing input index {0}")]
    MissingIndex(usize),
    /// The provider referenced an input that was never sent.
    #[error("embedding response has index {index} but only {count} inputs were sent")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("embedding response repeats input index {0}")]
    DuplicateIndex(usize),
}

/// A vector as returned by a provider, tagged with the position of its input.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedEmbedding {
    pub index: usize,
    pub embedding: Vec<f32>,
}

/// Trait abstracting text-to-vector embedding.
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts. The result pairs each input with its vector,
    /// in the order the inputs were given.
    fn embed(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<(String, Vec<f32>)>, EmbedError>> + Send;

    /// Model identifier string.
    fn model_name(&self) -> &str;
}

/// Pair provider output back with its inputs using the returned indices.
///
/// Providers are free to answer out of order, so response position is never
/// trusted.
pub fn correlate(
    texts: &[String],
    data: Vec<IndexedEmbedding>,
) -> Result<Vec<(String, Vec<f32>)>, EmbedError> {
    let count = texts.len();
    let mut slots: Vec<Option<Vec<f32>>> = vec![None; count];

    for entry in data {
        let slot = slots.get_mut(entry.index).ok_or(EmbedError::IndexOutOfRange {
            index: entry.index,
            count,
        })?;
        if slot.is_some() {
            return Err(EmbedError::DuplicateIndex(entry.index));
        }
        *slot = Some(entry.embedding);
    }

    texts
        .iter()
        .zip(slots)
        .enumerate()
        .map(|(index, (text, slot))| {
            slot.map(|vector| (text.clone(), vector))
                .ok_or(EmbedError::MissingIndex(index))
        })
        .collect()
}
