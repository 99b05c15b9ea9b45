//! Vector-store adapters.
//!
//! Three interchangeable backends sit behind [`VectorStore`]. Each writes to
//! its backend first and mirrors the same items into the [`MirrorStore`]
//! afterwards. The two writes are not transactional: a failure between them
//! leaves the mirror stale until the items are upserted again.

pub mod chroma;
pub mod local;
pub mod pinecone;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;

use crate::config::{ConfigError, VectorBackend, VectorStoreConfig};
use crate::mirror::{MirrorError, MirrorStore};
use crate::selector::{Selector, SelectorError};
use crate::types::{EmbeddingItem, MirrorDocument, SearchResult};
use crate::upstream::UpstreamError;

use self::chroma::ChromaStore;
use self::local::LocalIndexStore;
use self::pinecone::PineconeStore;

/// How many candidates backends without filter support fetch per requested result.
pub const OVERSAMPLE_FACTOR: usize = 2;

/// Errors that can occur during vector store operations.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    /// The backend write succeeded but the mirror write did not.
    #[error("mirror error: {0}")]
    Mirror(#[from] MirrorError),
    #[error("invalid where filter: {0}")]
    Filter(#[from] SelectorError),
    /// Valid locally, but outside what the backend's own filter accepts.
    #[error("where filter not supported by {backend}: {message}")]
    UnsupportedFilter { backend: VectorBackend, message: String },
    #[error("index persistence failed: {0}")]
    Persistence(String),
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Trait abstracting vector storage and similarity search.
pub trait VectorStore: Send + Sync {
    /// Write `items` to the backend, then mirror them. Empty input is a no-op.
    fn upsert_items(
        &self,
        items: &[EmbeddingItem],
    ) -> impl Future<Output = Result<(), VectorStoreError>> + Send;

    /// At most `limit` hits that satisfy `where_filter`, nearest first.
    fn search_items(
        &self,
        query_text: &str,
        query_vector: &[f32],
        limit: usize,
        where_filter: Option<&serde_json::Value>,
    ) -> impl Future<Output = Result<Vec<SearchResult>, VectorStoreError>> + Send;

    /// Full documents for `ids`, always served by the mirror.
    fn retrieve_items(
        &self,
        ids: &[String],
    ) -> impl Future<Output = Result<Vec<MirrorDocument>, VectorStoreError>> + Send;

    fn backend(&self) -> VectorBackend;
}

/// The backend selected by configuration.
pub enum AnyVectorStore {
    Local(LocalIndexStore),
    Chroma(ChromaStore),
    Pinecone(PineconeStore),
}

impl AnyVectorStore {
    /// Build the adapter named by `config.backend`. No network call is made here.
    pub fn from_config(
        config: &VectorStoreConfig,
        mirror: Arc<MirrorStore>,
    ) -> Result<Self, ConfigError> {
        Ok(match config.backend {
            VectorBackend::Local => {
                Self::Local(LocalIndexStore::new(Some(config.local.index_path.clone()), mirror))
            }
            VectorBackend::Chroma => Self::Chroma(ChromaStore::new(
                &config.chroma.host,
                &config.chroma.collection,
                mirror,
            )),
            VectorBackend::Pinecone => {
                let pinecone = &config.pinecone;
                let index = pinecone.index.clone().ok_or_else(|| {
                    ConfigError::Invalid("vector_store.pinecone.index is required".into())
                })?;
                let api_key = pinecone.resolve_api_key().map_err(ConfigError::Invalid)?;
                Self::Pinecone(PineconeStore::new(
                    &api_key,
                    &index,
                    &pinecone.controller,
                    pinecone.host.as_deref(),
                    mirror,
                ))
            }
        })
    }
}

impl VectorStore for AnyVectorStore {
    async fn upsert_items(&self, items: &[EmbeddingItem]) -> Result<(), VectorStoreError> {
        match self {
            Self::Local(s) => s.upsert_items(items).await,
            Self::Chroma(s) => s.upsert_items(items).await,
            Self::Pinecone(s) => s.upsert_items(items).await,
        }
    }

    async fn search_items(
        &self,
        query_text: &str,
        query_vector: &[f32],
        limit: usize,
        where_filter: Option<&serde_json::Value>,
    ) -> Result<Vec<SearchResult>, VectorStoreError> {
        match self {
            Self::Local(s) => s.search_items(query_text, query_vector, limit, where_filter).await,
            Self::Chroma(s) => s.search_items(query_text, query_vector, limit, where_filter).await,
            Self::Pinecone(s) => {
                s.search_items(query_text, query_vector, limit, where_filter)
                    .await
            }
        }
    }

    async fn retrieve_items(&self, ids: &[String]) -> Result<Vec<MirrorDocument>, VectorStoreError> {
        match self {
            Self::Local(s) => s.retrieve_items(ids).await,
            Self::Chroma(s) => s.retrieve_items(ids).await,
            Self::Pinecone(s) => s.retrieve_items(ids).await,
        }
    }

    fn backend(&self) -> VectorBackend {
        match self {
            Self::Local(_) => VectorBackend::Local,
            Self::Chroma(_) => VectorBackend::Chroma,
            Self::Pinecone(_) => VectorBackend::Pinecone,
        }
    }
}

/// Finish a search on a backend that cannot filter: swap in the mirror's
/// authoritative id and metadata, apply the filter client-side, and cap the
/// result at `limit`.
///
/// `authoritative` is keyed by the id the backend returned. Candidates the
/// mirror does not know keep the backend's metadata.
pub(crate) fn refine_candidates(
    candidates: Vec<SearchResult>,
    mut authoritative: HashMap<String, MirrorDocument>,
    selector: &Selector,
    limit: usize,
) -> Vec<SearchResult> {
    candidates
        .into_iter()
        .map(|candidate| match authoritative.remove(&candidate.id) {
            Some(doc) => SearchResult {
                id: doc.id,
                distance: candidate.distance,
                metadata: doc.metadata,
            },
            None => {
                log::debug!("mirror has no document for '{}'; using backend metadata", candidate.id);
                candidate
            }
        })
        .filter(|result| selector.matches_map(&result.metadata))
        .take(limit)
        .collect()
}

/// Sort hits nearest first. NaN distances sink to the end.
pub(crate) fn sort_by_distance(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or_else(|| a.distance.is_nan().cmp(&b.distance.is_nan()))
    });
}
