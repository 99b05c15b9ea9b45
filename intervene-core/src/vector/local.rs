use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use super::{OVERSAMPLE_FACTOR, VectorStore, VectorStoreError, refine_candidates, sort_by_distance};
use crate::config::VectorBackend;
use crate::mirror::MirrorStore;
use crate::selector::Selector;
use crate::types::{EmbeddingItem, Metadata, MirrorDocument, SearchResult};

const INDEX_FORMAT_VERSION: u32 = 1;

/// On-disk form of the in-process index. Written whole after every upsert.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct FlatIndex {
    version: u32,
    dimensions: Option<usize>,
    entries: Vec<IndexEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct IndexEntry {
    id: String,
    vector: Vec<f32>,
    /// Metadata serialized as a JSON string, the only payload the index keeps.
    title: String,
}

impl FlatIndex {
    fn empty() -> Self {
        Self {
            version: INDEX_FORMAT_VERSION,
            dimensions: None,
            entries: Vec::new(),
        }
    }

    fn check_dimensions(&self, got: usize) -> Result<(), VectorStoreError> {
        match self.dimensions {
            Some(expected) if expected != got => {
                Err(VectorStoreError::DimensionMismatch { expected, got })
            }
            _ => Ok(()),
        }
    }

    /// Insert or replace entries by id.
    fn upsert(&mut self, items: &[EmbeddingItem]) -> Result<(), VectorStoreError> {
        let mut positions: HashMap<String, usize> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();

        for item in items {
            self.check_dimensions(item.vector.len())?;
            self.dimensions = Some(item.vector.len());

            let title = serde_json::to_string(&item.metadata)
                .map_err(|e| VectorStoreError::Persistence(format!("failed to encode metadata: {e}")))?;
            let entry = IndexEntry {
                id: item.id.clone(),
                vector: item.vector.clone(),
                title,
            };
            match positions.get(&item.id) {
                Some(&i) => self.entries[i] = entry,
                None => {
                    positions.insert(item.id.clone(), self.entries.len());
                    self.entries.push(entry);
                }
            }
        }
        Ok(())
    }

    /// The `k` nearest entries by cosine distance.
    fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>, VectorStoreError> {
        if self.entries.is_empty() {
            return Ok(Vec::new());
        }
        self.check_dimensions(query.len())?;

        let mut scored = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let metadata: Metadata = serde_json::from_str(&entry.title).unwrap_or_else(|e| {
                log::warn!("local index entry '{}' has unreadable metadata: {e}", entry.id);
                Metadata::new()
            });
            scored.push(SearchResult {
                id: entry.id.clone(),
                distance: 1.0 - cosine_similarity(query, &entry.vector),
                metadata,
            });
        }
        sort_by_distance(&mut scored);
        scored.truncate(k);
        Ok(scored)
    }

    fn load(path: &Path) -> Result<Self, VectorStoreError> {
        if !path.exists() {
            return Ok(Self::empty());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| {
            VectorStoreError::Persistence(format!("failed to read index '{}': {e}", path.display()))
        })?;
        let index: Self = serde_json::from_str(&contents).map_err(|e| {
            VectorStoreError::Persistence(format!("failed to parse index '{}': {e}", path.display()))
        })?;
        if index.version != INDEX_FORMAT_VERSION {
            return Err(VectorStoreError::Persistence(format!(
                "index '{}' has unsupported version {}",
                path.display(),
                index.version
            )));
        }
        Ok(index)
    }

    /// Replace the file at `path` with this index (write to a sibling, then rename).
    fn save(&self, path: &Path) -> Result<(), VectorStoreError> {
        let blob = serde_json::to_vec(self)
            .map_err(|e| VectorStoreError::Persistence(format!("failed to encode index: {e}")))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                VectorStoreError::Persistence(format!("failed to create '{}': {e}", parent.display()))
            })?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, blob).map_err(|e| {
            VectorStoreError::Persistence(format!("failed to write '{}': {e}", tmp.display()))
        })?;
        std::fs::rename(&tmp, path).map_err(|e| {
            VectorStoreError::Persistence(format!("failed to replace '{}': {e}", path.display()))
        })?;
        Ok(())
    }
}

/// Compute cosine similarity between two vectors.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Brute-force in-process index, held in memory and persisted to a single
/// file after each upsert. Without an `index_path` nothing is persisted.
pub struct LocalIndexStore {
    index_path: Option<PathBuf>,
    index: OnceCell<Mutex<FlatIndex>>,
    mirror: Arc<MirrorStore>,
}

impl LocalIndexStore {
    pub fn new(index_path: Option<PathBuf>, mirror: Arc<MirrorStore>) -> Self {
        Self {
            index_path,
            index: OnceCell::new(),
            mirror,
        }
    }

    async fn index(&self) -> Result<MutexGuard<'_, FlatIndex>, VectorStoreError> {
        let cell = self
            .index
            .get_or_try_init(|| async {
                let index = match &self.index_path {
                    Some(path) => {
                        let index = FlatIndex::load(path)?;
                        log::debug!(
                            "loaded local index '{}' ({} entries)",
                            path.display(),
                            index.entries.len()
                        );
                        index
                    }
                    None => FlatIndex::empty(),
                };
                Ok::<_, VectorStoreError>(Mutex::new(index))
            })
            .await?;
        cell.lock()
            .map_err(|_| VectorStoreError::Persistence("local index lock poisoned".into()))
    }
}

impl VectorStore for LocalIndexStore {
    async fn upsert_items(&self, items: &[EmbeddingItem]) -> Result<(), VectorStoreError> {
        if items.is_empty() {
            return Ok(());
        }

        {
            let mut index = self.index().await?;
            index.upsert(items)?;
            if let Some(path) = &self.index_path {
                index.save(path)?;
            }
            log::debug!("local index now holds {} entries", index.entries.len());
        }

        self.mirror.put(items)?;
        Ok(())
    }

    async fn search_items(
        &self,
        _query_text: &str,
        query_vector: &[f32],
        limit: usize,
        where_filter: Option<&serde_json::Value>,
    ) -> Result<Vec<SearchResult>, VectorStoreError> {
        let selector = Selector::from_filter(where_filter)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let candidates = {
            let index = self.index().await?;
            index.nearest(query_vector, limit * OVERSAMPLE_FACTOR)?
        };

        let ids: Vec<&str> = candidates.iter().map(|c| c.id.as_str()).collect();
        let authoritative = self
            .mirror
            .query(&Selector::id_in(&ids))?
            .into_iter()
            .map(|doc| (doc.id.clone(), doc))
            .collect();

        Ok(refine_candidates(candidates, authoritative, &selector, limit))
    }

    async fn retrieve_items(&self, ids: &[String]) -> Result<Vec<MirrorDocument>, VectorStoreError> {
        Ok(self.mirror.query(&Selector::id_in(ids))?)
    }

    fn backend(&self) -> VectorBackend {
        VectorBackend::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, vector: Vec<f32>, method: &str) -> EmbeddingItem {
        EmbeddingItem {
            id: id.into(),
            vector,
            metadata: json!({"method": method, "paths": ["/x"]})
                .as_object()
                .unwrap()
                .clone(),
        }
    }

    fn store(path: Option<PathBuf>) -> LocalIndexStore {
        LocalIndexStore::new(path, Arc::new(MirrorStore::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn mirror_failure_is_reported_after_index_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let mirror = Arc::new(MirrorStore::open_in_memory().unwrap());
        let store = LocalIndexStore::new(Some(path.clone()), mirror.clone());
        mirror.break_for_test();

        let err = store
            .upsert_items(&[item("a", vec![1.0, 0.0], "GET")])
            .await
            .unwrap_err();
        assert!(matches!(err, VectorStoreError::Mirror(_)), "error: {err}");

        // The index write is kept, on disk and in memory.
        let on_disk = FlatIndex::load(&path).unwrap();
        assert_eq!(on_disk.entries.len(), 1);
        assert_eq!(on_disk.entries[0].id, "a");
        let nearest = store.index().await.unwrap().nearest(&[1.0, 0.0], 1).unwrap();
        assert_eq!(nearest[0].id, "a");
    }

    #[test]
    fn unreadable_entry_metadata_reads_as_empty() {
        let mut index = FlatIndex::empty();
        index.upsert(&[item("a", vec![1.0, 0.0], "GET")]).unwrap();
        index.entries[0].title = "{ broken".into();
        let results = index.nearest(&[1.0, 0.0], 1).unwrap();
        assert_eq!(results[0].id, "a");
        assert!(results[0].metadata.is_empty());
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn search_ranks_by_ascending_distance() {
        let store = store(None);
        store
            .upsert_items(&[
                item("far", vec![0.0, 1.0], "GET"),
                item("near", vec![1.0, 0.0], "GET"),
                item("mid", vec![1.0, 1.0], "GET"),
            ])
            .await
            .unwrap();

        let results = store.search_items("q", &[1.0, 0.0], 3, None).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid", "far"]);
        assert!(results[0].distance < results[1].distance);
        assert_eq!(results[0].metadata["paths"], json!(["/x"]));
    }

    #[tokio::test]
    async fn filter_applies_after_oversampling() {
        let store = store(None);
        store
            .upsert_items(&[
                item("a", vec![1.0, 0.0], "POST"),
                item("b", vec![0.9, 0.1], "GET"),
                item("c", vec![0.8, 0.2], "POST"),
                item("d", vec![0.1, 0.9], "GET"),
            ])
            .await
            .unwrap();

        // limit 1 oversamples to 2 candidates: a and b. Only b is a GET.
        let filter = json!({"method": "GET"});
        let results = store
            .search_items("q", &[1.0, 0.0], 1, Some(&filter))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "b");

        // limit 2 oversamples to 4 and both GETs come back.
        let results = store
            .search_items("q", &[1.0, 0.0], 2, Some(&filter))
            .await
            .unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d"]);
    }

    #[tokio::test]
    async fn returns_fewer_than_limit_without_error() {
        let store = store(None);
        store
            .upsert_items(&[item("only", vec![1.0, 0.0], "GET")])
            .await
            .unwrap();
        let filter = json!({"method": "DELETE"});
        let results = store
            .search_items("q", &[1.0, 0.0], 5, Some(&filter))
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn upsert_replaces_by_id_and_mirrors() {
        let store = store(None);
        store
            .upsert_items(&[item("a", vec![1.0, 0.0], "GET")])
            .await
            .unwrap();
        store
            .upsert_items(&[item("a", vec![0.0, 1.0], "PUT")])
            .await
            .unwrap();

        let results = store.search_items("q", &[0.0, 1.0], 5, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].metadata["method"], "PUT");
        assert_eq!(store.mirror.count().unwrap(), 1);

        let docs = store.retrieve_items(&["a".to_string()]).await.unwrap();
        assert_eq!(docs[0].vector, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn empty_upsert_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let store = store(Some(path.clone()));
        store.upsert_items(&[]).await.unwrap();
        assert!(!path.exists());
        assert_eq!(store.mirror.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let store = store(None);
        store
            .upsert_items(&[item("a", vec![1.0, 0.0], "GET")])
            .await
            .unwrap();
        let err = store
            .upsert_items(&[item("b", vec![1.0, 0.0, 0.0], "GET")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VectorStoreError::DimensionMismatch { expected: 2, got: 3 }
        ));
    }

    #[tokio::test]
    async fn index_survives_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("index.json");

        let first = store(Some(path.clone()));
        first
            .upsert_items(&[
                item("a", vec![1.0, 0.0], "GET"),
                item("b", vec![0.0, 1.0], "GET"),
            ])
            .await
            .unwrap();
        assert!(path.exists());

        let reloaded = FlatIndex::load(&path).unwrap();
        assert_eq!(reloaded.entries.len(), 2);
        assert_eq!(reloaded.dimensions, Some(2));

        // A fresh store over the same file sees the entries; its mirror is empty,
        // so hits fall back to the metadata kept in the index.
        let second = store(Some(path));
        let results = second.search_items("q", &[0.0, 1.0], 1, None).await.unwrap();
        assert_eq!(results[0].id, "b");
        assert_eq!(results[0].metadata["method"], "GET");
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, r#"{"version":99,"dimensions":null,"entries":[]}"#).unwrap();
        assert!(matches!(
            FlatIndex::load(&path),
            Err(VectorStoreError::Persistence(_))
        ));
    }
}
