use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::selector::Selector;
use crate::types::{EmbeddingItem, Metadata, MirrorDocument};

/// Name of the secondary index on `documents.id`.
pub const ID_INDEX_NAME: &str = "embeddings_by_id";

/// Errors that can occur in the mirror store.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt document '{id}': {message}")]
    Corrupt { id: String, message: String },
}

impl From<rusqlite::Error> for MirrorError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// SQLite-backed local copy of every item written to a vector store.
///
/// The mirror holds full, untruncated ids and metadata. Vector-store adapters
/// resolve search hits through it because some backends return truncated ids
/// or flattened metadata.
pub struct MirrorStore {
    conn: Mutex<Connection>,
    index_ready: AtomicBool,
}

impl MirrorStore {
    /// Open (or create) a mirror database at `path`.
    pub fn open(path: &Path) -> Result<Self, MirrorError> {
        let conn = Connection::open(path).map_err(|e| {
            MirrorError::Storage(format!("failed to open mirror '{}': {e}", path.display()))
        })?;
        Self::with_connection(conn)
    }

    /// Open an in-memory mirror (for testing and throwaway runs).
    pub fn open_in_memory() -> Result<Self, MirrorError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| MirrorError::Storage(format!("failed to open in-memory mirror: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, MirrorError> {
        let store = Self {
            conn: Mutex::new(conn),
            index_ready: AtomicBool::new(false),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, MirrorError> {
        self.conn
            .lock()
            .map_err(|_| MirrorError::Storage("mirror connection lock poisoned".into()))
    }

    fn migrate(&self) -> Result<(), MirrorError> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS documents (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                vector BLOB NOT NULL,
                metadata TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| MirrorError::Storage(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Create the unique id index the first time it is needed.
    fn ensure_id_index(&self, conn: &Connection) -> Result<(), MirrorError> {
        if self.index_ready.load(Ordering::Relaxed) {
            return Ok(());
        }

        let existing: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'index' AND name = ?1",
                params![ID_INDEX_NAME],
                |row| row.get(0),
            )
            .optional()?;

        if existing.is_none() {
            conn.execute_batch(&format!(
                "CREATE UNIQUE INDEX {ID_INDEX_NAME} ON documents(id);"
            ))?;
            log::debug!("mirror: created index {ID_INDEX_NAME}");
        }

        self.index_ready.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Upsert `items` by id. Re-putting the same items is a no-op in effect.
    pub fn put(&self, items: &[EmbeddingItem]) -> Result<usize, MirrorError> {
        if items.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock()?;
        self.ensure_id_index(&conn)?;

        let now = Utc::now().to_rfc3339();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO documents (id, vector, metadata, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     vector = excluded.vector,
                     metadata = excluded.metadata,
                     updated_at = excluded.updated_at",
            )?;
            for item in items {
                let metadata_json = serde_json::to_string(&item.metadata).map_err(|e| {
                    MirrorError::Storage(format!("failed to serialize metadata: {e}"))
                })?;
                stmt.execute(params![
                    item.id,
                    embedding_to_bytes(&item.vector),
                    metadata_json,
                    now,
                ])?;
            }
        }
        tx.commit()?;

        Ok(items.len())
    }

    /// Drop the documents table so the next write fails.
    #[cfg(test)]
    pub(crate) fn break_for_test(&self) {
        self.lock()
            .unwrap()
            .execute_batch("DROP TABLE documents;")
            .unwrap();
    }

    /// Return every document matching `selector`.
    ///
    /// When the selector pins `id`, lookups go through the id index and the
    /// results follow the order of the requested ids.
    pub fn query(&self, selector: &Selector) -> Result<Vec<MirrorDocument>, MirrorError> {
        let conn = self.lock()?;

        let candidates = match selector.id_candidates() {
            Some(ids) => {
                let mut stmt =
                    conn.prepare("SELECT id, vector, metadata FROM documents WHERE id = ?1")?;
                let mut docs = Vec::with_capacity(ids.len());
                let mut seen = std::collections::HashSet::new();
                for id in ids {
                    if !seen.insert(id.clone()) {
                        continue;
                    }
                    let row = stmt.query_row(params![id], read_row).optional()?;
                    if let Some(raw) = row {
                        docs.push(decode(raw)?);
                    }
                }
                docs
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT id, vector, metadata FROM documents ORDER BY seq")?;
                let rows = stmt.query_map([], read_row)?;
                let mut docs = Vec::new();
                for row in rows {
                    docs.push(decode(row?)?);
                }
                docs
            }
        };

        Ok(candidates
            .into_iter()
            .filter(|doc| selector.matches(&document_view(doc)))
            .collect())
    }

    /// Resolve ids that a backend may have truncated to `max_chars`.
    ///
    /// Every stored document whose id, cut to `max_chars` characters, equals a
    /// requested id is returned. Two distinct long ids sharing a prefix both
    /// come back; callers decide how to treat that collision.
    pub fn find_by_truncated_ids(
        &self,
        ids: &[String],
        max_chars: usize,
    ) -> Result<Vec<MirrorDocument>, MirrorError> {
        let conn = self.lock()?;
        let mut exact = conn.prepare("SELECT id, vector, metadata FROM documents WHERE id = ?1")?;
        let mut prefixed = conn.prepare(
            "SELECT id, vector, metadata FROM documents WHERE substr(id, 1, ?2) = ?1 ORDER BY seq",
        )?;

        let mut docs = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for id in ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            if id.chars().count() < max_chars {
                if let Some(raw) = exact.query_row(params![id], read_row).optional()? {
                    docs.push(decode(raw)?);
                }
                continue;
            }
            let rows = prefixed.query_map(params![id, max_chars as i64], read_row)?;
            for row in rows {
                docs.push(decode(row?)?);
            }
        }
        Ok(docs)
    }

    /// Number of stored documents.
    pub fn count(&self) -> Result<usize, MirrorError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Whether the id index has been created yet.
    pub fn has_id_index(&self) -> Result<bool, MirrorError> {
        let conn = self.lock()?;
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'index' AND name = ?1",
                params![ID_INDEX_NAME],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

type RawRow = (String, Vec<u8>, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn decode((id, blob, metadata_json): RawRow) -> Result<MirrorDocument, MirrorError> {
    let metadata: Metadata = serde_json::from_str(&metadata_json).map_err(|e| MirrorError::Corrupt {
        id: id.clone(),
        message: format!("invalid metadata JSON: {e}"),
    })?;
    Ok(MirrorDocument {
        id,
        vector: bytes_to_embedding(&blob),
        metadata,
    })
}

/// JSON shape selectors are evaluated against: `{ "id": .., "metadata": {..} }`.
fn document_view(doc: &MirrorDocument) -> serde_json::Value {
    serde_json::json!({
        "id": doc.id,
        "metadata": doc.metadata,
    })
}

/// Encode a `Vec<f32>` as a little-endian byte blob.
fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &v in embedding {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a little-endian byte blob back into `Vec<f32>`.
fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str, method: &str) -> EmbeddingItem {
        EmbeddingItem {
            id: id.to_string(),
            vector: vec![1.0, 0.5, -0.25],
            metadata: json!({"method": method, "paths": ["/pets"]})
                .as_object()
                .unwrap()
                .clone(),
        }
    }

    #[test]
    fn put_then_query_by_id_round_trips() {
        let mirror = MirrorStore::open_in_memory().unwrap();
        let original = item("op1", "GET");
        mirror.put(std::slice::from_ref(&original)).unwrap();

        let docs = mirror.query(&Selector::id_in(&["op1"])).unwrap();
        assert_eq!(docs, vec![MirrorDocument::from(original)]);
    }

    #[test]
    fn id_index_is_created_lazily_on_first_write() {
        let mirror = MirrorStore::open_in_memory().unwrap();
        assert!(!mirror.has_id_index().unwrap());

        mirror.put(&[]).unwrap();
        assert!(!mirror.has_id_index().unwrap(), "empty put must not touch the db");

        mirror.put(&[item("op1", "GET")]).unwrap();
        assert!(mirror.has_id_index().unwrap());

        // Second write reuses the index.
        mirror.put(&[item("op2", "GET")]).unwrap();
        assert!(mirror.has_id_index().unwrap());
    }

    #[test]
    fn repeated_put_keeps_one_document_per_id() {
        let mirror = MirrorStore::open_in_memory().unwrap();
        let items = vec![item("op1", "GET"), item("op2", "POST")];
        mirror.put(&items).unwrap();
        mirror.put(&items).unwrap();
        assert_eq!(mirror.count().unwrap(), 2);

        // A later put replaces the stored metadata.
        mirror.put(&[item("op1", "DELETE")]).unwrap();
        let docs = mirror.query(&Selector::id_in(&["op1"])).unwrap();
        assert_eq!(docs[0].metadata["method"], "DELETE");
        assert_eq!(mirror.count().unwrap(), 2);
    }

    #[test]
    fn query_by_ids_follows_request_order_and_skips_unknown() {
        let mirror = MirrorStore::open_in_memory().unwrap();
        mirror
            .put(&[item("a", "GET"), item("b", "GET"), item("c", "GET")])
            .unwrap();

        let docs = mirror
            .query(&Selector::id_in(&["c", "missing", "a", "c"]))
            .unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn query_with_metadata_selector_scans() {
        let mirror = MirrorStore::open_in_memory().unwrap();
        mirror
            .put(&[item("a", "GET"), item("b", "POST"), item("c", "GET")])
            .unwrap();

        let selector = Selector::parse(&json!({"metadata.method": "GET"})).unwrap();
        let ids: Vec<String> = mirror
            .query(&selector)
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn truncated_ids_resolve_to_full_documents() {
        let mirror = MirrorStore::open_in_memory().unwrap();
        let long_id = format!("petstore GET /{}", "x".repeat(40));
        mirror.put(&[item(&long_id, "GET"), item("short", "POST")]).unwrap();

        let truncated: String = long_id.chars().take(20).collect();
        let docs = mirror
            .find_by_truncated_ids(&[truncated, "short".into()], 20)
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, long_id);
        assert_eq!(docs[1].id, "short");
    }

    #[test]
    fn truncated_ids_can_collide() {
        let mirror = MirrorStore::open_in_memory().unwrap();
        let a = format!("{}-alpha", "p".repeat(20));
        let b = format!("{}-beta", "p".repeat(20));
        mirror.put(&[item(&a, "GET"), item(&b, "GET")]).unwrap();

        let docs = mirror.find_by_truncated_ids(&["p".repeat(20)], 20).unwrap();
        assert_eq!(docs.len(), 2, "shared prefix resolves to both documents");
    }

    #[test]
    fn reopened_file_keeps_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.db");
        {
            let mirror = MirrorStore::open(&path).unwrap();
            mirror.put(&[item("op1", "GET")]).unwrap();
        }
        let mirror = MirrorStore::open(&path).unwrap();
        assert!(mirror.has_id_index().unwrap());
        mirror.put(&[item("op1", "PUT")]).unwrap();
        assert_eq!(mirror.count().unwrap(), 1);
    }
}
