//! Durable vector store: sqlite rows for text + metadata, usearch for the
//! ANN index, keyed by the sqlite rowid.
//!
//! One `Store` is one collection. Collections live side by side under a
//! shared root directory as `<name>.sqlite3` + `<name>.usearch`, so separate
//! projects never see each other's chunks.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::bert::Embedder;
use super::operation::{Chunk, Document};
use super::sqlite;
use crate::error::PipelineError;

/// Uniform record returned by every search/get API. There is exactly one
/// shape; callers never probe alternative layouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub chunk_index: usize,
    pub page_number: Option<u32>,
}

impl ChunkMetadata {
    fn of(chunk: &Chunk) -> Self {
        Self {
            document_id: chunk.document_id.clone(),
            chunk_index: chunk.chunk_index,
            page_number: chunk.page_number,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilter {
    pub document_id: Option<String>,
}

pub struct Store {
    conn: Mutex<Connection>,
    index: usearch::Index,
    dimension: usize,
    index_path: Option<PathBuf>,
}

fn new_index(dimension: usize) -> Result<usearch::Index> {
    // default IndexOptions rank by cosine distance
    let index = usearch::Index::new(&usearch::IndexOptions {
        dimensions: dimension,
        ..Default::default()
    })?;
    index.reserve(128)?;
    Ok(index)
}

fn insert_to_index(index: &usearch::Index, key: u64, embedding: &[f32]) -> Result<()> {
    if index.size() >= index.capacity() {
        index.reserve(index.capacity() * 2)?;
    }
    index.add(key, embedding)?;
    Ok(())
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    dot / (na * nb + 1e-6)
}

impl Store {
    /// Open (or create) the durable collection `<name>` under `root`.
    pub fn open(root: &Path, collection: &str, dimension: usize) -> Result<Store> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("failed to create store root {}", root.display()))?;
        let db_path = root.join(format!("{collection}.sqlite3"));
        let index_path = root.join(format!("{collection}.usearch"));

        let mut conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        sqlite::run_migrations(&mut conn)?;

        let index = new_index(dimension)?;
        if index_path.exists() {
            index
                .load(&index_path.to_string_lossy())
                .with_context(|| format!("failed to load index {}", index_path.display()))?;
        }
        info!(
            "opened collection '{collection}' ({} chunks)",
            sqlite::count_chunks(&mut conn)?
        );

        Ok(Store {
            conn: Mutex::new(conn),
            index,
            dimension,
            index_path: Some(index_path),
        })
    }

    /// Ephemeral store, used by tests and scratch sessions.
    pub fn in_memory(dimension: usize) -> Result<Store> {
        let mut conn = Connection::open_in_memory()?;
        sqlite::run_migrations(&mut conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
            index: new_index(dimension)?,
            dimension,
            index_path: None,
        })
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means another store call panicked mid-write;
        // the sqlite transaction already rolled back, so keep going.
        self.conn.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn add_document(&self, document: &Document) -> Result<()> {
        sqlite::upsert_document(&mut self.lock_conn(), document)
    }

    pub fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        sqlite::query_document_by_id(&mut self.lock_conn(), document_id)
    }

    /// Upsert chunks by id. Every chunk must already carry an embedding of
    /// the store's dimension; the store never embeds implicitly. Re-adding
    /// an identical batch leaves `count()` unchanged.
    pub fn add_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        for chunk in chunks {
            let embedding = chunk.embedding.as_ref().ok_or_else(|| {
                PipelineError::MissingEmbedding {
                    chunk_id: chunk.id.clone(),
                }
            })?;
            if embedding.len() != self.dimension {
                return Err(PipelineError::DimensionMismatch {
                    expected: self.dimension,
                    got: embedding.len(),
                }
                .into());
            }
        }

        let mut conn = self.lock_conn();
        for chunk in chunks {
            let embedding = chunk.embedding.as_deref().unwrap_or_default();
            let (key, replaced) = sqlite::upsert_chunk(&mut conn, chunk, embedding)?;
            if replaced {
                self.index.remove(key as u64)?;
            }
            insert_to_index(&self.index, key as u64, embedding)?;
        }
        Ok(())
    }

    /// Rank stored chunks against a query vector. Returns at most
    /// `n_results` hits, fewer (possibly none) when the collection is small
    /// or empty. Ties resolve to insertion order.
    pub fn search(
        &self,
        query: &[f32],
        n_results: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchResult>> {
        if n_results == 0 || self.count()? == 0 {
            return Ok(Vec::new());
        }

        let scored: Vec<(i64, Chunk, f32)> = match filter.and_then(|f| f.document_id.as_deref()) {
            // Filtered searches scan the matching rows with exact cosine;
            // document subsets are small enough that ANN buys nothing.
            Some(document_id) => {
                let rows = sqlite::query_chunks_by_document(&mut self.lock_conn(), document_id)?;
                rows.into_iter()
                    .map(|(key, chunk)| {
                        let score = cosine(query, chunk.embedding.as_deref().unwrap_or_default());
                        (key, chunk, score)
                    })
                    .collect()
            }
            None => {
                let matches = self
                    .index
                    .search(query, n_results)
                    .with_context(|| "vector search failed")?;
                let keys: Vec<i64> = matches.keys.iter().map(|k| *k as i64).collect();
                let rows = sqlite::query_chunks_by_keys(&mut self.lock_conn(), &keys)?;
                rows.into_iter()
                    .zip(matches.distances)
                    .map(|((key, chunk), distance)| (key, chunk, 1.0 - distance))
                    .collect()
            }
        };

        let mut scored = scored;
        scored.sort_by(|a, b| b.2.total_cmp(&a.2).then(a.0.cmp(&b.0)));
        scored.truncate(n_results);

        Ok(scored
            .into_iter()
            .map(|(_, chunk, score)| SearchResult {
                chunk_id: chunk.id.clone(),
                text: chunk.text.clone(),
                metadata: ChunkMetadata::of(&chunk),
                score,
            })
            .collect())
    }

    pub fn search_by_text(
        &self,
        query_text: &str,
        embedder: &mut Embedder,
        n_results: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchResult>> {
        let query = embedder.embed_text(query_text)?;
        self.search(&query, n_results, filter)
    }

    pub fn get_all_chunks(&self) -> Result<Vec<Chunk>> {
        Ok(sqlite::query_all_chunks(&mut self.lock_conn())?
            .into_iter()
            .map(|(_, chunk)| chunk)
            .collect())
    }

    /// Fetch chunks by id, preserving the requested order. Unknown ids are
    /// skipped rather than erroring.
    pub fn get_chunks_by_ids(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>> {
        sqlite::query_chunks_by_chunk_ids(&mut self.lock_conn(), chunk_ids)
    }

    /// Remove exactly the chunks belonging to `document_id`. Visible to
    /// `count()` and `search()` immediately. Returns how many were removed.
    pub fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        let keys = sqlite::delete_chunks_by_document(&mut self.lock_conn(), document_id)?;
        for key in &keys {
            self.index.remove(*key as u64)?;
        }
        info!("deleted {} chunks of document {document_id}", keys.len());
        Ok(keys.len())
    }

    pub fn clear_collection(&self) -> Result<()> {
        sqlite::clear_all(&mut self.lock_conn())?;
        self.index.reset()?;
        self.index.reserve(128)?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        sqlite::count_chunks(&mut self.lock_conn())
    }

    /// Persist the ANN index next to the sqlite file. After this returns, a
    /// second `Store` opened on the same root observes the same data.
    pub fn flush(&self) -> Result<()> {
        if let Some(path) = &self.index_path {
            self.index
                .save(&path.to_string_lossy())
                .with_context(|| format!("failed to save index {}", path.display()))?;
        }
        Ok(())
    }

    pub fn memory_usage(&self) -> usize {
        self.index.memory_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc: &str, index: usize, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: Chunk::make_id(doc, index),
            document_id: doc.to_string(),
            text: format!("{doc} chunk {index}"),
            chunk_index: index,
            start_char: index * 10,
            end_char: index * 10 + 5,
            page_number: None,
            embedding: Some(embedding),
        }
    }

    #[test]
    fn test_add_requires_embedding() {
        let store = Store::in_memory(3).unwrap();
        let mut c = chunk("d", 0, vec![1.0, 0.0, 0.0]);
        c.embedding = None;
        let err = store.add_chunks(&[c]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingEmbedding { .. })
        ));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_add_requires_matching_dimension() {
        let store = Store::in_memory(3).unwrap();
        let err = store.add_chunks(&[chunk("d", 0, vec![1.0, 0.0])]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DimensionMismatch { expected: 3, got: 2 })
        ));
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = Store::in_memory(3).unwrap();
        let chunks = vec![
            chunk("d", 0, vec![1.0, 0.0, 0.0]),
            chunk("d", 1, vec![0.0, 1.0, 0.0]),
        ];
        store.add_chunks(&chunks).unwrap();
        store.add_chunks(&chunks).unwrap();
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_self_retrieval() {
        let store = Store::in_memory(3).unwrap();
        store
            .add_chunks(&[
                chunk("d", 0, vec![1.0, 0.0, 0.0]),
                chunk("d", 1, vec![0.0, 1.0, 0.0]),
                chunk("d", 2, vec![0.0, 0.0, 1.0]),
            ])
            .unwrap();
        let hits = store.search(&[0.0, 1.0, 0.0], 1, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "d chunk 1");
        assert!(hits[0].score > 0.99);
    }

    #[test]
    fn test_empty_store_search_returns_empty() {
        let store = Store::in_memory(4).unwrap();
        let hits = store.search(&[0.3, 0.1, 0.2, 0.9], 5, None).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_n_results_caps_but_never_errors() {
        let store = Store::in_memory(2).unwrap();
        store.add_chunks(&[chunk("d", 0, vec![1.0, 0.0])]).unwrap();
        let hits = store.search(&[1.0, 0.0], 10, None).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_delete_scoped_to_document() {
        let store = Store::in_memory(2).unwrap();
        store
            .add_chunks(&[
                chunk("a", 0, vec![1.0, 0.0]),
                chunk("a", 1, vec![0.9, 0.1]),
                chunk("b", 0, vec![0.0, 1.0]),
            ])
            .unwrap();
        let removed = store.delete_by_document("a").unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.count().unwrap(), 1);
        let hits = store.search(&[1.0, 0.0], 5, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.document_id, "b");
    }

    #[test]
    fn test_filtered_search() {
        let store = Store::in_memory(2).unwrap();
        store
            .add_chunks(&[
                chunk("a", 0, vec![1.0, 0.0]),
                chunk("b", 0, vec![0.99, 0.05]),
            ])
            .unwrap();
        let filter = SearchFilter {
            document_id: Some("b".to_string()),
        };
        let hits = store.search(&[1.0, 0.0], 5, Some(&filter)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.document_id, "b");
    }

    #[test]
    fn test_get_chunks_by_ids_preserves_order() {
        let store = Store::in_memory(2).unwrap();
        store
            .add_chunks(&[
                chunk("d", 0, vec![1.0, 0.0]),
                chunk("d", 1, vec![0.0, 1.0]),
            ])
            .unwrap();
        let chunks = store
            .get_chunks_by_ids(&[
                "d:1".to_string(),
                "d:0".to_string(),
                "missing".to_string(),
            ])
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chunk_index, 1);
        assert_eq!(chunks[1].chunk_index, 0);
    }

    #[test]
    fn test_persistence_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path(), "project_a", 2).unwrap();
            store
                .add_chunks(&[
                    chunk("d", 0, vec![1.0, 0.0]),
                    chunk("d", 1, vec![0.0, 1.0]),
                ])
                .unwrap();
            store.flush().unwrap();
        }
        let reopened = Store::open(dir.path(), "project_a", 2).unwrap();
        assert_eq!(reopened.count().unwrap(), 2);
        let hits = reopened.search(&[0.0, 1.0], 1, None).unwrap();
        assert_eq!(hits[0].metadata.chunk_index, 1);

        // a sibling collection in the same root is independent
        let other = Store::open(dir.path(), "project_b", 2).unwrap();
        assert_eq!(other.count().unwrap(), 0);
    }

    #[test]
    fn test_clear_collection() {
        let store = Store::in_memory(2).unwrap();
        store.add_chunks(&[chunk("d", 0, vec![1.0, 0.0])]).unwrap();
        store.clear_collection().unwrap();
        assert_eq!(store.count().unwrap(), 0);
        assert!(store.search(&[1.0, 0.0], 5, None).unwrap().is_empty());
    }
}
