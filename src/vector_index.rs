//! Vector index over chunk embeddings.
//!
//! A flat exact-L2 index keyed by chunk id. Search scans every live vector,
//! which keeps results deterministic (ascending distance, ties broken by
//! insertion order) and is comfortably fast at the corpus sizes this engine
//! serves; swapping in an ANN structure behind the same contract is an
//! optimization, not a semantic change.
//!
//! Concurrency: searches take a read lock and proceed in parallel; mutation
//! (add/remove/load) is serialized behind the write lock. Embedding happens
//! before any lock is taken.
//!
//! Snapshots are bincode files written atomically (temp file + rename); on
//! load, the stored dimension must match the configured one.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::embedding::{embed_one, EmbeddingProvider};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct VectorIndexStats {
    pub total_vectors: usize,
    pub dimension: usize,
    pub index_type: &'static str,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    dimension: usize,
    entries: Vec<(String, Vec<f32>)>,
}

struct IndexState {
    dimension: usize,
    /// Insertion-ordered slots; `None` marks a removed id.
    slots: Vec<Option<(String, Vec<f32>)>>,
    by_id: HashMap<String, usize>,
}

pub struct VectorIndex {
    embedder: Arc<dyn EmbeddingProvider>,
    state: RwLock<IndexState>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("model_name", &self.embedder.model_name())
            .field("dims", &self.embedder.dims())
            .finish()
    }
}

impl VectorIndex {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>) -> Self {
        let dimension = embedder.dims();
        Self {
            embedder,
            state: RwLock::new(IndexState {
                dimension,
                slots: Vec::new(),
                by_id: HashMap::new(),
            }),
        }
    }

    /// Load the snapshot at `path` if one exists, otherwise start empty.
    pub fn open(path: &Path, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        if path.exists() {
            Self::load(path, embedder)
        } else {
            Ok(Self::new(embedder))
        }
    }

    /// Embed `texts` and attach them to `ids`. The whole batch is validated
    /// before anything is inserted: duplicate ids and dimension mismatches
    /// leave the index untouched.
    pub async fn add_chunks(&self, ids: &[String], texts: &[String]) -> Result<()> {
        if ids.len() != texts.len() {
            return Err(EngineError::Index(format!(
                "id/text count mismatch: {} vs {}",
                ids.len(),
                texts.len()
            )));
        }
        if ids.is_empty() {
            return Ok(());
        }

        let vectors = self.embedder.embed(texts).await?;

        let mut state = self.state.write();

        for vec in &vectors {
            if vec.len() != state.dimension {
                return Err(EngineError::Index(format!(
                    "vector dimension mismatch: expected {}, got {}",
                    state.dimension,
                    vec.len()
                )));
            }
        }
        for id in ids {
            if state.by_id.contains_key(id) {
                return Err(EngineError::Index(format!("duplicate chunk id: {}", id)));
            }
        }

        for (id, vec) in ids.iter().zip(vectors) {
            let slot = state.slots.len();
            state.slots.push(Some((id.clone(), vec)));
            state.by_id.insert(id.clone(), slot);
        }

        Ok(())
    }

    /// Tombstone the given ids. Unknown ids are ignored; subsequent searches
    /// never return a removed id.
    pub fn remove_chunks(&self, ids: &[String]) {
        let mut state = self.state.write();
        for id in ids {
            if let Some(slot) = state.by_id.remove(id) {
                state.slots[slot] = None;
            }
        }
    }

    /// Embed the query text and return up to `k` `(chunk_id, distance)`
    /// pairs, ascending by L2 distance. An empty index yields an empty list.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<(String, f32)>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        {
            let state = self.state.read();
            if state.by_id.is_empty() {
                return Ok(Vec::new());
            }
        }

        let query_vec = embed_one(self.embedder.as_ref(), query).await?;

        let state = self.state.read();
        if query_vec.len() != state.dimension {
            return Err(EngineError::Index(format!(
                "query dimension mismatch: expected {}, got {}",
                state.dimension,
                query_vec.len()
            )));
        }

        let mut scored: Vec<(usize, &str, f32)> = state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                entry
                    .as_ref()
                    .map(|(id, vec)| (slot, id.as_str(), l2_distance(&query_vec, vec)))
            })
            .collect();

        scored.sort_by(|a, b| {
            a.2.partial_cmp(&b.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(_, id, dist)| (id.to_string(), dist))
            .collect())
    }

    /// Write an atomic snapshot to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let snapshot = {
            let state = self.state.read();
            Snapshot {
                dimension: state.dimension,
                entries: state
                    .slots
                    .iter()
                    .flatten()
                    .map(|(id, vec)| (id.clone(), vec.clone()))
                    .collect(),
            }
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let bytes = bincode::serialize(&snapshot)
            .map_err(|e| EngineError::Index(format!("snapshot encode failed: {}", e)))?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;

        Ok(())
    }

    /// Load a snapshot. The stored dimension must match the embedder's.
    pub fn load(path: &Path, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let snapshot: Snapshot = bincode::deserialize(&bytes)
            .map_err(|e| EngineError::Index(format!("snapshot decode failed: {}", e)))?;

        if snapshot.dimension != embedder.dims() {
            return Err(EngineError::Index(format!(
                "index dimension {} does not match configured {}",
                snapshot.dimension,
                embedder.dims()
            )));
        }

        let mut slots = Vec::with_capacity(snapshot.entries.len());
        let mut by_id = HashMap::with_capacity(snapshot.entries.len());
        for (id, vec) in snapshot.entries {
            by_id.insert(id.clone(), slots.len());
            slots.push(Some((id, vec)));
        }

        Ok(Self {
            embedder,
            state: RwLock::new(IndexState {
                dimension: snapshot.dimension,
                slots,
                by_id,
            }),
        })
    }

    pub fn stats(&self) -> VectorIndexStats {
        let state = self.state.read();
        VectorIndexStats {
            total_vectors: state.by_id.len(),
            dimension: state.dimension,
            index_type: "flat-l2",
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.read().by_id.contains_key(id)
    }
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;

    fn index() -> VectorIndex {
        VectorIndex::new(Arc::new(HashEmbedder::new(64)))
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_index_returns_empty() {
        let idx = index();
        let results = idx.search("anything", 5).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_search_ranks_matching_text_first() {
        let idx = index();
        idx.add_chunks(
            &ids(&["c1", "c2", "c3"]),
            &[
                "rust memory safety borrow checker".to_string(),
                "french baking croissant butter".to_string(),
                "rust ownership and borrowing rules".to_string(),
            ],
        )
        .await
        .unwrap();

        let results = idx.search("rust borrow checker", 3).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, "c1");
        // Distances ascend.
        assert!(results[0].1 <= results[1].1);
        assert!(results[1].1 <= results[2].1);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_and_index_unchanged() {
        let idx = index();
        idx.add_chunks(&ids(&["c1"]), &["first".to_string()])
            .await
            .unwrap();

        let err = idx
            .add_chunks(
                &ids(&["c2", "c1"]),
                &["second".to_string(), "third".to_string()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Index(_)));

        // The failed batch inserted nothing.
        assert_eq!(idx.stats().total_vectors, 1);
        assert!(!idx.contains("c2"));
    }

    #[tokio::test]
    async fn test_removed_ids_never_return() {
        let idx = index();
        idx.add_chunks(
            &ids(&["c1", "c2"]),
            &["alpha beta".to_string(), "alpha gamma".to_string()],
        )
        .await
        .unwrap();

        idx.remove_chunks(&ids(&["c1"]));

        let results = idx.search("alpha", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "c2");
        assert_eq!(idx.stats().total_vectors, 1);
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("indexes").join("vector");

        let idx = index();
        idx.add_chunks(
            &ids(&["c1", "c2"]),
            &["first text".to_string(), "second text".to_string()],
        )
        .await
        .unwrap();
        idx.save(&path).unwrap();

        let loaded = VectorIndex::load(&path, Arc::new(HashEmbedder::new(64))).unwrap();
        assert_eq!(loaded.stats().total_vectors, 2);

        let a = idx.search("first", 2).await.unwrap();
        let b = loaded.search("first", 2).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_load_rejects_dimension_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("vector");

        let idx = index();
        idx.add_chunks(&ids(&["c1"]), &["text".to_string()])
            .await
            .unwrap();
        idx.save(&path).unwrap();

        let err = VectorIndex::load(&path, Arc::new(HashEmbedder::new(128))).unwrap_err();
        assert!(matches!(err, EngineError::Index(_)));
    }

    #[tokio::test]
    async fn test_k_caps_results() {
        let idx = index();
        idx.add_chunks(
            &ids(&["c1", "c2", "c3", "c4"]),
            &[
                "one".to_string(),
                "two".to_string(),
                "three".to_string(),
                "four".to_string(),
            ],
        )
        .await
        .unwrap();

        let results = idx.search("one two", 2).await.unwrap();
        assert_eq!(results.len(), 2);
    }
}
