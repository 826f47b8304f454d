//! Brute-force cosine vector store.
//!
//! Maps chunk ids to `(vector, metadata)` and answers exact top-k cosine
//! queries. Results with equal similarity keep insertion order. The first
//! insert pins the dimension unless the store was created with one; vectors
//! of any other length are rejected.
//!
//! # Persistence
//! When created with a path the whole store is rewritten atomically after
//! every mutation (`path.tmp` + rename). Batch inserts persist once.
//! The on-disk format is JSON: `{ "dimension": D, "entries": [...] }`.

use crate::storage::write_atomic;
use crate::vector::types::{
    Score, SharedVector, VectorDimension, VectorEntry, VectorError, VectorMatch, VectorMetadata,
    cosine_similarity,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Default, Clone)]
struct StoreInner {
    /// Insertion sequence -> entry; iteration order is insertion order.
    entries: BTreeMap<u64, VectorEntry>,
    by_id: HashMap<String, u64>,
    next_seq: u64,
    dimension: Option<VectorDimension>,
}

impl StoreInner {
    /// Dimension `vector` must have; learned from the first vector.
    fn expected(&self, vector: &[f32]) -> Result<VectorDimension, VectorError> {
        match self.dimension {
            Some(dimension) => Ok(dimension),
            None => VectorDimension::new(vector.len()),
        }
    }

    fn check(&self, id: &str, vector: &[f32]) -> Result<VectorDimension, VectorError> {
        if vector.is_empty() {
            return Err(VectorError::EmptyVector(id.to_string()));
        }
        let dimension = self.expected(vector)?;
        dimension.validate_vector(vector)?;
        Ok(dimension)
    }

    fn upsert(&mut self, entry: VectorEntry) {
        if let Some(&seq) = self.by_id.get(&entry.id) {
            self.entries.insert(seq, entry);
        } else {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.by_id.insert(entry.id.clone(), seq);
            self.entries.insert(seq, entry);
        }
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.by_id.remove(id) {
            Some(seq) => self.entries.remove(&seq).is_some(),
            None => false,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedStore {
    dimension: usize,
    entries: Vec<PersistedEntry>,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    id: String,
    vector: Vec<f32>,
    metadata: VectorMetadata,
}

/// Thread-safe exact cosine store.
///
/// Search takes the read lock; mutations take the write lock.
#[derive(Debug, Default)]
pub struct VectorStore {
    inner: RwLock<StoreInner>,
    path: Option<PathBuf>,
}

impl Clone for VectorStore {
    /// Copies the entry table. Vectors are immutable `Arc`s and are shared.
    fn clone(&self) -> Self {
        Self {
            inner: RwLock::new(self.inner.read().clone()),
            path: self.path.clone(),
        }
    }
}

impl VectorStore {
    /// Create an in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an in-memory store that only accepts `dimension`-long vectors.
    pub fn with_dimension(dimension: usize) -> Result<Self, VectorError> {
        let inner = StoreInner {
            dimension: Some(VectorDimension::new(dimension)?),
            ..StoreInner::default()
        };
        Ok(Self {
            inner: RwLock::new(inner),
            path: None,
        })
    }

    /// Create a store persisted at `path`, loading it if the file exists.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self, VectorError> {
        let path = path.into();
        let mut inner = StoreInner::default();
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            let persisted: PersistedStore = serde_json::from_slice(&bytes)
                .map_err(|e| VectorError::Serialization(e.to_string()))?;
            if persisted.dimension > 0 {
                inner.dimension = Some(VectorDimension::new(persisted.dimension)?);
            }
            for entry in persisted.entries {
                let dimension = inner.check(&entry.id, &entry.vector)?;
                inner.dimension = Some(dimension);
                inner.upsert(VectorEntry {
                    id: entry.id,
                    vector: entry.vector.into(),
                    metadata: entry.metadata,
                });
            }
            debug!(path = %path.display(), entries = inner.entries.len(), "loaded vector store");
        }
        Ok(Self {
            inner: RwLock::new(inner),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert or replace a vector. The vector and metadata are copied.
    pub fn insert(
        &self,
        id: &str,
        vector: &[f32],
        metadata: VectorMetadata,
    ) -> Result<(), VectorError> {
        self.insert_shared(id, SharedVector::from(vector), metadata)
    }

    /// Insert a vector that is already shared (e.g. with the HNSW graph).
    pub fn insert_shared(
        &self,
        id: &str,
        vector: SharedVector,
        metadata: VectorMetadata,
    ) -> Result<(), VectorError> {
        {
            let mut inner = self.inner.write();
            let dimension = inner.check(id, &vector)?;
            inner.dimension = Some(dimension);
            inner.upsert(VectorEntry {
                id: id.to_string(),
                vector,
                metadata,
            });
        }
        self.persist()
    }

    /// Insert many entries and persist once.
    ///
    /// Fails without inserting anything if any vector is empty or has the
    /// wrong dimension.
    pub fn insert_batch(&self, entries: Vec<VectorEntry>) -> Result<(), VectorError> {
        {
            let mut inner = self.inner.write();
            let mut dimension = inner.dimension;
            for entry in &entries {
                if entry.vector.is_empty() {
                    return Err(VectorError::EmptyVector(entry.id.clone()));
                }
                let expected = match dimension {
                    Some(d) => d,
                    None => VectorDimension::new(entry.vector.len())?,
                };
                expected.validate_vector(&entry.vector)?;
                dimension = Some(expected);
            }
            inner.dimension = dimension;
            for entry in entries {
                inner.upsert(entry);
            }
        }
        self.persist()
    }

    /// Exact top-k search by cosine similarity.
    ///
    /// Ties keep insertion order. Entries whose dimension differs from the
    /// query score 0.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<VectorMatch> {
        if k == 0 {
            return Vec::new();
        }
        let inner = self.inner.read();
        let mut scored: Vec<(f32, &VectorEntry)> = inner
            .entries
            .values()
            .map(|entry| (cosine_similarity(query, &entry.vector), entry))
            .collect();
        // Stable sort keeps insertion order for equal scores.
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored
            .into_iter()
            .take(k)
            .map(|(similarity, entry)| VectorMatch {
                id: entry.id.clone(),
                score: Score::saturating(similarity),
            })
            .collect()
    }

    /// Exact cosine similarity between `query` and one stored vector.
    pub fn similarity(&self, id: &str, query: &[f32]) -> Option<f32> {
        let inner = self.inner.read();
        let seq = inner.by_id.get(id)?;
        inner
            .entries
            .get(seq)
            .map(|entry| cosine_similarity(query, &entry.vector))
    }

    pub fn get(&self, id: &str) -> Option<VectorEntry> {
        let inner = self.inner.read();
        let seq = inner.by_id.get(id)?;
        inner.entries.get(seq).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().by_id.contains_key(id)
    }

    /// Remove an entry. Returns whether it existed.
    pub fn delete(&self, id: &str) -> Result<bool, VectorError> {
        let removed = self.inner.write().remove(id);
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Remove several entries and persist once. Returns how many existed.
    pub fn delete_many<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> Result<usize, VectorError> {
        let removed = {
            let mut inner = self.inner.write();
            ids.into_iter().filter(|id| inner.remove(id)).count()
        };
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids in insertion order.
    pub fn ids(&self) -> Vec<String> {
        self.inner
            .read()
            .entries
            .values()
            .map(|e| e.id.clone())
            .collect()
    }

    /// Snapshot of all entries in insertion order.
    pub fn entries(&self) -> Vec<VectorEntry> {
        self.inner.read().entries.values().cloned().collect()
    }

    /// Dimension every vector in the store has.
    pub fn dimension(&self) -> Option<usize> {
        self.inner.read().dimension.map(|d| d.get())
    }

    /// Flush to disk if the store is persistent.
    pub fn close(self) -> Result<(), VectorError> {
        self.persist()
    }

    fn persist(&self) -> Result<(), VectorError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let inner = self.inner.read();
        let persisted = PersistedStore {
            dimension: inner.dimension.map_or(0, |d| d.get()),
            entries: inner
                .entries
                .values()
                .map(|e| PersistedEntry {
                    id: e.id.clone(),
                    vector: e.vector.to_vec(),
                    metadata: e.metadata.clone(),
                })
                .collect(),
        };
        drop(inner);
        let bytes = serde_json::to_vec(&persisted)
            .map_err(|e| VectorError::Serialization(e.to_string()))?;
        write_atomic(path, &bytes)?;
        Ok(())
    }
}
