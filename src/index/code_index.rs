//! In-memory code index: files, their chunks and the chunk vectors.
//!
//! Every vector in the store belongs to exactly one chunk of exactly one
//! file, keyed by the chunk id. Mutations keep the file table, the exact
//! store and (when enabled) the HNSW graph in step.

use crate::error::{IndexError, IndexResult};
use crate::pool::VectorPool;
use crate::storage::{
    INDEX_FILE, IndexData, IndexMetadata, IndexType, StoredVector, WriteOptions, read_index,
    write_index,
};
use crate::types::{Chunk, FileEntry, Language};
use crate::vector::{
    HnswIndex, HnswParams, Score, SharedVector, VectorError, VectorMatch, VectorMetadata,
    VectorStore,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Consistent counts over one index snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub files: usize,
    pub chunks: usize,
    pub vectors: usize,
    /// Files per language
    pub languages: BTreeMap<Language, usize>,
}

/// Vector metadata for `chunk`.
pub fn vector_metadata(chunk: &Chunk) -> VectorMetadata {
    VectorMetadata {
        file_path: chunk.file_path.clone(),
        start_line: chunk.start_line,
        end_line: chunk.end_line,
        content: chunk.content.clone(),
        language: chunk.language,
        kind: chunk.kind,
        chunk: chunk.metadata.clone(),
    }
}

/// Store pinned to `dimension`; a zero dimension is learned from the first vector.
fn empty_store(dimension: usize) -> VectorStore {
    VectorStore::with_dimension(dimension).unwrap_or_default()
}

/// Files, chunks and vectors of one indexed tree.
///
/// `Clone` is a deep copy of the file table and the store's entry table;
/// vectors themselves are `Arc`s and are shared between copies.
#[derive(Debug, Clone)]
pub struct CodeIndex {
    root: PathBuf,
    files: BTreeMap<String, FileEntry>,
    store: VectorStore,
    hnsw: Option<HnswIndex>,
    metadata: IndexMetadata,
}

impl CodeIndex {
    /// Empty index for `root` built with the given embedder identity.
    pub fn new(root: impl Into<PathBuf>, model_name: &str, dimension: usize) -> Self {
        let root = root.into();
        let mut metadata = IndexMetadata::new(model_name, dimension, IndexType::Flat);
        metadata.root = Some(root.clone());
        Self {
            root,
            files: BTreeMap::new(),
            store: empty_store(dimension),
            hnsw: None,
            metadata,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    pub fn store(&self) -> &VectorStore {
        &self.store
    }

    pub fn hnsw(&self) -> Option<&HnswIndex> {
        self.hnsw.as_ref()
    }

    pub fn file(&self, path: &str) -> Option<&FileEntry> {
        self.files.get(path)
    }

    /// Files in path order.
    pub fn files(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.values()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.files.values().map(|f| f.chunks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn find_chunk(&self, id: &str) -> Option<&Chunk> {
        self.files
            .values()
            .flat_map(|f| f.chunks.iter())
            .find(|c| c.id == id)
    }

    fn insert_vector(&self, chunk: &Chunk, vector: SharedVector) -> IndexResult<()> {
        self.store
            .insert_shared(&chunk.id, SharedVector::clone(&vector), vector_metadata(chunk))?;
        if let Some(hnsw) = &self.hnsw {
            hnsw.insert(&chunk.id, vector)?;
        }
        Ok(())
    }

    fn remove_vector(&self, id: &str) -> IndexResult<()> {
        self.store.delete(id)?;
        if let Some(hnsw) = &self.hnsw {
            match hnsw.delete(id) {
                Ok(()) | Err(VectorError::NodeNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Insert or replace a file. Chunk vectors move into the store and are
    /// cleared from the stored chunks.
    pub fn upsert_file(&mut self, mut entry: FileEntry) -> IndexResult<()> {
        self.remove_file(&entry.path)?;
        entry.sort_chunks();
        for chunk in &mut entry.chunks {
            if let Some(vector) = chunk.vector.take() {
                self.insert_vector(chunk, SharedVector::from(vector))?;
            }
        }
        debug!(path = %entry.path, chunks = entry.chunks.len(), "upserted file");
        self.files.insert(entry.path.clone(), entry);
        Ok(())
    }

    /// Remove a file with its chunks and vectors.
    pub fn remove_file(&mut self, path: &str) -> IndexResult<Option<FileEntry>> {
        let Some(entry) = self.files.remove(path) else {
            return Ok(None);
        };
        for chunk in &entry.chunks {
            self.remove_vector(&chunk.id)?;
        }
        Ok(Some(entry))
    }

    /// Add or replace one chunk of an indexed file.
    pub fn add_chunk(&mut self, mut chunk: Chunk) -> IndexResult<()> {
        if !self.files.contains_key(&chunk.file_path) {
            return Err(IndexError::not_found("file", chunk.file_path.clone()));
        }
        if let Some(vector) = chunk.vector.take() {
            self.insert_vector(&chunk, SharedVector::from(vector))?;
        }
        if let Some(entry) = self.files.get_mut(&chunk.file_path) {
            entry.chunks.retain(|c| c.id != chunk.id);
            entry.chunks.push(chunk);
            entry.sort_chunks();
        }
        Ok(())
    }

    /// Remove one chunk by id.
    pub fn remove_chunk(&mut self, id: &str) -> IndexResult<Chunk> {
        let entry = self
            .files
            .values_mut()
            .find(|f| f.chunks.iter().any(|c| c.id == id))
            .ok_or_else(|| IndexError::not_found("chunk", id))?;
        let pos = entry
            .chunks
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| IndexError::not_found("chunk", id))?;
        let chunk = entry.chunks.remove(pos);
        self.remove_vector(id)?;
        Ok(chunk)
    }

    pub fn stats(&self) -> IndexStats {
        let mut languages = BTreeMap::new();
        for entry in self.files.values() {
            *languages.entry(entry.language).or_insert(0) += 1;
        }
        IndexStats {
            files: self.files.len(),
            chunks: self.chunk_count(),
            vectors: self.store.len(),
            languages,
        }
    }

    /// Build an HNSW graph over the current vectors and keep it in step
    /// with later mutations.
    pub fn enable_hnsw(&mut self, params: HnswParams) -> IndexResult<()> {
        let hnsw = HnswIndex::new(params);
        for entry in self.store.entries() {
            hnsw.insert(&entry.id, entry.vector)?;
        }
        self.hnsw = Some(hnsw);
        self.metadata.index_type = IndexType::Hnsw;
        Ok(())
    }

    pub fn disable_hnsw(&mut self) {
        self.hnsw = None;
        self.metadata.index_type = IndexType::Flat;
    }

    /// Top `k` vectors for `query` by cosine similarity.
    ///
    /// With an HNSW graph and at least `hnsw_min` vectors, candidates come
    /// from the graph and are rescored exactly; otherwise the whole store is
    /// scanned. `scratch` supplies the score buffer for rescoring.
    pub fn semantic_candidates(
        &self,
        query: &[f32],
        k: usize,
        hnsw_min: usize,
        scratch: &VectorPool,
    ) -> IndexResult<Vec<VectorMatch>> {
        if query.is_empty() {
            return Err(IndexError::invalid("empty query vector"));
        }
        let hnsw = match &self.hnsw {
            Some(hnsw) if self.store.len() >= hnsw_min => hnsw,
            _ => return Ok(self.store.search(query, k)),
        };

        let candidates = hnsw.search_with_ef(query, k, hnsw.params().ef_search.max(k))?;
        let mut scores = scratch.get(candidates.len());
        for (score, candidate) in scores.iter_mut().zip(&candidates) {
            *score = self.store.similarity(&candidate.id, query).unwrap_or(0.0);
        }
        let mut rescored: Vec<VectorMatch> = candidates
            .into_iter()
            .zip(scores.iter())
            .map(|(candidate, &score)| VectorMatch {
                id: candidate.id,
                score: Score::saturating(score),
            })
            .collect();
        scratch.put(scores);
        rescored.sort_by(|a, b| b.score.get().total_cmp(&a.score.get()));
        rescored.truncate(k);
        Ok(rescored)
    }

    /// Rebuild the store (and graph) from the file table, dropping any
    /// vector no chunk refers to.
    pub fn rebuild(&mut self) -> IndexResult<()> {
        let store = empty_store(self.metadata.dimension);
        let hnsw = self.hnsw.as_ref().map(|h| HnswIndex::new(h.params()));
        for chunk in self.files.values().flat_map(|f| f.chunks.iter()) {
            if let Some(entry) = self.store.get(&chunk.id) {
                store.insert_shared(&chunk.id, SharedVector::clone(&entry.vector), vector_metadata(chunk))?;
                if let Some(hnsw) = &hnsw {
                    hnsw.insert(&chunk.id, entry.vector)?;
                }
            }
        }
        debug!(
            before = self.store.len(),
            after = store.len(),
            "rebuilt vector store"
        );
        self.store = store;
        self.hnsw = hnsw;
        Ok(())
    }

    /// Snapshot in on-disk form with fresh counts.
    pub fn to_data(&self) -> IndexData {
        let mut metadata = self.metadata.clone();
        metadata.update_counts(self.files.len(), self.chunk_count(), self.store.len());
        IndexData {
            files: self.files.values().cloned().collect(),
            vectors: self
                .store
                .entries()
                .into_iter()
                .map(|entry| StoredVector {
                    id: entry.id,
                    vector: entry.vector.to_vec(),
                    metadata: entry.metadata,
                })
                .collect(),
            metadata,
        }
    }

    pub fn from_data(root: impl Into<PathBuf>, data: IndexData) -> IndexResult<Self> {
        let root = root.into();
        let store = empty_store(data.metadata.dimension);
        for stored in data.vectors {
            store.insert_shared(&stored.id, SharedVector::from(stored.vector), stored.metadata)?;
        }
        let mut metadata = data.metadata;
        metadata.root = Some(root.clone());
        metadata.index_type = IndexType::Flat;
        let files = data
            .files
            .into_iter()
            .map(|entry| (entry.path.clone(), entry))
            .collect();
        Ok(Self {
            root,
            files,
            store,
            hnsw: None,
            metadata,
        })
    }

    /// Write `index.bin` and `metadata.json` into `index_dir`.
    pub fn save(&mut self, index_dir: &Path, options: WriteOptions) -> IndexResult<()> {
        let data = self.to_data();
        write_index(&index_dir.join(INDEX_FILE), &data, options)?;
        data.metadata.save(index_dir)?;
        self.metadata = data.metadata;
        Ok(())
    }

    /// Load the index stored in `index_dir`.
    ///
    /// `NotFound` when there is no index, `Incompatible` when it was built
    /// with a different embedder.
    pub fn load(
        root: impl Into<PathBuf>,
        index_dir: &Path,
        model_name: &str,
        dimension: usize,
    ) -> IndexResult<Self> {
        IndexMetadata::load(index_dir)?.check_compatible(model_name, dimension)?;
        let data = read_index(&index_dir.join(INDEX_FILE))?;
        data.metadata.check_compatible(model_name, dimension)?;
        let index = Self::from_data(root, data)?;
        debug!(
            files = index.file_count(),
            vectors = index.store.len(),
            "loaded index"
        );
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::Chunker;
    use crate::vector::{Embedder, HASHING_MODEL_NAME, HashingEmbedder, chunk_text};
    use tempfile::TempDir;

    fn embedded_file(path: &str, source: &str) -> FileEntry {
        let language = Language::from_path(Path::new(path)).unwrap();
        let embedder = HashingEmbedder::default();
        let mut entry = FileEntry::new(path, language, 1, source.len() as u64);
        entry.chunks = Chunker::default().parse(path, source.as_bytes(), language);
        for chunk in &mut entry.chunks {
            chunk.vector = Some(embedder.embed(&chunk_text(chunk)).unwrap());
        }
        entry
    }

    fn sample_index() -> CodeIndex {
        let mut index = CodeIndex::new("/repo", HASHING_MODEL_NAME, 384);
        index
            .upsert_file(embedded_file(
                "calc.go",
                "package calc\n\nfunc calculateTax(amount float64) float64 {\n\treturn amount * 0.2\n}\n",
            ))
            .unwrap();
        index
            .upsert_file(embedded_file("util.py", "def helper():\n    return 1\n"))
            .unwrap();
        index
    }

    fn assert_consistent(index: &CodeIndex) {
        let stats = index.stats();
        assert_eq!(stats.chunks, stats.vectors);
        for chunk in index.files().flat_map(|f| f.chunks.iter()) {
            assert!(index.store().contains(&chunk.id));
            assert!(chunk.vector.is_none());
        }
    }

    #[test]
    fn test_upsert_and_stats() {
        let index = sample_index();
        let stats = index.stats();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.languages.get(&Language::Go), Some(&1));
        assert_eq!(stats.languages.get(&Language::Python), Some(&1));
        assert_consistent(&index);
    }

    #[test]
    fn test_replacing_a_file_drops_old_vectors() {
        let mut index = sample_index();
        let old_ids: Vec<String> = index.file("util.py").unwrap().chunks.iter().map(|c| c.id.clone()).collect();
        index
            .upsert_file(embedded_file("util.py", "def other():\n    return 2\n"))
            .unwrap();
        for id in &old_ids {
            assert!(!index.store().contains(id));
        }
        assert_consistent(&index);
    }

    #[test]
    fn test_remove_file() {
        let mut index = sample_index();
        let removed = index.remove_file("calc.go").unwrap().unwrap();
        assert_eq!(removed.path, "calc.go");
        assert!(index.remove_file("calc.go").unwrap().is_none());
        assert_eq!(index.stats().files, 1);
        assert_consistent(&index);
    }

    #[test]
    fn test_add_and_remove_chunk() {
        let mut index = sample_index();
        let mut chunk = index.file("util.py").unwrap().chunks[0].clone();
        let orphan = Chunk {
            file_path: "missing.py".into(),
            ..chunk.clone()
        };
        assert!(matches!(index.add_chunk(orphan), Err(IndexError::NotFound { .. })));

        chunk.id = "extra".into();
        chunk.vector = Some(HashingEmbedder::default().embed("extra chunk").unwrap());
        index.add_chunk(chunk).unwrap();
        assert!(index.store().contains("extra"));
        assert!(index.find_chunk("extra").is_some());

        let removed = index.remove_chunk("extra").unwrap();
        assert_eq!(removed.id, "extra");
        assert!(matches!(index.remove_chunk("extra"), Err(IndexError::NotFound { .. })));
        assert_consistent(&index);
    }

    #[test]
    fn test_wrong_dimension_vector_is_rejected() {
        let mut index = sample_index();
        let mut chunk = index.file("util.py").unwrap().chunks[0].clone();
        chunk.id = "short".into();
        chunk.vector = Some(vec![1.0, 0.0]);
        let err = index.add_chunk(chunk).unwrap_err();
        assert!(
            matches!(err, IndexError::Vector(VectorError::DimensionMismatch { expected: 384, actual: 2 })),
            "{err:?}"
        );
        assert!(index.find_chunk("short").is_none());
        assert_consistent(&index);
    }

    #[test]
    fn test_clone_is_independent() {
        let index = sample_index();
        let mut copy = index.clone();
        copy.remove_file("calc.go").unwrap();
        assert_eq!(index.stats().files, 2);
        assert_eq!(copy.stats().files, 1);
        assert!(index.store().len() > copy.store().len());
    }

    #[test]
    fn test_hnsw_candidates_match_exact_search() {
        let mut index = sample_index();
        let query = HashingEmbedder::default().embed("calculate tax").unwrap();
        let pool = VectorPool::new(4);
        let exact = index.semantic_candidates(&query, 3, 1000, &pool).unwrap();

        index.enable_hnsw(HnswParams::default()).unwrap();
        assert_eq!(index.metadata().index_type, IndexType::Hnsw);
        let approx = index.semantic_candidates(&query, 3, 1, &pool).unwrap();
        assert_eq!(exact[0].id, approx[0].id);
        assert!((exact[0].score.get() - approx[0].score.get()).abs() < 1e-6);
    }

    #[test]
    fn test_rebuild_keeps_live_vectors() {
        let mut index = sample_index();
        index.enable_hnsw(HnswParams::default()).unwrap();
        let before = index.stats();
        index.rebuild().unwrap();
        assert_eq!(index.stats(), before);
        assert_eq!(index.hnsw().unwrap().len(), before.vectors);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let mut index = sample_index();
        index.save(dir.path(), WriteOptions::default()).unwrap();
        assert_eq!(index.metadata().file_count, 2);

        let loaded = CodeIndex::load("/repo", dir.path(), HASHING_MODEL_NAME, 384).unwrap();
        assert_eq!(loaded.stats(), index.stats());
        assert_eq!(
            loaded.file("calc.go").unwrap().chunks,
            index.file("calc.go").unwrap().chunks
        );

        let err = CodeIndex::load("/repo", dir.path(), "other-model", 384).unwrap_err();
        assert!(matches!(err, IndexError::Incompatible { .. }));
    }

    #[test]
    fn test_load_missing_index() {
        let dir = TempDir::new().unwrap();
        let err = CodeIndex::load("/repo", dir.path(), HASHING_MODEL_NAME, 384).unwrap_err();
        assert_eq!(err.status_code(), "NOT_FOUND");
    }
}
