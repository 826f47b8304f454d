//! Metadata describing a built index.
//!
//! Stored both as `metadata.json` next to `index.bin` and as the trailing
//! JSON section of `index.bin` itself.

use crate::error::{IndexError, IndexResult, IoContext};
use crate::storage::format::FORMAT_VERSION;
use crate::storage::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the sidecar metadata.
pub const METADATA_FILE: &str = "metadata.json";

/// Kind of approximate index built next to the exact store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    /// Exact store only
    Flat,
    /// Exact store plus an HNSW graph rebuilt on load
    Hnsw,
}

/// Metadata about the index state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Embedding model the vectors were produced with
    pub model_name: String,

    pub dimension: usize,

    /// Version of the binary format
    pub format_version: u16,

    pub build_time: DateTime<Utc>,

    pub chunk_count: u64,
    pub file_count: u64,
    pub vector_count: u64,

    pub index_type: IndexType,

    /// Root the index was built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

impl IndexMetadata {
    pub fn new(model_name: impl Into<String>, dimension: usize, index_type: IndexType) -> Self {
        Self {
            model_name: model_name.into(),
            dimension,
            format_version: FORMAT_VERSION,
            build_time: Utc::now(),
            chunk_count: 0,
            file_count: 0,
            vector_count: 0,
            index_type,
            root: None,
        }
    }

    /// Update counts and stamp the build time.
    pub fn update_counts(&mut self, file_count: usize, chunk_count: usize, vector_count: usize) {
        self.file_count = file_count as u64;
        self.chunk_count = chunk_count as u64;
        self.vector_count = vector_count as u64;
        self.build_time = Utc::now();
    }

    /// An index can only be opened with the embedder that built it.
    pub fn check_compatible(&self, model_name: &str, dimension: usize) -> IndexResult<()> {
        if self.model_name != model_name || self.dimension != dimension {
            return Err(IndexError::Incompatible {
                reason: format!(
                    "index built with '{}' ({} dims), current embedder is '{model_name}' ({dimension} dims)",
                    self.model_name, self.dimension
                ),
            });
        }
        Ok(())
    }

    /// Save metadata to `<index_dir>/metadata.json`
    pub fn save(&self, index_dir: &Path) -> IndexResult<()> {
        let path = index_dir.join(METADATA_FILE);
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| IndexError::corrupt(format!("cannot serialise metadata: {e}")))?;
        write_atomic(&path, &json).with_path(&path, "write metadata")
    }

    /// Load metadata from `<index_dir>/metadata.json`
    pub fn load(index_dir: &Path) -> IndexResult<Self> {
        let path = index_dir.join(METADATA_FILE);
        if !path.exists() {
            return Err(IndexError::not_found("index", index_dir.display().to_string()));
        }
        let bytes = std::fs::read(&path).with_path(&path, "read metadata")?;
        serde_json::from_slice(&bytes)
            .map_err(|e| IndexError::corrupt(format!("invalid {METADATA_FILE}: {e}")))
    }
}
