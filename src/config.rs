//! Configuration module.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file (`<root>/.clindex/settings.toml`)
//! - Environment variable overrides
//! - CLI argument overrides (applied by the binary after loading)
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `CLINDEX_` and use double
//! underscores to separate nested levels:
//! - `CLINDEX_SEARCH__THRESHOLD=0.5` sets `search.threshold`
//! - `CLINDEX_CACHE__ENABLED=false` sets `cache.enabled`
//! - `CLINDEX_STORAGE__COMPRESSION=gzip` sets `storage.compression`
//! - `CLINDEX_EMBEDDING__CACHE__DISK=true` sets `embedding.cache.disk`

use crate::error::{IndexError, IndexResult, IoContext};
use crate::storage::{Compression, write_atomic};
use crate::vector::{HASHING_MODEL_NAME, HnswParams, VECTOR_DIMENSION_384};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the settings file inside the index directory.
pub const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Index directory, relative to the indexed root
    #[serde(default = "default_index_dir")]
    pub index_dir: PathBuf,

    #[serde(default)]
    pub indexing: IndexingConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub hnsw: HnswParams,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    #[serde(default)]
    pub incremental: IncrementalConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IndexingConfig {
    /// Index dot-files and dot-directories
    #[serde(default = "default_false")]
    pub include_hidden: bool,

    /// Restrict indexing to these extensions (empty = every known language)
    #[serde(default)]
    pub file_types: Vec<String>,

    /// Glob patterns to skip; patterns without `/` match any path component
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    /// Files larger than this many bytes are skipped
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Number of parallel threads for chunking and embedding
    #[serde(default = "default_parallel_threads")]
    pub parallel_threads: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ChunkingConfig {
    #[serde(default = "default_base_chunk_size")]
    pub base_chunk_size: usize,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_overlap_lines")]
    pub overlap_lines: usize,
    #[serde(default = "default_min_context_lines")]
    pub min_context_lines: usize,
    #[serde(default = "default_adaptive_size_factor")]
    pub adaptive_size_factor: f32,
    #[serde(default = "default_complexity_weight")]
    pub complexity_weight: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EmbeddingConfig {
    /// `hashing-v1`, or `all-MiniLM-L6-v2` with the `fastembed` feature
    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_dimension")]
    pub dimension: usize,

    #[serde(default)]
    pub cache: EmbeddingCacheConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct EmbeddingCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Embeddings kept in memory
    #[serde(default = "default_embedding_cache_entries")]
    pub memory_entries: usize,

    /// Also keep embeddings on disk, next to the query cache
    #[serde(default = "default_false")]
    pub disk: bool,

    #[serde(default = "default_embedding_cache_disk_bytes")]
    pub disk_max_bytes: u64,

    #[serde(default = "default_embedding_cache_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StorageConfig {
    #[serde(default)]
    pub compression: Compression,

    /// Store vectors as 8-bit min/max quantised components
    #[serde(default = "default_false")]
    pub quantize: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SearchConfig {
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Minimum similarity for semantic and fuzzy results
    #[serde(default = "default_threshold")]
    pub threshold: f32,

    #[serde(default = "default_context_lines")]
    pub context_lines: usize,

    /// Below this many vectors semantic search scans the exact store only
    #[serde(default = "default_hnsw_min_vectors")]
    pub hnsw_min_vectors: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_l1_size")]
    pub l1_size: usize,

    #[serde(default = "default_l2_size")]
    pub l2_size: usize,

    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Directory for L2 entries (defaults to the system temp dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_max_readers")]
    pub max_readers: usize,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    #[serde(default = "default_update_batch_size")]
    pub update_batch_size: usize,

    #[serde(default = "default_update_timeout_ms")]
    pub update_timeout_ms: u64,

    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_worker_queue_size")]
    pub worker_queue_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IncrementalConfig {
    /// Compare SHA-256 content hashes, not only size and mtime
    #[serde(default = "default_true")]
    pub enable_hashing: bool,

    /// Re-index files that import a changed file
    #[serde(default = "default_true")]
    pub enable_dependencies: bool,

    /// Files above this size are compared by size and mtime only
    #[serde(default = "default_max_file_size_hash")]
    pub max_file_size_hash: u64,

    /// Extra patterns excluded from change detection
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StreamingConfig {
    #[serde(default = "default_max_memory_usage")]
    pub max_memory_usage: u64,

    #[serde(default = "default_stream_chunk_size")]
    pub chunk_size: usize,

    /// Files at least this large are read through the streaming processor
    #[serde(default = "default_stream_threshold")]
    pub threshold: u64,

    #[serde(default = "default_true")]
    pub enable_spilling: bool,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_index_dir() -> PathBuf {
    PathBuf::from(".clindex")
}
fn default_false() -> bool {
    false
}
fn default_true() -> bool {
    true
}
fn default_exclude_patterns() -> Vec<String> {
    [
        "vendor",
        "node_modules",
        "build",
        "dist",
        "target",
        ".git",
        ".svn",
        ".idea",
        ".vscode",
        "coverage",
        "*.min.js",
        "*.min.css",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_max_file_size() -> u64 {
    1024 * 1024
}
fn default_parallel_threads() -> usize {
    num_cpus::get()
}
fn default_base_chunk_size() -> usize {
    20
}
fn default_max_chunk_size() -> usize {
    100
}
fn default_overlap_lines() -> usize {
    5
}
fn default_min_context_lines() -> usize {
    3
}
fn default_adaptive_size_factor() -> f32 {
    1.5
}
fn default_complexity_weight() -> f32 {
    0.3
}
fn default_embedding_model() -> String {
    HASHING_MODEL_NAME.to_string()
}
fn default_dimension() -> usize {
    VECTOR_DIMENSION_384
}
fn default_embedding_cache_entries() -> usize {
    10_000
}
fn default_embedding_cache_disk_bytes() -> u64 {
    256 * 1024 * 1024
}
fn default_embedding_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_max_results() -> usize {
    10
}
fn default_threshold() -> f32 {
    0.7
}
fn default_context_lines() -> usize {
    3
}
fn default_hnsw_min_vectors() -> usize {
    1000
}
fn default_l1_size() -> usize {
    1000
}
fn default_l2_size() -> usize {
    10_000
}
fn default_ttl_secs() -> u64 {
    600
}
fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_max_readers() -> usize {
    1000
}
fn default_max_queue_size() -> usize {
    1000
}
fn default_update_batch_size() -> usize {
    10
}
fn default_update_timeout_ms() -> u64 {
    30_000
}
fn default_min_workers() -> usize {
    (num_cpus::get() / 2).max(1)
}
fn default_max_workers() -> usize {
    (num_cpus::get() * 2).max(2)
}
fn default_worker_queue_size() -> usize {
    1000
}
fn default_max_file_size_hash() -> u64 {
    10 * 1024 * 1024
}
fn default_max_memory_usage() -> u64 {
    512 * 1024 * 1024
}
fn default_stream_chunk_size() -> usize {
    8 * 1024
}
fn default_stream_threshold() -> u64 {
    10 * 1024 * 1024
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            index_dir: default_index_dir(),
            indexing: IndexingConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            hnsw: HnswParams::default(),
            storage: StorageConfig::default(),
            search: SearchConfig::default(),
            cache: CacheConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            incremental: IncrementalConfig::default(),
            streaming: StreamingConfig::default(),
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            include_hidden: false,
            file_types: Vec::new(),
            exclude_patterns: default_exclude_patterns(),
            max_file_size: default_max_file_size(),
            parallel_threads: default_parallel_threads(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            base_chunk_size: default_base_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            overlap_lines: default_overlap_lines(),
            min_context_lines: default_min_context_lines(),
            adaptive_size_factor: default_adaptive_size_factor(),
            complexity_weight: default_complexity_weight(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dimension: default_dimension(),
            cache: EmbeddingCacheConfig::default(),
        }
    }
}

impl Default for EmbeddingCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_entries: default_embedding_cache_entries(),
            disk: false,
            disk_max_bytes: default_embedding_cache_disk_bytes(),
            ttl_secs: default_embedding_cache_ttl_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            quantize: false,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            threshold: default_threshold(),
            context_lines: default_context_lines(),
            hnsw_min_vectors: default_hnsw_min_vectors(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            l1_size: default_l1_size(),
            l2_size: default_l2_size(),
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            dir: None,
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_readers: default_max_readers(),
            max_queue_size: default_max_queue_size(),
            update_batch_size: default_update_batch_size(),
            update_timeout_ms: default_update_timeout_ms(),
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            worker_queue_size: default_worker_queue_size(),
        }
    }
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            enable_hashing: true,
            enable_dependencies: true,
            max_file_size_hash: default_max_file_size_hash(),
            exclude_patterns: Vec::new(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_memory_usage: default_max_memory_usage(),
            chunk_size: default_stream_chunk_size(),
            threshold: default_stream_threshold(),
            enable_spilling: true,
        }
    }
}

impl Settings {
    /// Load configuration for the tree rooted at `root`.
    ///
    /// Layers defaults, `<root>/.clindex/settings.toml` (if present) and
    /// `CLINDEX_*` environment variables.
    pub fn load(root: &Path) -> Result<Self, Box<figment::Error>> {
        Self::load_from(root.join(default_index_dir()).join(SETTINGS_FILE))
    }

    /// Load configuration from a specific file
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Self::figment(path.as_ref())
            .merge(Self::env_provider())
            .extract()
            .map_err(Box::new)
    }

    /// Defaults plus the TOML file, without the environment layer.
    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
    }

    fn env_provider() -> Env {
        // Double underscore (__) separates nested levels;
        // a single underscore stays part of the field name.
        Env::prefixed("CLINDEX_").map(|key| key.as_str().to_lowercase().replace("__", ".").into())
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> IndexResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_path(parent, "create directory")?;
        }
        let toml_string = toml::to_string_pretty(self).map_err(|e| IndexError::Config {
            reason: e.to_string(),
        })?;
        write_atomic(path, toml_string.as_bytes()).with_path(path, "write settings")
    }

    /// Absolute index directory for `root`.
    #[must_use]
    pub fn index_path(&self, root: &Path) -> PathBuf {
        if self.index_dir.is_absolute() {
            self.index_dir.clone()
        } else {
            root.join(&self.index_dir)
        }
    }

    /// Reject settings that would break an invariant downstream.
    pub fn validate(&self) -> IndexResult<()> {
        let config_err = |reason: &str| {
            Err(IndexError::Config {
                reason: reason.to_string(),
            })
        };
        if !(0.0..=1.0).contains(&self.search.threshold) {
            return config_err("search.threshold must be within [0, 1]");
        }
        if self.chunking.base_chunk_size == 0 || self.chunking.max_chunk_size == 0 {
            return config_err("chunk sizes must be positive");
        }
        if self.chunking.min_context_lines > self.chunking.max_chunk_size {
            return config_err("chunking.min_context_lines exceeds chunking.max_chunk_size");
        }
        if self.embedding.dimension == 0 {
            return config_err("embedding.dimension must be positive");
        }
        if self.embedding.cache.enabled && self.embedding.cache.memory_entries == 0 {
            return config_err("embedding.cache.memory_entries must be positive");
        }
        if self.hnsw.m < 2 || self.hnsw.m0 < self.hnsw.m || self.hnsw.max_layers == 0 {
            return config_err("hnsw requires m >= 2, m0 >= m and max_layers >= 1");
        }
        if self.concurrency.min_workers == 0
            || self.concurrency.max_workers < self.concurrency.min_workers
        {
            return config_err("concurrency requires 1 <= min_workers <= max_workers");
        }
        if self.streaming.chunk_size == 0 {
            return config_err("streaming.chunk_size must be positive");
        }
        Ok(())
    }
}
