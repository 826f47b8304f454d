//! Vector search functionality.
//!
//! Two indexes share the same keyed vectors:
//! - [`VectorStore`]: exact cosine search over every vector, the source of
//!   truth for scores.
//! - [`HnswIndex`]: approximate graph search used to pick candidates once
//!   the index is large enough that a full scan stops being cheap.
//!
//! Embeddings come from an [`Embedder`]; the default is the deterministic
//! [`HashingEmbedder`]. [`CachedEmbedder`] puts an [`EmbeddingCache`] in
//! front of any embedder.

mod embedding;
mod embedding_cache;
mod hnsw;
mod store;
mod types;

#[cfg(feature = "fastembed")]
pub use embedding::FastEmbedEmbedder;
pub use embedding::{
    Embedder, HASHING_MODEL_NAME, HashingEmbedder, chunk_text, create_embedder, tokenize,
};
pub use embedding_cache::{
    CachedEmbedder, EMBEDDING_CACHE_DIR_NAME, EmbeddingCache, EmbeddingCacheStats,
    embedder_from_settings, embedding_cache_dir,
};
pub use hnsw::{HnswIndex, HnswParams, HnswStats, LayerStats};
pub use store::VectorStore;
pub use types::{
    EmbedError, Score, SharedVector, VECTOR_DIMENSION_384, VectorDimension, VectorEntry,
    VectorError, VectorMatch, VectorMetadata, cosine_similarity, euclidean_distance, normalize,
};
