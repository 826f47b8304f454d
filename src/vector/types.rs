//! Type-safe wrappers and core types for vector search functionality.
//!
//! Vectors are shared read-only between the brute-force store and the HNSW
//! graph as `Arc<[f32]>`, so inserting a chunk into both never copies the
//! embedding twice.

use crate::types::{ChunkKind, ChunkMetadata, Language};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Standard vector dimension for code embeddings.
pub const VECTOR_DIMENSION_384: usize = 384;

/// Shared, immutable embedding.
pub type SharedVector = Arc<[f32]>;

/// Type-safe wrapper for similarity scores.
///
/// Scores are normalized to the range [0.0, 1.0] where:
/// - 1.0 indicates perfect similarity
/// - 0.0 indicates no similarity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score(f32);

impl Score {
    /// Clamp any raw similarity into a valid score. NaN becomes 0.
    #[must_use]
    pub fn saturating(value: f32) -> Self {
        if value.is_nan() {
            Self(0.0)
        } else {
            Self(value.clamp(0.0, 1.0))
        }
    }

    /// Returns the underlying f32 value.
    #[must_use]
    pub fn get(&self) -> f32 {
        self.0
    }
}

/// Type-safe wrapper for vector dimensions.
///
/// The store and the HNSW graph pin one of these on their first insert and
/// reject vectors of any other length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorDimension(usize);

impl VectorDimension {
    /// Creates a new `VectorDimension` with validation.
    ///
    /// Returns an error if the dimension is zero.
    pub fn new(dim: usize) -> Result<Self, VectorError> {
        if dim == 0 {
            return Err(VectorError::InvalidDimension {
                dimension: 0,
                reason: "Vector dimension cannot be zero",
            });
        }
        Ok(Self(dim))
    }

    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }

    /// Validates that a vector has the expected dimension.
    pub fn validate_vector(&self, vector: &[f32]) -> Result<(), VectorError> {
        if vector.len() != self.0 {
            return Err(VectorError::DimensionMismatch {
                expected: self.0,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

/// Typed metadata stored next to each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub language: Language,
    pub kind: ChunkKind,
    #[serde(default)]
    pub chunk: ChunkMetadata,
}

/// One keyed vector inside the store.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    pub id: String,
    pub vector: SharedVector,
    pub metadata: VectorMetadata,
}

/// A scored match returned by the store or the HNSW graph.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub id: String,
    pub score: Score,
}

/// Cosine similarity of two vectors.
///
/// Zero-norm inputs and mismatched dimensions yield 0.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Euclidean distance; mismatched dimensions compare over the shared prefix.
#[must_use]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Errors that can occur during vector operations.
///
/// All error messages include actionable suggestions for resolution.
#[derive(Error, Debug)]
pub enum VectorError {
    #[error(
        "Vector dimension mismatch: expected {expected}, got {actual}\nSuggestion: Ensure all vectors use the same embedding model"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid vector dimension: {dimension}\nReason: {reason}")]
    InvalidDimension {
        dimension: usize,
        reason: &'static str,
    },

    #[error("Cannot insert an empty vector for '{0}'")]
    EmptyVector(String),

    #[error("Query vector is empty\nSuggestion: Check that the embedder produced output")]
    EmptyQuery,

    #[error("Node not found: {0}\nSuggestion: Verify the vector was properly indexed")]
    NodeNotFound(String),

    #[error("Storage error: {0}\nSuggestion: Check disk space and file permissions")]
    Storage(#[from] std::io::Error),

    #[error(
        "Serialization error: {0}\nSuggestion: Check that vector data is valid and not corrupted"
    )]
    Serialization(String),
}

/// Errors raised by an [`Embedder`](super::Embedder).
#[derive(Error, Debug)]
pub enum EmbedError {
    #[error(
        "Embedding model initialization failed: {0}\nSuggestion: Check the model name and that the model files can be downloaded"
    )]
    ModelInit(String),

    #[error(
        "Embedding generation failed: {0}\nSuggestion: Verify the embedding model is properly initialized"
    )]
    Generation(String),

    #[error("Unknown embedding model '{0}'\nSuggestion: Use 'hashing-v1' or build with the 'fastembed' feature")]
    UnknownModel(String),
}
