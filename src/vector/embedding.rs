//! Embedding generation for chunks and queries.
//!
//! The core only consumes the [`Embedder`] trait. Two implementations ship
//! with the crate:
//!
//! - [`HashingEmbedder`] (`hashing-v1`): identifier-aware feature hashing.
//!   Deterministic, dependency-free at runtime and fast enough to embed every
//!   chunk of a large tree. `calculateTax`, `calculate_tax` and
//!   `CalculateTax` all map onto the same `calculate` + `tax` features.
//! - `FastEmbedEmbedder` (`all-MiniLM-L6-v2`, behind the `fastembed`
//!   feature): a real sentence-embedding model.
//!
//! Embeddings are L2-normalised, so cosine similarity is a dot product.

use crate::types::Chunk;
use crate::vector::types::{EmbedError, VECTOR_DIMENSION_384, normalize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Model name of the built-in hashing embedder.
pub const HASHING_MODEL_NAME: &str = "hashing-v1";

/// Maps text to a fixed-dimension unit vector.
///
/// Implementations must be thread-safe: the indexer embeds chunks from a
/// rayon pool.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    fn dimensions(&self) -> usize;

    fn model_name(&self) -> &str;

    /// Embed several texts. The default embeds one at a time.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError> {
        texts.iter().map(|text| self.embed(text)).collect()
    }
}

/// Words that carry syntax rather than meaning.
const STOP_WORDS: &[&str] = &[
    "func", "fn", "def", "function", "return", "returns", "struct", "type", "package", "import",
    "from", "var", "let", "const", "class", "interface", "if", "else", "elif", "for", "while",
    "in", "of", "the", "and", "or", "not", "new", "self", "this", "public", "private",
    "protected", "static", "void", "pub", "mut", "async", "await", "export", "default", "is",
    "to", "a", "an", "nil", "null", "none", "true", "false",
];

/// Split text into lowercase identifier parts.
///
/// Splits on non-alphanumerics, camelCase humps, acronym boundaries
/// (`VATRate` -> `vat`, `rate`) and letter/digit boundaries. Single
/// characters, pure numbers and stop words are dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        for part in split_identifier(word) {
            let lower = part.to_lowercase();
            if lower.chars().count() < 2
                || lower.chars().all(|c| c.is_ascii_digit())
                || STOP_WORDS.contains(&lower.as_str())
            {
                continue;
            }
            tokens.push(lower);
        }
    }
    tokens
}

fn split_identifier(word: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = word.char_indices().collect();
    let mut parts = Vec::new();
    let mut start = 0;

    for i in 1..chars.len() {
        let (idx, c) = chars[i];
        let (_, prev) = chars[i - 1];
        let next = chars.get(i + 1).map(|&(_, n)| n);

        let boundary = (prev.is_lowercase() && c.is_uppercase())
            || (prev.is_alphabetic() && c.is_ascii_digit())
            || (prev.is_ascii_digit() && c.is_alphabetic())
            || (prev.is_uppercase() && c.is_uppercase() && next.is_some_and(char::is_lowercase));

        if boundary {
            parts.push(&word[start..idx]);
            start = idx;
        }
    }
    parts.push(&word[start..]);
    parts
}

/// Deterministic feature-hashing embedder.
///
/// Each token adds 1.0 to the bucket `sha256(token) mod D`. The result is
/// L2-normalised; text without any token yields the zero vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(VECTOR_DIMENSION_384)
    }
}

impl HashingEmbedder {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = Sha256::digest(token.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(prefix) % self.dimension as u64) as usize
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            vector[self.bucket(&token)] += 1.0;
        }
        normalize(&mut vector);
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        HASHING_MODEL_NAME
    }
}

/// FastEmbed implementation using the AllMiniLML6V2 model.
///
/// Produces 384-dimensional embeddings. The model is downloaded on first
/// use into fastembed's cache directory.
#[cfg(feature = "fastembed")]
pub struct FastEmbedEmbedder {
    model: parking_lot::Mutex<fastembed::TextEmbedding>,
}

#[cfg(feature = "fastembed")]
impl FastEmbedEmbedder {
    pub const MODEL_NAME: &'static str = "all-MiniLM-L6-v2";

    /// Create a new embedder.
    ///
    /// # Errors
    /// Returns an error if the model fails to initialize or download.
    pub fn new(show_download_progress: bool) -> Result<Self, EmbedError> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::AllMiniLML6V2)
                .with_show_download_progress(show_download_progress),
        )
        .map_err(|e| {
            EmbedError::ModelInit(format!(
                "{e}. Ensure you have internet connection for first-time model download"
            ))
        })?;

        Ok(Self {
            model: parking_lot::Mutex::new(model),
        })
    }
}

#[cfg(feature = "fastembed")]
impl Embedder for FastEmbedEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut batch = self.embed_batch(&[text])?;
        batch
            .pop()
            .ok_or_else(|| EmbedError::Generation("model returned no embedding".to_string()))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let owned: Vec<String> = texts.iter().map(|&s| s.to_string()).collect();
        let mut embeddings = self
            .model
            .lock()
            .embed(owned, None)
            .map_err(|e| EmbedError::Generation(e.to_string()))?;

        for embedding in &mut embeddings {
            if embedding.len() != VECTOR_DIMENSION_384 {
                return Err(EmbedError::Generation(format!(
                    "expected {VECTOR_DIMENSION_384} dimensions, got {}",
                    embedding.len()
                )));
            }
            normalize(embedding);
        }
        Ok(embeddings)
    }

    fn dimensions(&self) -> usize {
        VECTOR_DIMENSION_384
    }

    fn model_name(&self) -> &str {
        Self::MODEL_NAME
    }
}

/// Build the embedder named by the configuration.
pub fn create_embedder(model: &str, dimension: usize) -> Result<Arc<dyn Embedder>, EmbedError> {
    match model {
        HASHING_MODEL_NAME => Ok(Arc::new(HashingEmbedder::new(dimension))),
        #[cfg(feature = "fastembed")]
        FastEmbedEmbedder::MODEL_NAME => Ok(Arc::new(FastEmbedEmbedder::new(false)?)),
        other => Err(EmbedError::UnknownModel(other.to_string())),
    }
}

/// Text used to embed a chunk.
///
/// Named declarations embed their name plus the declaration line up to the
/// opening brace, which keeps the vector focused on the signature rather
/// than on the body. Everything else embeds the full chunk text.
#[must_use]
pub fn chunk_text(chunk: &Chunk) -> String {
    let Some(name) = chunk.metadata.symbol_name() else {
        return chunk.content.clone();
    };

    let decl_line = chunk
        .metadata
        .start_line
        .filter(|&line| line >= chunk.start_line)
        .map(|line| (line - chunk.start_line) as usize)
        .and_then(|offset| chunk.content.split('\n').nth(offset))
        .unwrap_or_default();
    let signature = decl_line.split('{').next().unwrap_or_default().trim();

    format!("{name} {signature}")
}
