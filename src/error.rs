//! Error types for the code search engine.
//!
//! This module provides structured error types using thiserror. Every
//! variant maps to one of the error kinds surfaced to callers and to a
//! stable status code that the CLI and JSON output use.

use crate::vector::{EmbedError, VectorError};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main error type for indexing and search operations
#[derive(Error, Debug)]
pub enum IndexError {
    /// Bad flag, missing query, threshold out of range
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// No index at the target, missing path, unknown node id
    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    /// Magic/version mismatch, truncated section, checksum or decompressor failure
    #[error("Index appears to be corrupted: {reason}")]
    Corrupt { reason: String },

    /// On-disk model or dimension disagrees with the current embedder
    #[error("Index is incompatible with the current embedder: {reason}")]
    Incompatible { reason: String },

    #[error("Index directory '{path}' is locked by another process")]
    Locked { path: PathBuf },

    #[error("Update queue is full (waited {waited_ms}ms)")]
    QueueFull { waited_ms: u64 },

    #[error("Too many concurrent readers (limit {limit})")]
    TooManyReaders { limit: usize },

    #[error("Index is not available")]
    Unavailable,

    /// Cancellation or an explicit deadline expired
    #[error("Operation '{operation}' timed out or was cancelled")]
    Timeout { operation: String },

    /// File system errors, always carrying the path and the operation
    #[error("Failed to {operation} '{path}': {source}")]
    Io {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    #[error(transparent)]
    Embedding(#[from] EmbedError),

    #[error(transparent)]
    Vector(#[from] VectorError),
}

impl IndexError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            name: name.into(),
        }
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }

    pub fn io(path: impl AsRef<Path>, operation: &'static str, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            operation,
            source,
        }
    }

    /// Get a stable status code for this error type.
    ///
    /// Returns a string identifier that can be used in JSON responses
    /// for programmatic error handling.
    pub fn status_code(&self) -> String {
        match self {
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Corrupt { .. } => "INDEX_CORRUPTED",
            Self::Incompatible { .. } => "INDEX_INCOMPATIBLE",
            Self::Locked { .. } => "LOCKED",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::TooManyReaders { .. } => "TOO_MANY_READERS",
            Self::Unavailable => "UNAVAILABLE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Io { .. } => "IO_FAILURE",
            Self::Config { .. } => "CONFIG_ERROR",
            Self::Embedding(_) => "EMBEDDING_ERROR",
            Self::Vector(VectorError::NodeNotFound(_)) => "NOT_FOUND",
            Self::Vector(_) => "VECTOR_ERROR",
        }
        .to_string()
    }

    /// True for transient backpressure errors the caller may retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueFull { .. } | Self::TooManyReaders { .. } | Self::Locked { .. }
        )
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::NotFound { what: "index", .. } => vec![
                "Run 'clindex index' in the project root to build the index",
            ],
            Self::Corrupt { .. } => vec![
                "Run 'clindex index --force' to rebuild from scratch",
                "Check for disk errors or filesystem corruption",
            ],
            Self::Incompatible { .. } => vec![
                "The index was built with a different embedding model",
                "Run 'clindex index --force' to rebuild it with the current model",
            ],
            Self::Locked { .. } => vec![
                "Wait for the running 'clindex index' to finish and try again",
            ],
            Self::QueueFull { .. } | Self::TooManyReaders { .. } => {
                vec!["The index is busy, retry the operation"]
            }
            Self::Io { .. } => vec![
                "Check that the path exists and you have the required permissions",
            ],
            Self::InvalidArgument { .. } => vec!["Run 'clindex help' for usage"],
            _ => vec![],
        }
    }
}

/// Result type alias for index operations
pub type IndexResult<T> = Result<T, IndexError>;

/// Helper trait for attaching a path and operation to I/O errors
pub trait IoContext<T> {
    fn with_path(self, path: impl AsRef<Path>, operation: &'static str) -> IndexResult<T>;
}

impl<T> IoContext<T> for Result<T, std::io::Error> {
    fn with_path(self, path: impl AsRef<Path>, operation: &'static str) -> IndexResult<T> {
        self.map_err(|e| IndexError::io(path, operation, e))
    }
}
