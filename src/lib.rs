//! Local code search.
//!
//! `clindex` splits a source tree into structural chunks, embeds each chunk,
//! stores the vectors in a versioned binary index and answers text, regex,
//! exact, fuzzy, semantic and hybrid queries against it.

pub mod chunking;
pub mod config;
pub mod display;
pub mod error;
pub mod index;
pub mod indexing;
pub mod io;
pub mod logging;
pub mod pool;
pub mod runtime;
pub mod search;
pub mod storage;
pub mod types;
pub mod vector;

// Explicit exports for better API clarity
pub use config::Settings;
pub use error::{IndexError, IndexResult};
pub use index::{CodeIndex, ConcurrentIndex};
pub use indexing::{IndexBuilder, IndexingReport};
pub use search::{SearchEngine, SearchQuery, SearchResult, SearchResults, SearchType};
pub use types::{Chunk, ChunkKind, FileEntry, Language};
