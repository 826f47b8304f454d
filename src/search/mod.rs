//! Query analysis, execution and caching.

pub mod analyzer;
pub mod cache;
pub mod engine;
pub mod query;

pub use analyzer::{Analysis, QueryKind, analyze, classify};
pub use cache::{CacheLevel, CacheStats, SearchCache};
pub use engine::{SearchEngine, SearchOptions};
pub use query::{
    DEFAULT_CONTEXT_LINES, DEFAULT_MAX_RESULTS, DEFAULT_THRESHOLD, MAX_RESULTS_LIMIT, MatchType,
    SearchQuery, SearchResult, SearchResults, SearchType,
};
