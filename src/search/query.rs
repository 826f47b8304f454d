//! Query and result types.

use crate::config::SearchConfig;
use crate::error::{IndexError, IndexResult};
use crate::types::Language;
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound accepted for [`SearchQuery::max_results`].
pub const MAX_RESULTS_LIMIT: usize = 1000;

pub const DEFAULT_MAX_RESULTS: usize = 10;
pub const DEFAULT_THRESHOLD: f32 = 0.7;
pub const DEFAULT_CONTEXT_LINES: usize = 3;

/// Search strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    /// Embedding similarity over chunks
    Semantic,
    /// Lowercase AND-match of whitespace separated terms per line
    Text,
    /// Semantic and text merged
    Hybrid,
    Regex,
    /// Case-insensitive phrase
    Exact,
    /// Terms with partial credit for near misses
    Fuzzy,
}

impl SearchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Text => "text",
            Self::Hybrid => "hybrid",
            Self::Regex => "regex",
            Self::Exact => "exact",
            Self::Fuzzy => "fuzzy",
        }
    }
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchType {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "semantic" => Ok(Self::Semantic),
            "text" => Ok(Self::Text),
            "hybrid" => Ok(Self::Hybrid),
            "regex" => Ok(Self::Regex),
            "exact" => Ok(Self::Exact),
            "fuzzy" => Ok(Self::Fuzzy),
            other => Err(IndexError::invalid(format!("unknown search type '{other}'"))),
        }
    }
}

/// How a single result matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Semantic,
    Fuzzy,
    Regex,
    /// Every term found somewhere in the line
    Partial,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Semantic => "semantic",
            Self::Fuzzy => "fuzzy",
            Self::Regex => "regex",
            Self::Partial => "partial",
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A search request.
///
/// Built with [`SearchQuery::new`] and the chained setters; checked by
/// [`validate`](Self::validate) before it reaches the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    pub max_results: usize,
    pub include_context: bool,
    pub context_lines: usize,
    /// Glob over the root-relative path (`src/**/*.go`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,
    pub threshold: f32,
    /// Explicit strategy; `None` lets the analyser choose
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_type: Option<SearchType>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into().trim().to_string(),
            max_results: DEFAULT_MAX_RESULTS,
            include_context: false,
            context_lines: DEFAULT_CONTEXT_LINES,
            file_pattern: None,
            language: None,
            threshold: DEFAULT_THRESHOLD,
            search_type: None,
        }
    }

    /// Query with the defaults taken from the `[search]` settings.
    pub fn from_config(text: impl Into<String>, config: &SearchConfig) -> Self {
        Self {
            max_results: config.max_results,
            threshold: config.threshold,
            context_lines: config.context_lines,
            ..Self::new(text)
        }
    }

    pub fn max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn search_type(mut self, search_type: SearchType) -> Self {
        self.search_type = Some(search_type);
        self
    }

    pub fn file_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.file_pattern = Some(pattern.into());
        self
    }

    pub fn language(mut self, language: Language) -> Self {
        self.language = Some(language);
        self
    }

    pub fn with_context(mut self, include: bool) -> Self {
        self.include_context = include;
        self
    }

    pub fn context_lines(mut self, lines: usize) -> Self {
        self.context_lines = lines;
        self
    }

    pub fn validate(&self) -> IndexResult<()> {
        if self.text.trim().is_empty() {
            return Err(IndexError::invalid("query text cannot be empty"));
        }
        if self.max_results == 0 || self.max_results > MAX_RESULTS_LIMIT {
            return Err(IndexError::invalid(format!(
                "max results must be between 1 and {MAX_RESULTS_LIMIT}, got {}",
                self.max_results
            )));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(IndexError::invalid(format!(
                "threshold must be between 0 and 1, got {}",
                self.threshold
            )));
        }
        if self.search_type == Some(SearchType::Regex) {
            regex::Regex::new(&self.text)
                .map_err(|e| IndexError::invalid(format!("invalid regex pattern: {e}")))?;
        }
        self.file_matcher()?;
        Ok(())
    }

    /// Compiled `file_pattern`, if any.
    pub fn file_matcher(&self) -> IndexResult<Option<GlobMatcher>> {
        self.file_pattern
            .as_deref()
            .map(|pattern| {
                Glob::new(pattern)
                    .map(|glob| glob.compile_matcher())
                    .map_err(|e| IndexError::invalid(format!("invalid file pattern '{pattern}': {e}")))
            })
            .transpose()
    }

    /// Stable 128-bit identity of everything that influences the results.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        let search_type = self.search_type.map_or("auto", |t| t.as_str());
        let language = self.language.map_or("", |l| l.as_str());
        for field in [
            self.text.as_str(),
            search_type,
            &self.threshold.to_bits().to_string(),
            &self.max_results.to_string(),
            self.file_pattern.as_deref().unwrap_or(""),
            language,
            if self.include_context { "context" } else { "" },
            &self.context_lines.to_string(),
        ] {
            hasher.update(field.as_bytes());
            hasher.update([0]);
        }
        hex::encode(&hasher.finalize()[..16])
    }
}

/// One matching range of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub relevance_score: f32,
    pub language: Language,
    pub match_type: MatchType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub highlights: Vec<String>,
    /// 1-based position after ranking
    #[serde(default)]
    pub rank: usize,
}

impl SearchResult {
    /// Key used to merge results of different strategies.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.file_path, self.start_line, self.end_line)
    }
}

/// Ranked results of one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub query: String,
    /// Strategy that produced the results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_type: Option<SearchType>,
    pub results: Vec<SearchResult>,
    /// Matches found before truncation to `max_results`
    pub total_results: usize,
    pub execution_time: Duration,
    pub has_more: bool,
    pub searched_files: usize,
    /// Served from the query cache
    #[serde(default)]
    pub cached: bool,
}

impl SearchResults {
    pub fn empty(query: &SearchQuery) -> Self {
        Self {
            query: query.text.clone(),
            search_type: query.search_type,
            results: Vec::new(),
            total_results: 0,
            execution_time: Duration::ZERO,
            has_more: false,
            searched_files: 0,
            cached: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let query = SearchQuery::new("  calculateTax  ");
        assert_eq!(query.text, "calculateTax");
        assert_eq!(query.max_results, 10);
        assert_eq!(query.threshold, 0.7);
        assert_eq!(query.context_lines, 3);
        assert!(query.search_type.is_none());
        assert!(query.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            SearchQuery::new("   "),
            SearchQuery::new("x").max_results(0),
            SearchQuery::new("x").max_results(1001),
            SearchQuery::new("x").threshold(1.5),
            SearchQuery::new("x").threshold(f32::NAN),
            SearchQuery::new("fn(").search_type(SearchType::Regex),
            SearchQuery::new("x").file_pattern("src/[.go"),
        ];
        for query in cases {
            let err = query.validate().unwrap_err();
            assert_eq!(err.status_code(), "INVALID_ARGUMENT", "{query:?}");
        }
    }

    #[test]
    fn test_fingerprint_covers_salient_fields() {
        let base = SearchQuery::new("calculate tax");
        assert_eq!(base.fingerprint(), SearchQuery::new("calculate tax").fingerprint());
        assert_eq!(base.fingerprint().len(), 32);

        let variants = [
            base.clone().threshold(0.5),
            base.clone().max_results(5),
            base.clone().search_type(SearchType::Semantic),
            base.clone().file_pattern("*.go"),
            base.clone().language(Language::Go),
            base.clone().with_context(true),
            SearchQuery::new("calculate  tax"),
        ];
        for variant in variants {
            assert_ne!(base.fingerprint(), variant.fingerprint(), "{variant:?}");
        }
    }

    #[test]
    fn test_search_type_parsing() {
        assert_eq!("Semantic".parse::<SearchType>().unwrap(), SearchType::Semantic);
        assert_eq!("fuzzy".parse::<SearchType>().unwrap(), SearchType::Fuzzy);
        assert!("vector".parse::<SearchType>().is_err());
    }

    #[test]
    fn test_file_matcher() {
        let query = SearchQuery::new("x").file_pattern("src/**/*.go");
        let matcher = query.file_matcher().unwrap().unwrap();
        assert!(matcher.is_match("src/pkg/tax.go"));
        assert!(!matcher.is_match("cmd/main.go"));
        assert!(SearchQuery::new("x").file_matcher().unwrap().is_none());
    }
}
