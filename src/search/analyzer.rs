//! Query classification.
//!
//! Rules are checked in order and the first one that applies wins:
//!
//! 1. empty: [`QueryKind::Unknown`]
//! 2. an exact keyword (`TODO`, `FIXME`, `main`, ...) on its own or followed
//!    by `:` and text, or a double-quoted phrase: [`QueryKind::Exact`]
//! 3. a regex metacharacter in something that is not a file glob such as
//!    `*.go`: [`QueryKind::Regex`]
//! 4. a semantic keyword anywhere, a known concept pair, or a leading
//!    question word: [`QueryKind::Semantic`]
//! 5. anything else: [`QueryKind::Hybrid`]

use super::query::SearchType;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

/// Words that name a marker or a well-known entry point.
const EXACT_KEYWORDS: &[&str] = &[
    "TODO", "FIXME", "HACK", "XXX", "BUG", "NOTE", "DEPRECATED", "main", "init", "setup",
    "cleanup", "destroy",
];

const SEMANTIC_KEYWORDS: &[&str] = &[
    "authentication", "authorization", "login", "logout", "user", "account", "database",
    "query", "insert", "update", "delete", "select", "sql", "api", "endpoint", "route",
    "request", "response", "http", "rest", "function", "method", "class", "interface", "object",
    "variable", "error", "exception", "try", "catch", "throw", "handling", "test", "mock", "spec",
    "assert", "verify", "fixture", "config", "setting", "parameter", "option", "property", "util",
    "helper", "common", "shared", "base", "abstract", "cache", "memory", "performance",
    "optimize", "speed", "security", "encrypt", "decrypt", "hash", "token", "key", "file",
    "directory", "path", "stream", "buffer", "io", "validation", "check", "ensure", "guard",
    "logging", "debug", "trace", "monitor", "metric", "log", "event", "listener", "observer",
    "publisher", "subscriber", "service", "component", "module", "package", "library",
];

/// Word pairs that signal a concept even when neither is a keyword.
const CONCEPT_PAIRS: &[(&str, &str)] = &[
    ("user", "auth"),
    ("data", "access"),
    ("access", "control"),
    ("permission", "manage"),
    ("unit", "test"),
    ("integration", "test"),
    ("stream", "data"),
    ("exception", "management"),
];

const QUESTION_WORDS: &[&str] = &[
    "how", "what", "where", "when", "why", "which", "find", "search", "look",
];

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is",
    "it", "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there",
    "these", "they", "this", "to", "was", "will", "with", "have", "has", "had", "what", "when",
    "where", "who", "why", "how", "can", "could", "should", "would",
];

static EXACT_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(TODO|FIXME|HACK|XXX|BUG|NOTE|DEPRECATED):\s").expect("valid marker regex")
});

static REGEX_META: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.*+?|\[\](){}^$\\]").expect("valid metacharacter regex"));

static FILE_GLOB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[\w\-./*]+\.(go|js|ts|py|java|cpp|c|h|cs|php|rb|swift|kt|rs|scala|clj|hs|ml|fs|vim|sh|bat|ps1|json|xml|yaml|yml|toml|ini|cfg|conf|md|txt|log|sql|html|css|scss|sass|less)$",
    )
    .expect("valid file glob regex")
});

/// Classification of a query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Unknown,
    Exact,
    Regex,
    Semantic,
    Hybrid,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Exact => "exact",
            Self::Regex => "regex",
            Self::Semantic => "semantic",
            Self::Hybrid => "hybrid",
        }
    }

    /// Strategy that serves this kind; `None` for [`QueryKind::Unknown`].
    pub fn search_type(&self) -> Option<SearchType> {
        match self {
            Self::Unknown => None,
            Self::Exact => Some(SearchType::Exact),
            Self::Regex => Some(SearchType::Regex),
            Self::Semantic => Some(SearchType::Semantic),
            Self::Hybrid => Some(SearchType::Hybrid),
        }
    }
}

/// Everything the analyser derives from a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub kind: QueryKind,
    /// How strongly the rule that fired indicates `kind`, in `[0, 1]`
    pub confidence: f32,
    /// Lowercase words with stop words and punctuation removed
    pub keywords: Vec<String>,
    /// Query text to search for: trimmed, surrounding quotes removed
    pub processed: String,
}

/// Classify `query`.
pub fn classify(query: &str) -> QueryKind {
    analyze(query).kind
}

/// Classify `query` and extract its keywords.
pub fn analyze(query: &str) -> Analysis {
    let trimmed = query.trim();
    let processed = unquote(trimmed).unwrap_or(trimmed).to_string();
    let keywords = keywords(trimmed);

    let (kind, confidence) = if trimmed.is_empty() {
        (QueryKind::Unknown, 0.0)
    } else if is_exact(trimmed) {
        (QueryKind::Exact, 0.95)
    } else if is_regex(trimmed) {
        (QueryKind::Regex, 0.9)
    } else if let Some(confidence) = semantic_confidence(trimmed) {
        (QueryKind::Semantic, confidence)
    } else {
        (QueryKind::Hybrid, 0.5)
    };

    Analysis {
        kind,
        confidence,
        keywords,
        processed,
    }
}

fn unquote(query: &str) -> Option<&str> {
    query
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .filter(|inner| !inner.is_empty())
}

fn is_exact(query: &str) -> bool {
    EXACT_KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(query))
        || EXACT_MARKER.is_match(query)
        || unquote(query).is_some()
}

fn is_regex(query: &str) -> bool {
    REGEX_META.is_match(query) && !FILE_GLOB.is_match(query)
}

fn semantic_confidence(query: &str) -> Option<f32> {
    let lower = query.to_lowercase();
    if SEMANTIC_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Some(0.8);
    }
    if CONCEPT_PAIRS
        .iter()
        .any(|(a, b)| lower.contains(a) && lower.contains(b))
    {
        return Some(0.75);
    }
    let first = lower.split_whitespace().next().unwrap_or_default();
    let has_more = lower.split_whitespace().nth(1).is_some();
    (has_more && QUESTION_WORDS.contains(&first)).then_some(0.7)
}

fn keywords(query: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for word in query.to_lowercase().split_whitespace() {
        let word = word.trim_matches(|c: char| ".,!?;:\"'()[]{}".contains(c));
        if word.chars().count() < 2 || STOP_WORDS.contains(&word) {
            continue;
        }
        if !seen.iter().any(|w: &String| w == word) {
            seen.push(word.to_string());
        }
    }
    seen
}
