//! Core data model: languages, chunks and file entries.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Languages the file classifier recognises.
///
/// The chunking strategy is chosen from the language: Go gets the
/// tree-sitter parser, Python the indentation heuristics, JavaScript and
/// TypeScript the brace heuristics, everything else adaptive windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Go,
    Python,
    JavaScript,
    TypeScript,
    Java,
    C,
    Cpp,
    CSharp,
    Php,
    Ruby,
    Rust,
    Swift,
    Kotlin,
    Scala,
    Clojure,
    Haskell,
    OCaml,
    Shell,
    Sql,
    Html,
    Css,
    Json,
    Yaml,
    Toml,
    Ini,
    GraphQl,
    Protobuf,
    Markdown,
    Text,
}

/// How a language is split into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStrategy {
    /// Real parser (tree-sitter)
    Syntax,
    /// `def` / `class` blocks closed by dedent
    Indentation,
    /// Declarations closed by brace balance
    Braces,
    /// Adaptive sliding windows
    Adaptive,
}

impl Language {
    /// Every recognised language.
    pub const ALL: [Language; 29] = [
        Language::Go,
        Language::Python,
        Language::JavaScript,
        Language::TypeScript,
        Language::Java,
        Language::C,
        Language::Cpp,
        Language::CSharp,
        Language::Php,
        Language::Ruby,
        Language::Rust,
        Language::Swift,
        Language::Kotlin,
        Language::Scala,
        Language::Clojure,
        Language::Haskell,
        Language::OCaml,
        Language::Shell,
        Language::Sql,
        Language::Html,
        Language::Css,
        Language::Json,
        Language::Yaml,
        Language::Toml,
        Language::Ini,
        Language::GraphQl,
        Language::Protobuf,
        Language::Markdown,
        Language::Text,
    ];

    /// Map a file extension (without the dot, any case) to a language.
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        let lang = match ext.to_ascii_lowercase().as_str() {
            "go" => Self::Go,
            "py" | "pyi" => Self::Python,
            "js" | "jsx" | "mjs" | "cjs" => Self::JavaScript,
            "ts" | "tsx" => Self::TypeScript,
            "java" => Self::Java,
            "c" | "h" => Self::C,
            "cpp" | "cc" | "cxx" | "hpp" | "hh" => Self::Cpp,
            "cs" => Self::CSharp,
            "php" => Self::Php,
            "rb" => Self::Ruby,
            "rs" => Self::Rust,
            "swift" => Self::Swift,
            "kt" | "kts" => Self::Kotlin,
            "scala" => Self::Scala,
            "clj" => Self::Clojure,
            "hs" => Self::Haskell,
            "ml" => Self::OCaml,
            "sh" | "bash" | "zsh" | "fish" => Self::Shell,
            "sql" => Self::Sql,
            "html" | "htm" => Self::Html,
            "css" | "scss" | "sass" | "less" => Self::Css,
            "json" => Self::Json,
            "yaml" | "yml" => Self::Yaml,
            "toml" => Self::Toml,
            "ini" | "cfg" | "conf" => Self::Ini,
            "graphql" => Self::GraphQl,
            "proto" => Self::Protobuf,
            "md" | "rst" => Self::Markdown,
            "txt" => Self::Text,
            _ => return None,
        };
        Some(lang)
    }

    /// Detect the language of a path from its extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    /// Stable lowercase name used on disk and in filters.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Go => "go",
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Java => "java",
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::CSharp => "csharp",
            Self::Php => "php",
            Self::Ruby => "ruby",
            Self::Rust => "rust",
            Self::Swift => "swift",
            Self::Kotlin => "kotlin",
            Self::Scala => "scala",
            Self::Clojure => "clojure",
            Self::Haskell => "haskell",
            Self::OCaml => "ocaml",
            Self::Shell => "shell",
            Self::Sql => "sql",
            Self::Html => "html",
            Self::Css => "css",
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Toml => "toml",
            Self::Ini => "ini",
            Self::GraphQl => "graphql",
            Self::Protobuf => "protobuf",
            Self::Markdown => "markdown",
            Self::Text => "text",
        }
    }

    #[must_use]
    pub fn chunk_strategy(&self) -> ChunkStrategy {
        match self {
            Self::Go => ChunkStrategy::Syntax,
            Self::Python => ChunkStrategy::Indentation,
            Self::JavaScript | Self::TypeScript => ChunkStrategy::Braces,
            _ => ChunkStrategy::Adaptive,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    /// Accepts the stable name (`go`, `python`, ...) or a file extension.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().trim_start_matches('.').to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|lang| lang.as_str() == lower)
            .or_else(|| Self::from_extension(&lower))
            .ok_or_else(|| format!("unknown language '{s}'"))
    }
}

/// The structural role of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Function,
    Class,
    Imports,
    Variables,
    Standalone,
    Enhanced,
    NonStructural,
}

impl ChunkKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Imports => "imports",
            Self::Variables => "variables",
            Self::Standalone => "standalone",
            Self::Enhanced => "enhanced",
            Self::NonStructural => "non_structural",
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known chunk attributes plus an open string map.
///
/// `start_line`/`end_line` hold the bounds of the declaration itself,
/// before context padding is applied to the owning chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indent_level: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<f32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl ChunkMetadata {
    /// Name of the declared symbol, if the chunk has one.
    #[must_use]
    pub fn symbol_name(&self) -> Option<&str> {
        self.function_name
            .as_deref()
            .or(self.class_name.as_deref())
    }
}

/// A contiguous line range of a source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub language: Language,
    pub kind: ChunkKind,
    #[serde(default)]
    pub metadata: ChunkMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

impl Chunk {
    /// Build a chunk from the file's lines; `start`/`end` are 1-based and inclusive.
    pub fn from_lines(
        file_path: &str,
        lines: &[&str],
        start: u32,
        end: u32,
        language: Language,
        kind: ChunkKind,
        metadata: ChunkMetadata,
    ) -> Self {
        let content = lines[(start - 1) as usize..end as usize].join("\n");
        Self {
            id: chunk_id(file_path, start, end, &content),
            file_path: file_path.to_string(),
            start_line: start,
            end_line: end,
            content,
            language,
            kind,
            metadata,
            vector: None,
        }
    }

    /// Line range reported in search results: the declaration when known,
    /// the whole chunk otherwise.
    #[must_use]
    pub fn display_range(&self) -> (u32, u32) {
        match (self.metadata.start_line, self.metadata.end_line) {
            (Some(start), Some(end)) if start <= end => (start, end),
            _ => (self.start_line, self.end_line),
        }
    }

    #[must_use]
    pub fn line_count(&self) -> u32 {
        self.end_line - self.start_line + 1
    }

    #[must_use]
    pub fn contains_line(&self, line: u32) -> bool {
        (self.start_line..=self.end_line).contains(&line)
    }
}

/// Content-derived chunk id: 128 bits of SHA-256, hex encoded.
pub fn chunk_id(file_path: &str, start: u32, end: u32, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_path.as_bytes());
    hasher.update([0]);
    hasher.update(start.to_le_bytes());
    hasher.update(end.to_le_bytes());
    hasher.update(content.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// An indexed file and the chunks it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub language: Language,
    /// Last modification, seconds since the unix epoch
    pub mtime: u64,
    pub size: u64,
    pub chunks: Vec<Chunk>,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, language: Language, mtime: u64, size: u64) -> Self {
        Self {
            path: path.into(),
            language,
            mtime,
            size,
            chunks: Vec::new(),
        }
    }

    /// Number of lines covered by the chunks.
    #[must_use]
    pub fn line_count(&self) -> u32 {
        self.chunks.iter().map(|c| c.end_line).max().unwrap_or(0)
    }

    /// Rebuild the file's lines from its chunks.
    ///
    /// Chunks cover every line of the file, so the index alone is enough to
    /// run line-oriented searches without touching the working tree.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![String::new(); self.line_count() as usize];
        for chunk in &self.chunks {
            for (offset, line) in chunk.content.split('\n').enumerate() {
                let idx = chunk.start_line as usize - 1 + offset;
                if idx < lines.len() && lines[idx].is_empty() {
                    lines[idx] = line.to_string();
                }
            }
        }
        lines
    }

    pub fn sort_chunks(&mut self) {
        self.chunks
            .sort_by(|a, b| a.start_line.cmp(&b.start_line).then(a.end_line.cmp(&b.end_line)));
    }
}
