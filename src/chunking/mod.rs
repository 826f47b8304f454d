//! Structural chunking of source files.
//!
//! A file is split into [`Chunk`]s with one of four strategies, picked by
//! [`Language::chunk_strategy`]:
//!
//! - Go is parsed with tree-sitter; every top-level function, method,
//!   type spec and import declaration becomes a chunk.
//! - Python is scanned for `def`/`class` headers whose block ends at the
//!   first dedent.
//! - JavaScript and TypeScript are scanned for functions, classes and
//!   variable declarations whose body ends when the brace count returns
//!   to zero.
//! - Everything else is cut into adaptive windows sized by control-flow
//!   density.
//!
//! Whatever no chunk covers ends up in non-structural chunks, so every
//! non-blank line of a file belongs to at least one chunk.

mod adaptive;
mod brace;
mod go;
mod indent;

pub use adaptive::{calc_adaptive_size, find_break_point, line_complexity};
pub use go::GoChunkError;

use crate::config::ChunkingConfig;
use crate::types::{Chunk, ChunkKind, ChunkMetadata, ChunkStrategy, Language};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Splits files into chunks according to a [`ChunkingConfig`].
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(ChunkingConfig::default())
    }
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Chunk one file. `path` is the index-relative path stored in chunks.
    ///
    /// Invalid UTF-8 is decoded lossily. Never fails: a Go file that does not
    /// parse is chunked with adaptive windows instead.
    pub fn parse(&self, path: &str, bytes: &[u8], language: Language) -> Vec<Chunk> {
        let text = String::from_utf8_lossy(bytes);
        let lines: Vec<&str> = text.lines().collect();
        if lines.iter().all(|line| line.trim().is_empty()) {
            return Vec::new();
        }

        let ctx = ChunkContext {
            path,
            lines: &lines,
            language,
            config: &self.config,
        };

        let mut chunks = match language.chunk_strategy() {
            ChunkStrategy::Syntax => match go::chunk(&ctx, &text) {
                Ok(chunks) => chunks,
                Err(e) => {
                    warn!("{path}: {e}, falling back to adaptive chunks");
                    adaptive::chunk(&ctx)
                }
            },
            ChunkStrategy::Indentation => indent::chunk(&ctx),
            ChunkStrategy::Braces => brace::chunk(&ctx),
            ChunkStrategy::Adaptive => adaptive::chunk(&ctx),
        };

        chunks.extend(uncovered_chunks(&ctx, &chunks));
        finalize(&mut chunks);
        debug!("{path}: {} lines -> {} chunks", lines.len(), chunks.len());
        chunks
    }
}

/// Per-file state shared by the strategies.
pub(crate) struct ChunkContext<'a> {
    pub path: &'a str,
    pub lines: &'a [&'a str],
    pub language: Language,
    pub config: &'a ChunkingConfig,
}

impl ChunkContext<'_> {
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Chunk for the declaration on lines `start..=end` (0-based), padded by
    /// `pad` lines on each side and clamped to the file.
    ///
    /// The metadata records the unpadded declaration bounds (1-based).
    pub fn padded(
        &self,
        start: usize,
        end: usize,
        pad: usize,
        kind: ChunkKind,
        mut metadata: ChunkMetadata,
    ) -> Chunk {
        let last = self.line_count() - 1;
        let end = end.min(last);
        let start = start.min(end);
        metadata.start_line = Some(start as u32 + 1);
        metadata.end_line = Some(end as u32 + 1);

        let from = start.saturating_sub(pad);
        let to = (end + pad).min(last);
        Chunk::from_lines(
            self.path,
            self.lines,
            from as u32 + 1,
            to as u32 + 1,
            self.language,
            kind,
            metadata,
        )
    }

    /// Unpadded chunk over lines `start..end` (0-based, exclusive end).
    pub fn span(&self, start: usize, end: usize, kind: ChunkKind, mut metadata: ChunkMetadata) -> Chunk {
        metadata.start_line = Some(start as u32 + 1);
        metadata.end_line = Some(end as u32);
        Chunk::from_lines(
            self.path,
            self.lines,
            start as u32 + 1,
            end as u32,
            self.language,
            kind,
            metadata,
        )
    }

    pub fn is_blank(&self, idx: usize) -> bool {
        self.lines[idx].trim().is_empty()
    }
}

pub(crate) fn chunk_type(name: &str) -> ChunkMetadata {
    ChunkMetadata {
        chunk_type: Some(name.to_string()),
        ..Default::default()
    }
}

/// Leading whitespace width; a tab counts as four columns.
pub(crate) fn indent_width(line: &str) -> usize {
    line.chars()
        .take_while(|c| c.is_whitespace())
        .map(|c| if c == '\t' { 4 } else { 1 })
        .sum()
}

/// Non-structural chunks for each maximal run of lines no chunk covers.
///
/// Runs made only of blank lines are skipped.
fn uncovered_chunks(ctx: &ChunkContext<'_>, chunks: &[Chunk]) -> Vec<Chunk> {
    let mut covered = vec![false; ctx.line_count()];
    for chunk in chunks {
        let from = chunk.start_line as usize - 1;
        let to = (chunk.end_line as usize).min(covered.len());
        for slot in &mut covered[from..to] {
            *slot = true;
        }
    }

    let mut extra = Vec::new();
    let mut run_start = None;
    for idx in 0..=covered.len() {
        let is_covered = covered.get(idx).copied().unwrap_or(true);
        match (run_start, is_covered) {
            (None, false) => run_start = Some(idx),
            (Some(start), true) => {
                run_start = None;
                if (start..idx).any(|i| !ctx.is_blank(i)) {
                    extra.push(ctx.span(start, idx, ChunkKind::NonStructural, chunk_type("non_structural")));
                }
            }
            _ => {}
        }
    }
    extra
}

/// Sort by position and drop chunks whose range repeats an earlier one.
fn finalize(chunks: &mut Vec<Chunk>) {
    chunks.sort_by(|a, b| {
        a.start_line
            .cmp(&b.start_line)
            .then(a.end_line.cmp(&b.end_line))
    });
    let mut seen = HashSet::new();
    chunks.retain(|chunk| seen.insert(chunk.id.clone()));
}
