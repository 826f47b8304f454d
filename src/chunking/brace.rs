//! Brace-balanced chunking for JavaScript and TypeScript.

use super::{ChunkContext, adaptive, chunk_type};
use crate::types::{Chunk, ChunkKind, ChunkMetadata};
use regex::Regex;
use std::sync::LazyLock;

static FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*(\w+)\s*(?:<[^>]*>)?\s*\(",
    )
    .expect("valid function regex")
});
static PROPERTY_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\w+)\s*:\s*(?:async\s+)?function\s*\(").expect("valid property regex")
});
static ARROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:export\s+)?(?:const|let|var)\s+(\w+)\s*(?::[^=]+)?=\s*(?:async\s+)?(?:function\b|\([^)]*\)\s*(?::[^=]+)?=>|\w+\s*=>)",
    )
    .expect("valid arrow regex")
});
static METHOD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:(?:public|private|protected|static|async|readonly|get|set)\s+)*(\w+)\s*(?:<[^>]*>)?\s*\([^)]*\)\s*(?::\s*[^{]+)?\{",
    )
    .expect("valid method regex")
});
static CLASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+(\w+)")
        .expect("valid class regex")
});
static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:export\s+)?(?:const|let|var)\s+(\w+)\s*(?::[^=]+)?=")
        .expect("valid variable regex")
});

/// Words that look like calls followed by a block but are not methods.
const CONTROL_WORDS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "with", "return", "function", "else",
];

enum Header {
    Function(String),
    Class(String),
    Variables,
}

fn header(line: &str) -> Option<Header> {
    let name = |re: &Regex| re.captures(line).map(|caps| caps[1].to_string());

    if let Some(name) = name(&FUNCTION)
        .or_else(|| name(&PROPERTY_FUNCTION))
        .or_else(|| name(&ARROW))
    {
        return Some(Header::Function(name));
    }
    if let Some(name) = name(&CLASS) {
        return Some(Header::Class(name));
    }
    if VARIABLE.is_match(line) {
        return Some(Header::Variables);
    }
    name(&METHOD)
        .filter(|name| !CONTROL_WORDS.contains(&name.as_str()))
        .map(Header::Function)
}

/// Scan top to bottom. Functions and classes claim lines up to their
/// closing brace, consecutive variable declarations are grouped, and
/// anything else becomes a standalone chunk that stops at the next header.
pub(super) fn chunk(ctx: &ChunkContext<'_>) -> Vec<Chunk> {
    let config = ctx.config;
    let n = ctx.line_count();
    let mut chunks = Vec::new();
    let mut i = 0;

    while i < n {
        let line = ctx.lines[i];
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("//") || trimmed.starts_with("/*") {
            i += 1;
            continue;
        }

        match header(line) {
            Some(Header::Function(name)) => {
                let end = body_end(ctx, i);
                let metadata = ChunkMetadata {
                    function_name: Some(name),
                    ..chunk_type("function")
                };
                chunks.push(ctx.padded(i, end, config.min_context_lines, ChunkKind::Function, metadata));
                i = end + 1;
            }
            Some(Header::Class(name)) => {
                let end = body_end(ctx, i);
                let metadata = ChunkMetadata {
                    class_name: Some(name),
                    ..chunk_type("class")
                };
                chunks.push(ctx.padded(i, end, config.min_context_lines, ChunkKind::Class, metadata));
                i = end + 1;
            }
            Some(Header::Variables) => {
                let end = variable_group_end(ctx, i);
                chunks.push(ctx.padded(
                    i,
                    end,
                    config.overlap_lines,
                    ChunkKind::Variables,
                    chunk_type("variables"),
                ));
                i = end + 1;
            }
            None => {
                let limit = (i + 1..n)
                    .find(|&idx| header(ctx.lines[idx]).is_some())
                    .unwrap_or(n);
                let end = adaptive::window_end(ctx, i, limit);
                if (i..end).any(|idx| !ctx.is_blank(idx)) {
                    chunks.push(ctx.span(i, end, ChunkKind::Standalone, chunk_type("standalone")));
                }
                i = end;
            }
        }
    }
    chunks
}

/// Last line (0-based) of the statement starting at `start`.
///
/// Once a `{` has been seen, the statement ends on the line where the
/// running brace count returns to zero. If a line ends with `;` before any
/// brace opens, the statement ends there.
pub(super) fn body_end(ctx: &ChunkContext<'_>, start: usize) -> usize {
    let mut depth: i64 = 0;
    let mut entered = false;
    for idx in start..ctx.line_count() {
        let line = ctx.lines[idx];
        for c in line.chars() {
            match c {
                '{' => {
                    depth += 1;
                    entered = true;
                }
                '}' => depth -= 1,
                _ => {}
            }
        }
        if entered && depth <= 0 {
            return idx;
        }
        if !entered && line.trim_end().ends_with(';') {
            return idx;
        }
    }
    if entered { ctx.line_count() - 1 } else { start }
}

/// Group consecutive variable declarations; blank lines between them are
/// absorbed, each declaration extends to its own closing brace.
fn variable_group_end(ctx: &ChunkContext<'_>, start: usize) -> usize {
    let mut end = body_end(ctx, start);
    let mut idx = end + 1;
    while idx < ctx.line_count() {
        if ctx.is_blank(idx) {
            idx += 1;
            continue;
        }
        if !matches!(header(ctx.lines[idx]), Some(Header::Variables)) {
            break;
        }
        end = body_end(ctx, idx);
        idx = end + 1;
    }
    end
}
