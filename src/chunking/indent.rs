//! Indentation-scoped chunking for Python-like languages.

use super::{ChunkContext, adaptive, chunk_type, indent_width};
use crate::types::{Chunk, ChunkKind};
use regex::Regex;
use std::sync::LazyLock;

static FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:async\s+)?def\s+(\w+)\s*\(").expect("valid function regex")
});
static CLASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*class\s+(\w+)").expect("valid class regex"));

/// Scan top to bottom. A `def` or `class` header claims its whole block and
/// the scan resumes after it; other code is grouped into standalone chunks
/// that stop at the next header.
pub(super) fn chunk(ctx: &ChunkContext<'_>) -> Vec<Chunk> {
    let pad = ctx.config.min_context_lines;
    let n = ctx.line_count();
    let mut chunks = Vec::new();
    let mut i = 0;

    while i < n {
        let line = ctx.lines[i];
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            i += 1;
            continue;
        }

        if let Some(caps) = FUNCTION.captures(line) {
            let end = block_end(ctx, i);
            let mut metadata = chunk_type("function");
            metadata.function_name = Some(caps[1].to_string());
            metadata.indent_level = Some(indent_width(line) as u32);
            chunks.push(ctx.padded(i, end, pad, ChunkKind::Function, metadata));
            i = end + 1;
        } else if let Some(caps) = CLASS.captures(line) {
            let end = block_end(ctx, i);
            let mut metadata = chunk_type("class");
            metadata.class_name = Some(caps[1].to_string());
            metadata.indent_level = Some(indent_width(line) as u32);
            if let Some(methods) = method_names(ctx, i + 1, end) {
                metadata.extra.insert("methods".to_string(), methods);
            }
            chunks.push(ctx.padded(i, end, pad, ChunkKind::Class, metadata));
            i = end + 1;
        } else {
            let limit = next_header(ctx, i + 1).unwrap_or(n);
            let end = adaptive::window_end(ctx, i, limit);
            if (i..end).any(|idx| !ctx.is_blank(idx)) {
                chunks.push(ctx.span(i, end, ChunkKind::Standalone, chunk_type("standalone")));
            }
            i = end;
        }
    }
    chunks
}

/// Last line (0-based) of the block opened on `header`: the line before
/// the first later non-blank line indented no deeper than the header,
/// with trailing blank lines trimmed.
fn block_end(ctx: &ChunkContext<'_>, header: usize) -> usize {
    let base = indent_width(ctx.lines[header]);
    let mut last = header;
    for idx in header + 1..ctx.line_count() {
        if ctx.is_blank(idx) {
            continue;
        }
        if indent_width(ctx.lines[idx]) <= base {
            break;
        }
        last = idx;
    }
    last
}

fn next_header(ctx: &ChunkContext<'_>, from: usize) -> Option<usize> {
    (from..ctx.line_count())
        .find(|&idx| FUNCTION.is_match(ctx.lines[idx]) || CLASS.is_match(ctx.lines[idx]))
}

fn method_names(ctx: &ChunkContext<'_>, from: usize, to: usize) -> Option<String> {
    let names: Vec<&str> = (from..=to.min(ctx.line_count() - 1))
        .filter_map(|idx| FUNCTION.captures(ctx.lines[idx]))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    (!names.is_empty()).then(|| names.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkingConfig;
    use crate::types::Language;

    fn run(source: &str) -> Vec<Chunk> {
        let lines: Vec<&str> = source.lines().collect();
        let config = ChunkingConfig::default();
        let ctx = ChunkContext {
            path: "m.py",
            lines: &lines,
            language: Language::Python,
            config: &config,
        };
        chunk(&ctx)
    }

    #[test]
    fn test_single_line_function() {
        let chunks = run("def calc_total():\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].display_range(), (1, 1));
        assert_eq!(chunks[0].metadata.function_name.as_deref(), Some("calc_total"));
    }

    #[test]
    fn test_block_ends_at_dedent() {
        let source = "def a():\n    x = 1\n\n    return x\n\ndef b():\n    pass\n";
        let chunks = run(source);
        let functions: Vec<_> = chunks.iter().filter(|c| c.kind == ChunkKind::Function).collect();
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].display_range(), (1, 4));
        assert_eq!(functions[1].display_range(), (6, 7));
    }

    #[test]
    fn test_class_claims_methods() {
        let source = "class Repo:\n    def get(self):\n        pass\n\n    async def put(self):\n        pass\nprint('done')\n";
        let chunks = run(source);
        let class = chunks.iter().find(|c| c.kind == ChunkKind::Class).unwrap();
        assert_eq!(class.metadata.class_name.as_deref(), Some("Repo"));
        assert_eq!(class.display_range(), (1, 6));
        assert_eq!(class.metadata.extra.get("methods").map(String::as_str), Some("get,put"));
        assert!(chunks.iter().all(|c| c.kind != ChunkKind::Function));
        assert!(chunks.iter().any(|c| c.kind == ChunkKind::Standalone && c.start_line == 7));
    }

    #[test]
    fn test_standalone_stops_at_header() {
        let source = "import os\nimport sys\n\ndef main():\n    pass\n";
        let chunks = run(source);
        let standalone = chunks.iter().find(|c| c.kind == ChunkKind::Standalone).unwrap();
        assert!(standalone.end_line < 4);
    }
}
