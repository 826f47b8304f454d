//! Adaptive windows for languages without a structural strategy.
//!
//! Window size grows with control-flow density and every window is cut at
//! the best nearby break point (blank line, closing bracket, declaration or
//! comment) instead of at a fixed line count.

use super::{ChunkContext, chunk_type};
use crate::config::ChunkingConfig;
use crate::types::{Chunk, ChunkKind};

/// Average line complexity never exceeds this.
const MAX_COMPLEXITY: f32 = 2.0;

/// How many candidate cut positions before the nominal end are considered.
const BREAK_WINDOW: usize = 5;

const DECLARATION_PREFIXES: &[&str] = &[
    "func ", "def ", "class ", "function ", "fn ", "pub fn ", "public ", "private ",
    "protected ", "struct ", "impl ", "interface ", "module ", "sub ",
];

/// Control-flow weight of one line.
pub fn line_complexity(line: &str) -> f32 {
    let line = line.trim();
    if line.is_empty() || line.starts_with("//") || line.starts_with('#') {
        return 0.0;
    }

    let has = |words: &[&str]| words.iter().any(|w| line.contains(w));
    let mut score = 0.0;
    if has(&["if ", "else", "elif "]) {
        score += 0.2;
    }
    if has(&["for ", "while "]) {
        score += 0.3;
    }
    if has(&["try ", "try{", "catch ", "catch(", "except ", "except:"]) {
        score += 0.4;
    }
    if has(&["switch ", "case ", "match "]) {
        score += 0.3;
    }
    if has(&["async ", "await "]) {
        score += 0.2;
    }
    score += line.matches('{').count() as f32 * 0.1;
    score += line.matches('(').count() as f32 * 0.05;
    score
}

/// Window size starting at `start` (0-based).
///
/// `base × (1 + complexity × weight)`, where complexity is the mean line
/// complexity over the next `min(2·base, remaining)` lines capped at 2.0.
/// Growth is limited to `base × adaptive_size_factor`, and the result is
/// clamped to `[min_context_lines, max_chunk_size]`.
pub fn calc_adaptive_size(lines: &[&str], start: usize, config: &ChunkingConfig) -> usize {
    let base = config.base_chunk_size as f32;
    let remaining = lines.len().saturating_sub(start);
    let window = (config.base_chunk_size * 2).min(remaining);

    let complexity = if window == 0 {
        0.0
    } else {
        let total: f32 = lines[start..start + window]
            .iter()
            .map(|line| line_complexity(line))
            .sum();
        (total / window as f32).min(MAX_COMPLEXITY)
    };

    let grown = base * (1.0 + complexity * config.complexity_weight);
    let capped = grown.min(base * config.adaptive_size_factor.max(1.0));
    let upper = config.max_chunk_size.max(config.min_context_lines);
    (capped.round() as usize).clamp(config.min_context_lines.max(1), upper)
}

fn is_comment(line: &str) -> bool {
    ["//", "#", "/*", "*", "--", ";"]
        .iter()
        .any(|prefix| line.starts_with(prefix))
}

/// Best exclusive end for a window `start..nominal_end`.
///
/// Candidate cuts are the last five positions up to `nominal_end`. A cut
/// before a blank line scores 10, after a line ending in `}` or `)` 8,
/// before a declaration 6 and before a comment 4; the highest total wins,
/// later cuts winning ties. Without any scoring cut, `nominal_end` is kept.
pub fn find_break_point(lines: &[&str], start: usize, nominal_end: usize) -> usize {
    if nominal_end >= lines.len() {
        return lines.len();
    }
    if nominal_end <= start + 1 {
        return start + 1;
    }

    let first = nominal_end.saturating_sub(BREAK_WINDOW - 1).max(start + 1);
    let mut best = nominal_end;
    let mut best_score = 0;
    for cut in first..=nominal_end {
        let next = lines[cut].trim();
        let last = lines[cut - 1].trim_end();
        let mut score = 0;
        if next.is_empty() {
            score += 10;
        }
        if last.ends_with('}') || last.ends_with(')') {
            score += 8;
        }
        if DECLARATION_PREFIXES.iter().any(|p| next.starts_with(p)) {
            score += 6;
        }
        if is_comment(next) {
            score += 4;
        }
        if score > 0 && score >= best_score {
            best_score = score;
            best = cut;
        }
    }
    best
}

/// Exclusive end of the adaptive window starting at `start`, never past
/// `limit`.
pub(super) fn window_end(ctx: &ChunkContext<'_>, start: usize, limit: usize) -> usize {
    let limit = limit.min(ctx.line_count()).max(start + 1);
    let size = calc_adaptive_size(ctx.lines, start, ctx.config);
    let nominal = (start + size).min(limit);
    if nominal == limit {
        return limit;
    }
    find_break_point(ctx.lines, start, nominal)
}

/// Enhanced chunks covering the whole file, each padded by `overlap_lines`.
pub(super) fn chunk(ctx: &ChunkContext<'_>) -> Vec<Chunk> {
    let n = ctx.line_count();
    let overlap = ctx.config.overlap_lines;
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < n {
        let end = window_end(ctx, start, n);
        if (start..end).any(|idx| !ctx.is_blank(idx)) {
            let mut metadata = chunk_type("enhanced");
            metadata.adaptive_size = Some((end - start) as u32);
            let complexity: f32 = ctx.lines[start..end]
                .iter()
                .map(|line| line_complexity(line))
                .sum::<f32>()
                / (end - start) as f32;
            metadata.complexity = Some(complexity.min(MAX_COMPLEXITY));
            chunks.push(ctx.padded(start, end - 1, overlap, ChunkKind::Enhanced, metadata));
        }
        start = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Language;

    #[test]
    fn test_line_complexity() {
        assert_eq!(line_complexity(""), 0.0);
        assert_eq!(line_complexity("// if for while"), 0.0);
        let score = line_complexity("if (x) {");
        assert!((score - 0.35).abs() < 1e-6);
        let score = line_complexity("for (;;) { try {");
        assert!(score > 0.9);
    }

    #[test]
    fn test_adaptive_size_bounds() {
        let config = ChunkingConfig::default();
        let plain = vec!["x = 1"; 100];
        assert_eq!(calc_adaptive_size(&plain, 0, &config), 20);

        let busy = vec!["if (a) { for (b) { try { c() } } }"; 100];
        let size = calc_adaptive_size(&busy, 0, &config);
        assert!(size > 20);
        assert!(size <= 30);

        let tiny = ChunkingConfig {
            base_chunk_size: 1,
            ..ChunkingConfig::default()
        };
        assert_eq!(calc_adaptive_size(&plain, 0, &tiny), tiny.min_context_lines);
    }

    #[test]
    fn test_break_prefers_blank_line() {
        let mut lines = vec!["x"; 30];
        lines[18] = "";
        assert_eq!(find_break_point(&lines, 0, 20), 18);
    }

    #[test]
    fn test_break_after_closing_brace() {
        let mut lines = vec!["x"; 30];
        lines[16] = "}";
        assert_eq!(find_break_point(&lines, 0, 20), 17);
    }

    #[test]
    fn test_break_keeps_nominal_end_without_candidates() {
        let lines = vec!["x"; 30];
        assert_eq!(find_break_point(&lines, 0, 20), 20);
        assert_eq!(find_break_point(&lines, 0, 30), 30);
    }

    #[test]
    fn test_enhanced_chunks_tile_the_file() {
        let source: Vec<String> = (0..75).map(|i| format!("line {i}")).collect();
        let lines: Vec<&str> = source.iter().map(String::as_str).collect();
        let config = ChunkingConfig::default();
        let ctx = ChunkContext {
            path: "a.txt",
            lines: &lines,
            language: Language::Text,
            config: &config,
        };
        let chunks = chunk(&ctx);
        let mut next = 1;
        for c in &chunks {
            let (start, end) = c.display_range();
            assert_eq!(start, next);
            next = end + 1;
            assert_eq!(c.kind, ChunkKind::Enhanced);
        }
        assert_eq!(next, 76);
    }
}
