//! Rendering of search results for the CLI.
//!
//! Three formats: a human-readable `table`, a `json` document for tools
//! and `raw` lines (`PATH:START:END:CONTENT`) for grep-style pipelines.

use crate::search::{SearchResult, SearchResults};
use serde::Serialize;
use std::io::{self, Write};
use std::time::Duration;

/// Content lines longer than this are cut in table output.
pub const MAX_LINE_WIDTH: usize = 100;
const MAX_HIGHLIGHTS_WIDTH: usize = 80;
/// Context blocks longer than this are not printed in table output.
const MAX_CONTEXT_LEN: usize = 200;

/// Output format for `clindex search`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Raw,
}

impl OutputFormat {
    #[must_use]
    pub fn is_json(&self) -> bool {
        matches!(self, Self::Json)
    }
}

/// Body of `--format json`.
#[derive(Debug, Serialize)]
pub struct JsonResponse<'a> {
    pub query: &'a str,
    pub total_results: usize,
    pub displayed: usize,
    pub execution_time: String,
    pub has_more: bool,
    pub results: &'a [SearchResult],
}

impl<'a> JsonResponse<'a> {
    pub fn new(results: &'a SearchResults) -> Self {
        Self {
            query: &results.query,
            total_results: results.total_results,
            displayed: results.results.len(),
            execution_time: format_duration(results.execution_time),
            has_more: results.has_more,
            results: &results.results,
        }
    }
}

/// Body of `--format json` when the search failed.
#[derive(Debug, Serialize)]
pub struct JsonError<'a> {
    pub query: &'a str,
    pub error: String,
}

/// `1.234ms`, `2.5s`.
pub fn format_duration(duration: Duration) -> String {
    format!("{duration:?}")
}

/// Cut `line` to `width` characters, marking the cut with `...`.
pub fn truncate_line(line: &str, width: usize) -> String {
    if line.chars().count() <= width {
        return line.to_string();
    }
    let kept: String = line.chars().take(width.saturating_sub(3)).collect();
    format!("{kept}...")
}

pub fn write_results(out: &mut impl Write, results: &SearchResults, format: OutputFormat) -> io::Result<()> {
    match format {
        OutputFormat::Table => write_table(out, results),
        OutputFormat::Json => write_json(out, &JsonResponse::new(results)),
        OutputFormat::Raw => write_raw(out, results),
    }
}

/// Report a failed search. Only JSON output carries the error on stdout;
/// other formats leave it to the caller's `Error:` line on stderr.
pub fn write_error(out: &mut impl Write, query: &str, error: &str, format: OutputFormat) -> io::Result<()> {
    if format.is_json() {
        write_json(
            out,
            &JsonError {
                query,
                error: error.to_string(),
            },
        )?;
    }
    Ok(())
}

fn write_json(out: &mut impl Write, value: &impl Serialize) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)
}

fn write_table(out: &mut impl Write, results: &SearchResults) -> io::Result<()> {
    if results.is_empty() {
        return writeln!(out, "No results found.");
    }

    writeln!(out, "Found {} results:", results.total_results)?;
    writeln!(out)?;
    for result in &results.results {
        writeln!(
            out,
            "{}. {}:{}-{}",
            result.rank, result.file_path, result.start_line, result.end_line
        )?;
        for line in result.content.lines() {
            writeln!(out, "   {}", truncate_line(line, MAX_LINE_WIDTH))?;
        }
        if !result.highlights.is_empty() {
            let highlights = truncate_line(&result.highlights.join("; "), MAX_HIGHLIGHTS_WIDTH);
            writeln!(out, "   Highlights: {highlights}")?;
        }
        if let Some(context) = result.context.as_deref().filter(|c| c.len() < MAX_CONTEXT_LEN) {
            for line in context.lines().filter(|l| !l.trim().is_empty()) {
                writeln!(out, "   {line}")?;
            }
        }
        writeln!(
            out,
            "   Score: {:.3} | Type: {}",
            result.relevance_score, result.match_type
        )?;
        writeln!(out)?;
    }

    writeln!(out, "Search completed in {}", format_duration(results.execution_time))?;
    if results.results.len() != results.total_results {
        writeln!(
            out,
            "Showing {} of {} results",
            results.results.len(),
            results.total_results
        )?;
    }
    Ok(())
}

fn write_raw(out: &mut impl Write, results: &SearchResults) -> io::Result<()> {
    for result in &results.results {
        let content = result.content.replace('\r', "").replace('\n', "\\n");
        writeln!(
            out,
            "{}:{}:{}:{}",
            result.file_path, result.start_line, result.end_line, content
        )?;
    }
    Ok(())
}
