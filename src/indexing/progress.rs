//! Summary of one indexing run

use serde::Serialize;
use std::time::{Duration, Instant};

/// Maximum number of per-file errors kept in a report
const MAX_REPORTED_ERRORS: usize = 100;

/// Statistics collected during indexing
#[derive(Debug, Default, Clone, Serialize)]
pub struct IndexingReport {
    /// Files seen by the walker
    pub total_files: usize,

    /// Files indexed for the first time
    pub new_files: usize,

    /// Files re-indexed because they or a dependency changed
    pub updated_files: usize,

    /// Files removed from the index
    pub deleted_files: usize,

    /// Files left untouched
    pub unchanged_files: usize,

    /// Chunks produced by the files processed in this run
    pub chunks: usize,

    /// Whether the previous index was discarded
    pub rebuilt: bool,

    /// Legacy index entries moved into the index directory
    pub migrated_files: usize,

    /// Time elapsed during indexing
    pub elapsed: Duration,

    /// `(path, message)` for files that failed, first 100 only
    pub errors: Vec<(String, String)>,

    /// Number of files that failed, including those past the error cap
    pub files_failed: usize,

    #[serde(skip)]
    start_time: Option<Instant>,
}

impl IndexingReport {
    /// Create a report and start timing
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    /// Stop timing and record elapsed time
    pub fn stop_timing(&mut self) {
        if let Some(start) = self.start_time.take() {
            self.elapsed = start.elapsed();
        }
    }

    pub fn add_error(&mut self, path: String, error: String) {
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push((path, error));
        }
        self.files_failed += 1;
    }

    /// Whether anything in the index changed
    pub fn has_changes(&self) -> bool {
        self.new_files + self.updated_files + self.deleted_files > 0 || self.rebuilt
    }

    /// Human-readable summary, one fact per line
    pub fn summary(&self) -> String {
        let mut out = String::from("Indexing complete:\n");
        out.push_str(&format!("  Files scanned: {}\n", self.total_files));
        out.push_str(&format!("  New: {}\n", self.new_files));
        out.push_str(&format!("  Updated: {}\n", self.updated_files));
        out.push_str(&format!("  Deleted: {}\n", self.deleted_files));
        out.push_str(&format!("  Unchanged: {}\n", self.unchanged_files));
        out.push_str(&format!("  Chunks: {}\n", self.chunks));
        out.push_str(&format!("  Time elapsed: {:.2}s\n", self.elapsed.as_secs_f64()));
        if self.migrated_files > 0 {
            out.push_str(&format!("  Migrated legacy files: {}\n", self.migrated_files));
        }

        if !self.errors.is_empty() {
            out.push_str(&format!(
                "\nErrors (showing first {}):\n",
                self.errors.len().min(5)
            ));
            for (path, error) in self.errors.iter().take(5) {
                out.push_str(&format!("  {path}: {error}\n"));
            }
            if self.files_failed > 5 {
                out.push_str(&format!("  ... and {} more errors\n", self.files_failed - 5));
            }
        }
        out
    }
}
