//! File system walker for discovering source files to index
//!
//! This module provides directory traversal with support for:
//! - .gitignore rules and `.clindexignore` files
//! - Exclude patterns from configuration
//! - Language filtering
//! - Hidden file handling

use super::filter::FileFilter;
use crate::types::Language;
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::debug;

/// Name of the per-directory ignore file, gitignore syntax.
pub const IGNORE_FILE: &str = ".clindexignore";

/// A file selected for indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedFile {
    /// Root-relative path with `/` separators
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub language: Language,
    pub size: u64,
    /// Seconds since the unix epoch
    pub mtime: u64,
}

/// Walks directories to find source files to index
#[derive(Debug, Clone)]
pub struct FileWalker {
    filter: Arc<FileFilter>,
    skip_dirs: Vec<PathBuf>,
}

impl FileWalker {
    pub fn new(filter: Arc<FileFilter>) -> Self {
        Self {
            filter,
            skip_dirs: Vec::new(),
        }
    }

    /// Never descend into `dir` (used for the index directory itself).
    pub fn skip_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.skip_dirs.push(dir.into());
        self
    }

    pub fn filter(&self) -> &FileFilter {
        &self.filter
    }

    /// Walk `root` and return the accepted files sorted by relative path.
    pub fn walk(&self, root: &Path) -> Vec<WalkedFile> {
        let mut builder = WalkBuilder::new(root);
        builder
            .hidden(!self.filter.include_hidden())
            .git_ignore(true)
            .git_global(false)
            .git_exclude(true)
            .follow_links(false)
            .require_git(false);
        builder.add_custom_ignore_filename(IGNORE_FILE);

        let filter = Arc::clone(&self.filter);
        let skip_dirs = self.skip_dirs.clone();
        let walk_root = root.to_path_buf();
        builder.filter_entry(move |entry| {
            if skip_dirs.iter().any(|dir| entry.path() == dir) {
                return false;
            }
            match entry.path().strip_prefix(&walk_root) {
                Ok(rel) if !rel.as_os_str().is_empty() => !filter.is_excluded(rel),
                _ => true,
            }
        });

        let mut files: Vec<WalkedFile> = builder
            .build()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
            .filter_map(|entry| self.accept(root, entry.path()))
            .collect();
        files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        files
    }

    fn accept(&self, root: &Path, path: &Path) -> Option<WalkedFile> {
        let rel = path.strip_prefix(root).ok()?;
        let metadata = std::fs::metadata(path).ok()?;
        let size = metadata.len();
        let Some(language) = self.filter.accepts(rel, size) else {
            if size > self.filter.max_file_size() {
                debug!("skipping {} ({size} bytes exceeds limit)", rel.display());
            }
            return None;
        };
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        Some(WalkedFile {
            rel_path: relative_path_string(rel),
            abs_path: path.to_path_buf(),
            language,
            size,
            mtime,
        })
    }
}

/// `a/b/c.go` on every platform.
pub fn relative_path_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexingConfig;
    use std::fs;
    use tempfile::TempDir;

    fn walker(mutate: impl FnOnce(&mut IndexingConfig)) -> FileWalker {
        let mut config = IndexingConfig::default();
        mutate(&mut config);
        FileWalker::new(Arc::new(FileFilter::new(&config).unwrap()))
    }

    fn paths(files: &[WalkedFile]) -> Vec<&str> {
        files.iter().map(|f| f.rel_path.as_str()).collect()
    }

    #[test]
    fn test_walk_directory() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("pkg")).unwrap();
        fs::write(root.join("main.go"), "package main").unwrap();
        fs::write(root.join("pkg/util.py"), "def f(): pass").unwrap();
        fs::write(root.join("README"), "no extension").unwrap();
        fs::write(root.join("image.png"), [0u8, 1, 2]).unwrap();

        let files = walker(|_| {}).walk(root);
        assert_eq!(paths(&files), vec!["main.go", "pkg/util.py"]);
        assert_eq!(files[0].language, Language::Go);
        assert_eq!(files[0].size, 12);
    }

    #[test]
    fn test_excluded_and_hidden_directories_are_pruned() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("vendor/x")).unwrap();
        fs::create_dir_all(root.join(".cache")).unwrap();
        fs::write(root.join("vendor/x/a.go"), "package x").unwrap();
        fs::write(root.join(".cache/b.go"), "package y").unwrap();
        fs::write(root.join("c.go"), "package z").unwrap();

        assert_eq!(paths(&walker(|_| {}).walk(root)), vec!["c.go"]);
        assert_eq!(
            paths(&walker(|c| c.include_hidden = true).walk(root)),
            vec![".cache/b.go", "c.go"]
        );
    }

    #[test]
    fn test_gitignore_and_ignore_file_respected() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::write(root.join(".gitignore"), "ignored.go\n").unwrap();
        fs::write(root.join(IGNORE_FILE), "generated.go\n").unwrap();
        fs::write(root.join("ignored.go"), "package a").unwrap();
        fs::write(root.join("generated.go"), "package a").unwrap();
        fs::write(root.join("kept.go"), "package a").unwrap();

        assert_eq!(paths(&walker(|_| {}).walk(root)), vec!["kept.go"]);
    }

    #[test]
    fn test_skip_dir() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("idx")).unwrap();
        fs::write(root.join("idx/meta.json"), "{}").unwrap();
        fs::write(root.join("a.json"), "{}").unwrap();

        let files = walker(|_| {}).skip_dir(root.join("idx")).walk(root);
        assert_eq!(paths(&files), vec!["a.json"]);
    }
}
