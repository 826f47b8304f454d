//! Finding the project a directory belongs to.
//!
//! Walking up from the start directory, the first directory that already
//! holds an index wins. Without one, the start directory is the root when
//! it carries `.git` or a build marker; otherwise the nearest ancestor with
//! `.git`, then the nearest ancestor with a build marker. A tree with none
//! of these is its own root.

use crate::error::{IndexError, IndexResult, IoContext};
use crate::storage::METADATA_FILE;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Version control marker; a directory or, in worktrees, a file.
pub const VCS_MARKER: &str = ".git";

/// Files that mark the root of a build.
pub const PROJECT_MARKERS: [&str; 10] = [
    "go.mod",
    "package.json",
    "setup.py",
    "pyproject.toml",
    "Cargo.toml",
    "pom.xml",
    "build.gradle",
    "Makefile",
    "CMakeLists.txt",
    ".project",
];

#[derive(Debug, Clone)]
pub struct ProjectDetector {
    /// Index directory, relative to a project root
    index_dir: PathBuf,
    /// Ancestors above this directory are never considered
    ceiling: Option<PathBuf>,
}

impl ProjectDetector {
    pub fn new(index_dir: impl Into<PathBuf>) -> Self {
        Self {
            index_dir: index_dir.into(),
            ceiling: None,
        }
    }

    /// Stop the upward walk at `ceiling`.
    #[cfg(test)]
    fn with_ceiling(mut self, ceiling: impl Into<PathBuf>) -> Self {
        self.ceiling = Some(ceiling.into());
        self
    }

    /// Project root for `start`, as an absolute path.
    pub fn detect(&self, start: &Path) -> IndexResult<PathBuf> {
        let start = std::path::absolute(start).with_path(start, "resolve path")?;
        if !start.is_dir() {
            return Err(IndexError::not_found("directory", start.display().to_string()));
        }

        let candidates = self.candidates(&start);
        let root = candidates
            .iter()
            .find(|dir| self.has_index(dir))
            .or_else(|| (has_vcs(&start) || has_build_marker(&start)).then_some(&start))
            .or_else(|| candidates.iter().find(|dir| has_vcs(dir)))
            .or_else(|| candidates.iter().find(|dir| has_build_marker(dir)))
            .unwrap_or(&start)
            .clone();
        debug!(start = %start.display(), root = %root.display(), "detected project root");
        Ok(root)
    }

    /// `start` and its ancestors, nearest first, up to the ceiling.
    fn candidates(&self, start: &Path) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        for dir in start.ancestors() {
            dirs.push(dir.to_path_buf());
            if self.ceiling.as_deref() == Some(dir) {
                break;
            }
        }
        dirs
    }

    fn has_index(&self, dir: &Path) -> bool {
        !self.index_dir.is_absolute() && dir.join(&self.index_dir).join(METADATA_FILE).is_file()
    }
}

fn has_vcs(dir: &Path) -> bool {
    dir.join(VCS_MARKER).exists()
}

fn has_build_marker(dir: &Path) -> bool {
    PROJECT_MARKERS.iter().any(|marker| dir.join(marker).is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn tree(dirs: &[&str], files: &[&str]) -> TempDir {
        let temp = TempDir::new().unwrap();
        for dir in dirs {
            fs::create_dir_all(temp.path().join(dir)).unwrap();
        }
        for file in files {
            let path = temp.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "").unwrap();
        }
        temp
    }

    fn detect(temp: &TempDir, start: &str) -> PathBuf {
        ProjectDetector::new(".clindex")
            .with_ceiling(temp.path())
            .detect(&temp.path().join(start))
            .unwrap()
    }

    #[test]
    fn test_plain_directory_is_its_own_root() {
        let temp = tree(&["a/b"], &[]);
        assert_eq!(detect(&temp, "a/b"), temp.path().join("a/b"));
    }

    #[test]
    fn test_git_ancestor_wins_over_build_marker() {
        let temp = tree(&[".git", "svc/internal"], &["svc/go.mod"]);
        assert_eq!(detect(&temp, "svc/internal"), temp.path());
    }

    #[test]
    fn test_marked_start_is_the_root() {
        let temp = tree(&[".git", "web/src"], &["web/package.json"]);
        assert_eq!(detect(&temp, "web"), temp.path().join("web"));
    }

    #[test]
    fn test_build_marker_without_git() {
        let temp = tree(&["lib/pkg/deep"], &["lib/pyproject.toml"]);
        assert_eq!(detect(&temp, "lib/pkg/deep"), temp.path().join("lib"));
    }

    #[test]
    fn test_git_file_counts() {
        let temp = tree(&["src"], &[".git"]);
        assert_eq!(detect(&temp, "src"), temp.path());
    }

    #[test]
    fn test_existing_index_wins() {
        let temp = tree(
            &[".git", "svc/internal"],
            &["svc/go.mod", "svc/.clindex/metadata.json"],
        );
        assert_eq!(detect(&temp, "svc/internal"), temp.path().join("svc"));

        // An index directory without metadata is not an index.
        let temp = tree(&[".git", "svc/.clindex", "svc/internal"], &[]);
        assert_eq!(detect(&temp, "svc/internal"), temp.path());
    }

    #[test]
    fn test_ceiling_stops_the_walk() {
        let temp = tree(&[".git", "outer/inner"], &[]);
        let root = ProjectDetector::new(".clindex")
            .with_ceiling(temp.path().join("outer"))
            .detect(&temp.path().join("outer/inner"))
            .unwrap();
        assert_eq!(root, temp.path().join("outer/inner"));
    }

    #[test]
    fn test_missing_start_is_not_found() {
        let temp = TempDir::new().unwrap();
        let result = ProjectDetector::new(".clindex").detect(&temp.path().join("missing"));
        assert!(matches!(result, Err(IndexError::NotFound { .. })));
    }
}
