//! Decides which files take part in indexing and labels them with a
//! language.

use crate::config::IndexingConfig;
use crate::error::{IndexError, IndexResult};
use crate::types::Language;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Component, Path};

/// File filter built from the indexing configuration.
///
/// Exclude patterns without a `/` match any single path component, so
/// `vendor` skips every `vendor/` directory and `*.min.js` every minified
/// file. Patterns containing `/` are anchored at the root.
#[derive(Debug, Clone)]
pub struct FileFilter {
    include_hidden: bool,
    languages: Option<HashSet<Language>>,
    excludes: GlobSet,
    max_file_size: u64,
}

impl FileFilter {
    pub fn new(config: &IndexingConfig) -> IndexResult<Self> {
        Self::with_extra_excludes(config, &[])
    }

    /// Filter with additional exclude patterns (e.g. from the incremental
    /// configuration).
    pub fn with_extra_excludes(config: &IndexingConfig, extra: &[String]) -> IndexResult<Self> {
        let languages = if config.file_types.is_empty() {
            None
        } else {
            let parsed = config
                .file_types
                .iter()
                .map(|ty| {
                    ty.trim()
                        .parse::<Language>()
                        .map_err(|reason| IndexError::invalid(format!("--file-types: {reason}")))
                })
                .collect::<IndexResult<HashSet<_>>>()?;
            Some(parsed)
        };

        let mut builder = GlobSetBuilder::new();
        for pattern in config.exclude_patterns.iter().chain(extra) {
            for glob in expand_pattern(pattern) {
                let glob = GlobBuilder::new(&glob)
                    .literal_separator(true)
                    .build()
                    .map_err(|e| IndexError::invalid(format!("bad exclude pattern '{pattern}': {e}")))?;
                builder.add(glob);
            }
        }
        let excludes = builder
            .build()
            .map_err(|e| IndexError::invalid(format!("bad exclude patterns: {e}")))?;

        Ok(Self {
            include_hidden: config.include_hidden,
            languages,
            excludes,
            max_file_size: config.max_file_size,
        })
    }

    pub fn include_hidden(&self) -> bool {
        self.include_hidden
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Whether a root-relative path (file or directory) is excluded by a
    /// pattern or by being hidden.
    pub fn is_excluded(&self, rel_path: &Path) -> bool {
        if !self.include_hidden && is_hidden(rel_path) {
            return true;
        }
        self.excludes.is_match(rel_path)
    }

    /// Language of a root-relative file path, or `None` if it should not be
    /// indexed.
    pub fn classify(&self, rel_path: &Path) -> Option<Language> {
        if self.is_excluded(rel_path) {
            return None;
        }
        let language = Language::from_path(rel_path)?;
        match &self.languages {
            Some(allowed) if !allowed.contains(&language) => None,
            _ => Some(language),
        }
    }

    /// `classify` plus the size limit.
    pub fn accepts(&self, rel_path: &Path, size: u64) -> Option<Language> {
        if size > self.max_file_size {
            return None;
        }
        self.classify(rel_path)
    }
}

fn expand_pattern(pattern: &str) -> Vec<String> {
    let pattern = pattern.trim().trim_end_matches('/');
    if pattern.is_empty() {
        return Vec::new();
    }
    if let Some(anchored) = pattern.strip_prefix('/') {
        return vec![anchored.to_string(), format!("{anchored}/**")];
    }
    if pattern.contains('/') {
        vec![pattern.to_string(), format!("{pattern}/**")]
    } else {
        vec![
            pattern.to_string(),
            format!("**/{pattern}"),
            format!("{pattern}/**"),
            format!("**/{pattern}/**"),
        ]
    }
}

fn is_hidden(rel_path: &Path) -> bool {
    rel_path.components().any(|component| match component {
        Component::Normal(name) => name
            .to_str()
            .is_some_and(|name| name.starts_with('.') && name.len() > 1),
        _ => false,
    })
}
