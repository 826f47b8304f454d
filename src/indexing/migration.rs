//! Moving legacy index files out of the project root.
//!
//! Older layouts left their index next to the sources (`.code-search-index`,
//! `.code-index`, ...). Migration moves whatever of those exists into
//! `<index dir>/legacy/` and records what it moved in
//! `<index dir>/migration.json`. [`rollback`] puts the files back.

use crate::error::{IndexError, IndexResult, IoContext};
use crate::storage::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Legacy index files and directories, relative to the project root.
pub const LEGACY_NAMES: [&str; 5] = [
    ".code-search-index",
    ".code-search-index.db",
    ".code-search",
    ".code-index",
    ".search-index",
];

/// Directory inside the index directory that receives legacy files.
pub const LEGACY_DIR: &str = "legacy";

pub const MIGRATION_FILE: &str = "migration.json";

/// Where a project stands with respect to migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Neither an index directory nor legacy files
    None,
    /// Only legacy files
    Legacy,
    /// An index directory that was never migrated into
    Current,
    /// An index directory holding migrated legacy files
    Migrated,
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Legacy => "legacy",
            Self::Current => "current",
            Self::Migrated => "migrated",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub migrated_at: DateTime<Utc>,
    /// Names of the moved entries, relative to the project root
    pub legacy_files: Vec<String>,
    /// Total size of the moved entries
    pub bytes: u64,
}

impl MigrationRecord {
    /// The record in `index_dir`, if a migration happened there.
    pub fn load(index_dir: &Path) -> IndexResult<Option<Self>> {
        let path = index_dir.join(MIGRATION_FILE);
        let json = match std::fs::read(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(IndexError::io(&path, "read migration record", e)),
        };
        serde_json::from_slice(&json).map(Some).map_err(|e| IndexError::Corrupt {
            reason: format!("{}: {e}", path.display()),
        })
    }
}

/// Legacy entries present in `root`, in [`LEGACY_NAMES`] order.
pub fn legacy_files(root: &Path) -> Vec<PathBuf> {
    LEGACY_NAMES
        .iter()
        .map(|name| root.join(name))
        .filter(|path| path.symlink_metadata().is_ok())
        .collect()
}

/// Legacy files exist and the index directory is missing or empty.
pub fn needs_migration(root: &Path, index_dir: &Path) -> bool {
    !legacy_files(root).is_empty() && !has_content(index_dir)
}

pub fn status(root: &Path, index_dir: &Path) -> MigrationStatus {
    if has_content(index_dir) {
        if index_dir.join(MIGRATION_FILE).is_file() {
            MigrationStatus::Migrated
        } else {
            MigrationStatus::Current
        }
    } else if legacy_files(root).is_empty() {
        MigrationStatus::None
    } else {
        MigrationStatus::Legacy
    }
}

fn has_content(dir: &Path) -> bool {
    std::fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_some())
}

/// Move the legacy files of `root` into `index_dir`.
///
/// Returns `None` when there is nothing to move. An index directory that
/// already has content is refused unless `force` is set.
pub fn migrate(
    root: &Path,
    index_dir: &Path,
    force: bool,
) -> IndexResult<Option<MigrationRecord>> {
    let legacy = legacy_files(root);
    if legacy.is_empty() {
        return Ok(None);
    }
    if !force && has_content(index_dir) {
        return Err(IndexError::invalid(format!(
            "{} already has content; migrate with --force to move legacy files into it",
            index_dir.display()
        )));
    }

    let target = index_dir.join(LEGACY_DIR);
    std::fs::create_dir_all(&target).with_path(&target, "create legacy directory")?;
    let mut record = MigrationRecord {
        migrated_at: Utc::now(),
        legacy_files: Vec::with_capacity(legacy.len()),
        bytes: 0,
    };
    for path in legacy {
        let Some(name) = path.file_name() else {
            continue;
        };
        let bytes = entry_size(&path);
        let dest = target.join(name);
        std::fs::rename(&path, &dest).with_path(&path, "move legacy index file")?;
        record.legacy_files.push(name.to_string_lossy().into_owned());
        record.bytes += bytes;
    }

    let json = serde_json::to_vec_pretty(&record)
        .map_err(|e| IndexError::invalid(format!("cannot serialise migration record: {e}")))?;
    let record_path = index_dir.join(MIGRATION_FILE);
    write_atomic(&record_path, &json).with_path(&record_path, "write migration record")?;
    info!(
        files = record.legacy_files.len(),
        bytes = record.bytes,
        "migrated legacy index files"
    );
    Ok(Some(record))
}

/// Move migrated files back into `root` and forget the migration.
/// Returns the number of entries restored.
pub fn rollback(root: &Path, index_dir: &Path) -> IndexResult<usize> {
    let Some(record) = MigrationRecord::load(index_dir)? else {
        return Ok(0);
    };
    let source = index_dir.join(LEGACY_DIR);
    let mut restored = 0;
    for name in &record.legacy_files {
        let from = source.join(name);
        let to = root.join(name);
        if to.symlink_metadata().is_ok() {
            return Err(IndexError::invalid(format!(
                "{} exists; remove it before rolling back",
                to.display()
            )));
        }
        if from.symlink_metadata().is_ok() {
            std::fs::rename(&from, &to).with_path(&from, "restore legacy index file")?;
            restored += 1;
        }
    }
    let record_path = index_dir.join(MIGRATION_FILE);
    std::fs::remove_file(&record_path).with_path(&record_path, "remove migration record")?;
    if !has_content(&source) {
        std::fs::remove_dir(&source).with_path(&source, "remove legacy directory")?;
    }
    Ok(restored)
}

fn entry_size(path: &Path) -> u64 {
    let Ok(metadata) = path.symlink_metadata() else {
        return 0;
    };
    if !metadata.is_dir() {
        return metadata.len();
    }
    std::fs::read_dir(path)
        .map(|entries| entries.flatten().map(|e| entry_size(&e.path())).sum())
        .unwrap_or(0)
}
