//! Advisory lock on the index directory.
//!
//! `index` holds the lock exclusively while it rebuilds, `search` holds it
//! shared while it reads. Locks are released when the guard is dropped.

use crate::error::{IndexError, IndexResult, IoContext};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Name of the lock file inside the index directory.
pub const LOCK_FILE: &str = "lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Held lock on `<index_dir>/lock`.
#[derive(Debug)]
pub struct IndexLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl IndexLock {
    /// Take the lock without waiting; `Locked` if another process holds a
    /// conflicting one.
    pub fn acquire(index_dir: &Path, mode: LockMode) -> IndexResult<Self> {
        std::fs::create_dir_all(index_dir).with_path(index_dir, "create index directory")?;
        let path = index_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_path(&path, "open lock file")?;

        let result = match mode {
            LockMode::Shared => FileExt::try_lock_shared(&file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
        };
        match result {
            Ok(()) => Ok(Self { file, path, mode }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(IndexError::Locked {
                    path: index_dir.to_path_buf(),
                })
            }
            Err(e) => Err(IndexError::io(&path, "lock", e)),
        }
    }

    pub fn shared(index_dir: &Path) -> IndexResult<Self> {
        Self::acquire(index_dir, LockMode::Shared)
    }

    pub fn exclusive(index_dir: &Path) -> IndexResult<Self> {
        Self::acquire(index_dir, LockMode::Exclusive)
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
