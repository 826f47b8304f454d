//! Persistent index storage: the versioned binary format, its memory-mapped
//! reader and the JSON metadata sidecar.

pub mod binary;
pub mod format;
pub mod metadata;
pub mod mmap;

pub use binary::{INDEX_FILE, IndexData, StoredVector, WriteOptions, read_index, write_index};
pub use format::{Compression, FormatFlags, StorageError};
pub use metadata::{IndexMetadata, IndexType, METADATA_FILE};
pub use mmap::{MmapIndexReader, Segment};

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Write `bytes` to `<path>.tmp`, fsync, then rename over `path`.
///
/// Readers either see the previous file or the complete new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err()
        && let Err(e) = fs::remove_file(&tmp)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        debug!("failed to remove {}: {e}", tmp.display());
    }
    result
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}
