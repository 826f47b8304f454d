//! Read-only memory-mapped access to `index.bin`.
//!
//! The file is mapped once; vector, file and chunk segments are plain byte
//! ranges of the mapping whose extents come from the IndexHeader. Files
//! with a gzip payload cannot be used in place and are inflated into a heap
//! buffer with identical segment semantics.
//!
//! # Lifetime
//! Segment slices borrow the reader, and [`MmapIndexReader::close`] consumes
//! it, so a slice can never outlive the mapping.

use crate::error::{IndexError, IndexResult, IoContext};
use crate::storage::binary::{IndexData, Sections, decode_layout, resolve_layout, sections};
use crate::storage::format::FileHeader;
use crate::storage::metadata::IndexMetadata;
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Logical segments of the index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Vectors,
    Files,
    Chunks,
    Metadata,
}

enum Backing {
    Mapped(Mmap),
    Heap(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Mapped(mmap) => &mmap[..],
            Self::Heap(buf) => buf,
        }
    }
}

/// Read-only view over an on-disk index.
pub struct MmapIndexReader {
    path: PathBuf,
    backing: Backing,
    header: FileHeader,
    sections: Sections,
}

impl MmapIndexReader {
    /// Map `path` and validate its header.
    ///
    /// Segments listed in `prefetch` are advised `WillNeed`; the whole
    /// mapping is advised `Random`. Advice failures are not fatal.
    pub fn open(path: &Path, prefetch: &[Segment]) -> IndexResult<Self> {
        if !path.exists() {
            return Err(IndexError::not_found("index", path.display().to_string()));
        }
        let file = File::open(path).with_path(path, "open index")?;
        let len = file.metadata().with_path(path, "stat index")?.len();
        if len == 0 {
            return Err(IndexError::corrupt(format!("{} is empty", path.display())));
        }

        // SAFETY: the mapping is read-only and the writer replaces the file by
        // rename, so the mapped inode is never modified in place.
        let mmap = unsafe { MmapOptions::new().map(&file) }.with_path(path, "map index")?;

        let (header, inflated) = resolve_layout(&mmap)?;
        let backing = match inflated {
            Some(buf) => Backing::Heap(buf),
            None => Backing::Mapped(mmap),
        };
        let sections = sections(&header, backing.bytes())?;

        let reader = Self {
            path: path.to_path_buf(),
            backing,
            header,
            sections,
        };
        reader.advise(prefetch);
        debug!(
            path = %path.display(),
            mapped = reader.is_mapped(),
            vectors = reader.sections.index.vector_count,
            files = reader.sections.index.file_count,
            chunks = reader.sections.index.chunk_count,
            "opened index"
        );
        Ok(reader)
    }

    #[cfg(unix)]
    fn advise(&self, prefetch: &[Segment]) {
        use memmap2::Advice;

        let Backing::Mapped(mmap) = &self.backing else {
            return;
        };
        if let Err(e) = mmap.advise(Advice::Random) {
            debug!("madvise(random) failed: {e}");
        }
        for &segment in prefetch {
            let (start, end) = self.extent(segment);
            if end > start
                && let Err(e) = mmap.advise_range(Advice::WillNeed, start, end - start)
            {
                debug!("madvise(willneed) for {segment:?} failed: {e}");
            }
        }
    }

    #[cfg(not(unix))]
    fn advise(&self, _prefetch: &[Segment]) {}

    fn extent(&self, segment: Segment) -> (usize, usize) {
        match segment {
            Segment::Vectors => self.sections.vectors,
            Segment::Files => self.sections.files,
            Segment::Chunks => self.sections.chunks,
            Segment::Metadata => self.sections.metadata,
        }
    }

    /// Raw bytes of one segment.
    pub fn segment(&self, segment: Segment) -> &[u8] {
        let (start, end) = self.extent(segment);
        &self.backing.bytes()[start..end]
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn counts(&self) -> (u64, u64, u64) {
        let index = &self.sections.index;
        (index.vector_count, index.file_count, index.chunk_count)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether segments are served from the mapping rather than a heap copy.
    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    /// Decode only the trailing metadata section.
    pub fn metadata(&self) -> IndexResult<IndexMetadata> {
        serde_json::from_slice(self.segment(Segment::Metadata))
            .map_err(|e| IndexError::corrupt(format!("invalid metadata section: {e}")))
    }

    /// Decode the whole index.
    pub fn decode(&self) -> IndexResult<IndexData> {
        decode_layout(&self.header, self.backing.bytes())
    }

    /// Read-only mappings cannot follow a rebuilt file; reopen instead.
    pub fn remap(&mut self) -> IndexResult<()> {
        Err(IndexError::invalid(format!(
            "cannot remap read-only index {}; reopen it",
            self.path.display()
        )))
    }

    /// Unmap and close the file.
    pub fn close(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::binary::{StoredVector, WriteOptions, write_index};
    use crate::storage::format::Compression;
    use crate::storage::metadata::IndexType;
    use crate::types::{Chunk, ChunkKind, ChunkMetadata, FileEntry, Language};
    use crate::vector::VectorMetadata;
    use tempfile::TempDir;

    fn write_sample(dir: &Path, compression: Compression) -> PathBuf {
        let lines = vec!["const a = 1;", "const b = 2;"];
        let chunk = Chunk::from_lines(
            "a.js",
            &lines,
            1,
            2,
            Language::JavaScript,
            ChunkKind::Variables,
            ChunkMetadata::default(),
        );
        let mut file = FileEntry::new("a.js", Language::JavaScript, 1, 25);
        let vector = StoredVector {
            id: chunk.id.clone(),
            vector: vec![1.0, 0.0],
            metadata: VectorMetadata {
                file_path: "a.js".to_string(),
                start_line: 1,
                end_line: 2,
                content: chunk.content.clone(),
                language: Language::JavaScript,
                kind: ChunkKind::Variables,
                chunk: ChunkMetadata::default(),
            },
        };
        file.chunks.push(chunk);
        let data = IndexData {
            files: vec![file],
            vectors: vec![vector],
            metadata: IndexMetadata::new("hashing-v1", 2, IndexType::Flat),
        };
        let path = dir.join("index.bin");
        write_index(
            &path,
            &data,
            WriteOptions {
                compression,
                quantize: false,
            },
        )
        .unwrap();
        path
    }

    #[test]
    fn test_open_plain_is_mapped() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(dir.path(), Compression::None);
        let reader = MmapIndexReader::open(&path, &[Segment::Vectors]).unwrap();
        assert!(reader.is_mapped());
        assert_eq!(reader.counts(), (1, 1, 1));
        assert!(!reader.segment(Segment::Vectors).is_empty());
        assert_eq!(reader.metadata().unwrap().model_name, "hashing-v1");
        let data = reader.decode().unwrap();
        assert_eq!(data.files[0].path, "a.js");
        reader.close();
    }

    #[test]
    fn test_gzip_falls_back_to_heap() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(dir.path(), Compression::Gzip);
        let reader = MmapIndexReader::open(&path, &[Segment::Chunks]).unwrap();
        assert!(!reader.is_mapped());
        assert_eq!(reader.decode().unwrap().files.len(), 1);
    }

    #[test]
    fn test_remap_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_sample(dir.path(), Compression::None);
        let mut reader = MmapIndexReader::open(&path, &[]).unwrap();
        assert!(matches!(
            reader.remap(),
            Err(IndexError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = MmapIndexReader::open(&dir.path().join("index.bin"), &[]).err().unwrap();
        assert_eq!(err.status_code(), "NOT_FOUND");
    }

    #[test]
    fn test_empty_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.bin");
        std::fs::write(&path, b"").unwrap();
        let err = MmapIndexReader::open(&path, &[]).err().unwrap();
        assert!(matches!(err, IndexError::Corrupt { .. }));
    }
}
