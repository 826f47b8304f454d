//! Serialisation of a whole index into the `index.bin` layout.
//!
//! See [`super::format`] for the byte layout. Writing is atomic: the file is
//! built in memory, written to `index.bin.tmp`, fsynced and renamed over the
//! destination. Reading accepts plain files, files whose payload is gzip
//! wrapped (compression byte = 1) and files gzip-compressed as a whole.

use crate::error::{IndexError, IndexResult, IoContext};
use crate::storage::format::{
    ByteReader, Compression, FILE_HEADER_SIZE, FORMAT_VERSION, FileHeader, FormatFlags,
    INDEX_HEADER_SIZE, IndexHeader, MAGIC, NO_VECTOR, SECTIONS_START, StorageError,
    decode_vector, encode_quantized, encode_vector,
};
use crate::storage::metadata::IndexMetadata;
use crate::storage::write_atomic;
use crate::types::{Chunk, ChunkKind, ChunkMetadata, FileEntry, Language, chunk_id};
use crate::vector::VectorMetadata;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use tracing::debug;

/// File name of the binary index inside the index directory.
pub const INDEX_FILE: &str = "index.bin";

/// A vector as stored in the vector section.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVector {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: VectorMetadata,
}

/// Everything `index.bin` holds, decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexData {
    /// Files in path order, each with its chunks sorted by start line
    pub files: Vec<FileEntry>,
    pub vectors: Vec<StoredVector>,
    pub metadata: IndexMetadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub compression: Compression,
    pub quantize: bool,
}

/// Serialise `data` into the on-disk byte layout.
pub fn encode(data: &IndexData, options: WriteOptions) -> IndexResult<Vec<u8>> {
    if !options.compression.is_supported() {
        return Err(IndexError::invalid(format!(
            "compression {:?} is not supported for writing",
            options.compression
        )));
    }

    let mut vectors = Vec::new();
    let mut vector_ids: HashMap<&str, u32> = HashMap::with_capacity(data.vectors.len());
    for (i, stored) in data.vectors.iter().enumerate() {
        let meta = serde_json::to_vec(&stored.metadata)
            .map_err(|e| IndexError::invalid(format!("cannot serialise vector metadata: {e}")))?;
        let mut vec_bytes = Vec::with_capacity(stored.vector.len() * 4);
        if options.quantize {
            encode_quantized(&mut vec_bytes, &stored.vector);
        } else {
            encode_vector(&mut vec_bytes, &stored.vector);
        }
        vectors.extend_from_slice(&len_u16(stored.id.len(), "vector id")?.to_le_bytes());
        vectors.extend_from_slice(&(vec_bytes.len() as u32).to_le_bytes());
        vectors.extend_from_slice(&(meta.len() as u32).to_le_bytes());
        vectors.extend_from_slice(stored.id.as_bytes());
        vectors.extend_from_slice(&vec_bytes);
        vectors.extend_from_slice(&meta);
        vector_ids.insert(stored.id.as_str(), i as u32);
    }

    let mut files = Vec::new();
    let mut chunks = Vec::new();
    let mut chunk_index: u32 = 0;
    for (file_id, entry) in data.files.iter().enumerate() {
        let lang = entry.language.as_str();
        files.extend_from_slice(&len_u16(entry.path.len(), "file path")?.to_le_bytes());
        files.push(lang.len() as u8);
        files.extend_from_slice(&(entry.chunks.len() as u32).to_le_bytes());
        files.extend_from_slice(&entry.mtime.to_le_bytes());
        files.extend_from_slice(&entry.size.to_le_bytes());
        files.extend_from_slice(entry.path.as_bytes());
        files.extend_from_slice(lang.as_bytes());

        for chunk in &entry.chunks {
            files.extend_from_slice(&chunk_index.to_le_bytes());
            chunk_index += 1;

            let vector_id = vector_ids
                .get(chunk.id.as_str())
                .copied()
                .unwrap_or(NO_VECTOR);
            // Only embedded chunks can be restored from their vector metadata.
            if vector_id == NO_VECTOR && chunk.content.len() > u16::MAX as usize {
                return Err(IndexError::invalid(format!(
                    "chunk {}:{}-{} has no vector and more than 65535 bytes of content",
                    entry.path, chunk.start_line, chunk.end_line
                )));
            }
            let content = truncate_at_char_boundary(&chunk.content, u16::MAX as usize);
            chunks.extend_from_slice(&vector_id.to_le_bytes());
            chunks.extend_from_slice(&(file_id as u32).to_le_bytes());
            chunks.extend_from_slice(&chunk.start_line.to_le_bytes());
            chunks.extend_from_slice(&chunk.end_line.to_le_bytes());
            chunks.extend_from_slice(&(content.len() as u16).to_le_bytes());
            chunks.extend_from_slice(content.as_bytes());
        }
    }

    let metadata = serde_json::to_vec(&data.metadata)
        .map_err(|e| IndexError::invalid(format!("cannot serialise index metadata: {e}")))?;

    let vector_offset = SECTIONS_START as u64;
    let file_offset = vector_offset + vectors.len() as u64;
    let chunk_offset = file_offset + files.len() as u64;
    let index_header = IndexHeader {
        vector_count: data.vectors.len() as u64,
        file_count: data.files.len() as u64,
        chunk_count: u64::from(chunk_index),
        vector_offset,
        file_offset,
        chunk_offset,
    };

    let index_size = INDEX_HEADER_SIZE + vectors.len() + files.len() + chunks.len();
    let mut payload = Vec::with_capacity(index_size + metadata.len());
    payload.extend_from_slice(&index_header.to_bytes());
    payload.extend_from_slice(&vectors);
    payload.extend_from_slice(&files);
    payload.extend_from_slice(&chunks);
    payload.extend_from_slice(&metadata);

    let stored = match options.compression {
        Compression::Gzip => gzip(&payload)?,
        _ => payload,
    };

    let mut flags = FormatFlags::empty();
    flags.set(FormatFlags::QUANTIZED, options.quantize);
    let header = FileHeader {
        magic: MAGIC,
        version: FORMAT_VERSION,
        flags,
        compression: options.compression,
        index_size: index_size as u64,
        metadata_size: metadata.len() as u64,
        checksum: crc32fast::hash(&stored),
    };

    let mut out = Vec::with_capacity(FILE_HEADER_SIZE + stored.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&stored);
    Ok(out)
}

/// Serialise and atomically write `data` to `path`.
pub fn write_index(path: &Path, data: &IndexData, options: WriteOptions) -> IndexResult<()> {
    let bytes = encode(data, options)?;
    write_atomic(path, &bytes).with_path(path, "write index")?;
    debug!(
        path = %path.display(),
        bytes = bytes.len(),
        files = data.files.len(),
        vectors = data.vectors.len(),
        "wrote binary index"
    );
    Ok(())
}

/// Read and decode `index.bin` through the memory-mapped reader.
pub fn read_index(path: &Path) -> IndexResult<IndexData> {
    let reader = crate::storage::MmapIndexReader::open(path, &[])?;
    let data = reader.decode()?;
    reader.close();
    Ok(data)
}

/// Validate the header of `raw` and produce the uncompressed layout.
///
/// Returns `None` when `raw` already is the uncompressed layout, so callers
/// can keep using the mapping without copying.
pub fn resolve_layout(raw: &[u8]) -> Result<(FileHeader, Option<Vec<u8>>), StorageError> {
    let (header, unwrapped) = match FileHeader::parse(raw) {
        Ok(header) => (header, None),
        Err(first) => {
            // Whole-file gzip: the first bytes are the gzip magic, not ours.
            let Ok(inner) = gunzip(raw) else {
                return Err(first);
            };
            let header = FileHeader::parse(&inner)?;
            (header, Some(inner))
        }
    };

    let bytes = unwrapped.as_deref().unwrap_or(raw);
    if bytes.len() < FILE_HEADER_SIZE {
        return Err(StorageError::Truncated {
            section: "file header",
            offset: 0,
            needed: FILE_HEADER_SIZE,
        });
    }
    if header.checksum != 0 {
        let actual = crc32fast::hash(&bytes[FILE_HEADER_SIZE..]);
        if actual != header.checksum {
            return Err(StorageError::ChecksumMismatch {
                expected: header.checksum,
                actual,
            });
        }
    }

    let layout = match header.compression {
        Compression::Gzip => {
            let payload = gunzip(&bytes[FILE_HEADER_SIZE..])?;
            let mut full = Vec::with_capacity(FILE_HEADER_SIZE + payload.len());
            full.extend_from_slice(&bytes[..FILE_HEADER_SIZE]);
            full.extend_from_slice(&payload);
            Some(full)
        }
        _ => unwrapped,
    };

    let len = layout.as_ref().map_or(raw.len(), Vec::len);
    if len != header.uncompressed_len() {
        return Err(StorageError::Invalid {
            what: "file length",
            reason: format!(
                "header describes {} bytes, found {len}",
                header.uncompressed_len()
            ),
        });
    }
    Ok((header, layout))
}

/// Section extents of an uncompressed layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sections {
    pub index: IndexHeader,
    pub vectors: (usize, usize),
    pub files: (usize, usize),
    pub chunks: (usize, usize),
    pub metadata: (usize, usize),
}

/// Read the IndexHeader and compute section extents.
pub fn sections(header: &FileHeader, layout: &[u8]) -> Result<Sections, StorageError> {
    let index_end = FILE_HEADER_SIZE + header.index_size as usize;
    if layout.len() < SECTIONS_START || index_end > layout.len() {
        return Err(StorageError::Truncated {
            section: "index header",
            offset: FILE_HEADER_SIZE,
            needed: INDEX_HEADER_SIZE,
        });
    }
    let index = IndexHeader::parse(&layout[FILE_HEADER_SIZE..SECTIONS_START])?;
    index.validate(index_end)?;
    Ok(Sections {
        index,
        vectors: (index.vector_offset as usize, index.file_offset as usize),
        files: (index.file_offset as usize, index.chunk_offset as usize),
        chunks: (index.chunk_offset as usize, index_end),
        metadata: (index_end, layout.len()),
    })
}

struct ChunkRecord {
    vector_id: u32,
    file_id: u32,
    start_line: u32,
    end_line: u32,
    content: String,
}

/// Decode an uncompressed layout.
pub fn decode_layout(header: &FileHeader, layout: &[u8]) -> IndexResult<IndexData> {
    let sections = sections(header, layout)?;
    let quantized = header.flags.contains(FormatFlags::QUANTIZED);

    let metadata: IndexMetadata =
        serde_json::from_slice(&layout[sections.metadata.0..sections.metadata.1])
            .map_err(|e| IndexError::corrupt(format!("invalid metadata section: {e}")))?;

    let vectors = decode_vectors(
        &layout[sections.vectors.0..sections.vectors.1],
        sections.index.vector_count,
        quantized,
    )?;
    let records = decode_chunks(
        &layout[sections.chunks.0..sections.chunks.1],
        sections.index.chunk_count,
    )?;

    let mut reader = ByteReader::new(&layout[sections.files.0..sections.files.1], "file section");
    let mut files = Vec::with_capacity(sections.index.file_count as usize);
    for file_id in 0..sections.index.file_count {
        let path_len = reader.u16()? as usize;
        let lang_len = reader.u8()? as usize;
        let chunk_count = reader.u32()? as usize;
        let mtime = reader.u64()?;
        let size = reader.u64()?;
        let path = reader.string(path_len, "file path")?;
        let lang_name = reader.string(lang_len, "language")?;
        let language: Language = lang_name
            .parse()
            .map_err(|reason| StorageError::Invalid {
                what: "language",
                reason,
            })?;

        let mut entry = FileEntry::new(path, language, mtime, size);
        for _ in 0..chunk_count {
            let chunk_idx = reader.u32()? as usize;
            let record = records.get(chunk_idx).ok_or_else(|| {
                IndexError::corrupt(format!("file references missing chunk {chunk_idx}"))
            })?;
            if u64::from(record.file_id) != file_id {
                return Err(IndexError::corrupt(format!(
                    "chunk {chunk_idx} belongs to file {} but is listed under file {file_id}",
                    record.file_id
                )));
            }
            entry.chunks.push(rebuild_chunk(&entry, record, &vectors)?);
        }
        entry.sort_chunks();
        files.push(entry);
    }

    Ok(IndexData {
        files,
        vectors,
        metadata,
    })
}

/// Decode a complete file image (any supported compression).
pub fn decode(raw: &[u8]) -> IndexResult<IndexData> {
    let (header, owned) = resolve_layout(raw)?;
    decode_layout(&header, owned.as_deref().unwrap_or(raw))
}

fn decode_vectors(
    section: &[u8],
    count: u64,
    quantized: bool,
) -> Result<Vec<StoredVector>, StorageError> {
    let mut reader = ByteReader::new(section, "vector section");
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id_len = reader.u16()? as usize;
        let vec_bytes = reader.u32()? as usize;
        let meta_bytes = reader.u32()? as usize;
        let id = reader.string(id_len, "vector id")?;
        let vector = decode_vector(reader.bytes(vec_bytes)?, quantized)?;
        let metadata: VectorMetadata =
            serde_json::from_slice(reader.bytes(meta_bytes)?).map_err(|e| {
                StorageError::Invalid {
                    what: "vector metadata",
                    reason: e.to_string(),
                }
            })?;
        out.push(StoredVector {
            id,
            vector,
            metadata,
        });
    }
    Ok(out)
}

fn decode_chunks(section: &[u8], count: u64) -> Result<Vec<ChunkRecord>, StorageError> {
    let mut reader = ByteReader::new(section, "chunk section");
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let vector_id = reader.u32()?;
        let file_id = reader.u32()?;
        let start_line = reader.u32()?;
        let end_line = reader.u32()?;
        let content_len = reader.u16()? as usize;
        let content = reader.string(content_len, "chunk content")?;
        if start_line == 0 || start_line > end_line {
            return Err(StorageError::Invalid {
                what: "chunk range",
                reason: format!("{start_line}-{end_line}"),
            });
        }
        out.push(ChunkRecord {
            vector_id,
            file_id,
            start_line,
            end_line,
            content,
        });
    }
    Ok(out)
}

fn rebuild_chunk(
    entry: &FileEntry,
    record: &ChunkRecord,
    vectors: &[StoredVector],
) -> IndexResult<Chunk> {
    if record.vector_id == NO_VECTOR {
        return Ok(Chunk {
            id: chunk_id(&entry.path, record.start_line, record.end_line, &record.content),
            file_path: entry.path.clone(),
            start_line: record.start_line,
            end_line: record.end_line,
            content: record.content.clone(),
            language: entry.language,
            kind: ChunkKind::NonStructural,
            metadata: ChunkMetadata::default(),
            vector: None,
        });
    }

    let stored = vectors.get(record.vector_id as usize).ok_or_else(|| {
        IndexError::corrupt(format!("chunk references missing vector {}", record.vector_id))
    })?;
    // The chunk section truncates long content; the vector metadata keeps it whole.
    let content = if stored.metadata.content.len() > record.content.len()
        && stored.metadata.content.starts_with(&record.content)
    {
        stored.metadata.content.clone()
    } else {
        record.content.clone()
    };
    Ok(Chunk {
        id: stored.id.clone(),
        file_path: entry.path.clone(),
        start_line: record.start_line,
        end_line: record.end_line,
        content,
        language: stored.metadata.language,
        kind: stored.metadata.kind,
        metadata: stored.metadata.chunk.clone(),
        vector: None,
    })
}

fn len_u16(len: usize, what: &str) -> IndexResult<u16> {
    u16::try_from(len).map_err(|_| IndexError::invalid(format!("{what} longer than 65535 bytes")))
}

fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn gzip(bytes: &[u8]) -> IndexResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(bytes)
        .and_then(|()| encoder.finish())
        .map_err(|e| IndexError::corrupt(format!("gzip compression failed: {e}")))
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, StorageError> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| StorageError::Decompress(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::metadata::IndexType;

    fn sample() -> IndexData {
        let lines = vec![
            "package main",
            "func calculateTax(amount float64) float64 { return amount * 0.08 }",
        ];
        let chunk = Chunk::from_lines(
            "f.go",
            &lines,
            1,
            2,
            Language::Go,
            ChunkKind::Function,
            ChunkMetadata {
                function_name: Some("calculateTax".to_string()),
                start_line: Some(2),
                end_line: Some(2),
                ..Default::default()
            },
        );
        let vector = StoredVector {
            id: chunk.id.clone(),
            vector: vec![0.6, 0.8, 0.0],
            metadata: VectorMetadata {
                file_path: "f.go".to_string(),
                start_line: 1,
                end_line: 2,
                content: chunk.content.clone(),
                language: Language::Go,
                kind: ChunkKind::Function,
                chunk: chunk.metadata.clone(),
            },
        };
        let mut file = FileEntry::new("f.go", Language::Go, 1_700_000_000, 80);
        file.chunks.push(chunk);
        let mut metadata = IndexMetadata::new("hashing-v1", 3, IndexType::Flat);
        metadata.update_counts(1, 1, 1);
        IndexData {
            files: vec![file],
            vectors: vec![vector],
            metadata,
        }
    }

    #[test]
    fn test_roundtrip_plain() {
        let data = sample();
        let bytes = encode(&data, WriteOptions::default()).unwrap();
        assert_eq!(&bytes[..4], &MAGIC.to_le_bytes());
        assert_eq!(decode(&bytes).unwrap(), data);
    }

    #[test]
    fn test_roundtrip_gzip_payload() {
        let data = sample();
        let options = WriteOptions {
            compression: Compression::Gzip,
            quantize: false,
        };
        let bytes = encode(&data, options).unwrap();
        assert_eq!(bytes[8], Compression::Gzip as u8);
        assert_eq!(decode(&bytes).unwrap(), data);
    }

    #[test]
    fn test_whole_file_gzip_is_accepted() {
        let data = sample();
        let plain = encode(&data, WriteOptions::default()).unwrap();
        let wrapped = gzip(&plain).unwrap();
        assert_eq!(decode(&wrapped).unwrap(), data);
    }

    #[test]
    fn test_quantized_vectors_are_approximate() {
        let data = sample();
        let options = WriteOptions {
            compression: Compression::None,
            quantize: true,
        };
        let decoded = decode(&encode(&data, options).unwrap()).unwrap();
        assert_eq!(decoded.files, data.files);
        for (a, b) in decoded.vectors[0].vector.iter().zip(&data.vectors[0].vector) {
            assert!((a - b).abs() < 0.01);
        }
    }

    #[test]
    fn test_checksum_mismatch_is_corrupt() {
        let mut bytes = encode(&sample(), WriteOptions::default()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, IndexError::Corrupt { .. }));
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_zero_checksum_skips_verification() {
        let mut bytes = encode(&sample(), WriteOptions::default()).unwrap();
        bytes[28..32].copy_from_slice(&0u32.to_le_bytes());
        assert!(decode(&bytes).is_ok());
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let bytes = encode(&sample(), WriteOptions::default()).unwrap();
        let err = decode(&bytes[..bytes.len() - 10]).unwrap_err();
        assert!(matches!(err, IndexError::Corrupt { .. }));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let err = decode(b"definitely not an index file, just text").unwrap_err();
        assert!(matches!(err, IndexError::Corrupt { .. }));
    }

    #[test]
    fn test_write_is_atomic() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(INDEX_FILE);
        let data = sample();
        write_index(&path, &data, WriteOptions::default()).unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("index.bin.tmp").exists());
        assert_eq!(read_index(&path).unwrap(), data);
    }

    #[test]
    fn test_long_content_truncated_in_chunk_section_but_restored() {
        let mut data = sample();
        let long = "x".repeat(70_000);
        data.files[0].chunks[0].content = long.clone();
        data.vectors[0].metadata.content = long.clone();
        let decoded = decode(&encode(&data, WriteOptions::default()).unwrap()).unwrap();
        assert_eq!(decoded.files[0].chunks[0].content, long);
    }

    #[test]
    fn test_long_content_without_vector_is_rejected() {
        let mut data = sample();
        data.vectors.clear();
        data.files[0].chunks[0].content = "x".repeat(70_000);
        let err = encode(&data, WriteOptions::default()).unwrap_err();
        assert!(matches!(err, IndexError::InvalidArgument { .. }), "{err:?}");
        assert!(err.to_string().contains("f.go:1-2"));

        data.files[0].chunks[0].content = "x".repeat(60_000);
        let decoded = decode(&encode(&data, WriteOptions::default()).unwrap()).unwrap();
        assert_eq!(decoded.files[0].chunks[0].content.len(), 60_000);
    }
}
