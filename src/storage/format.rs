//! On-disk layout of `index.bin`.
//!
//! # Storage Format
//!
//! Little-endian throughout:
//!
//! ```text
//! [ FileHeader 32 B ][ IndexHeader 48 B ][ vectors ][ files ][ chunks ][ metadata JSON ]
//! ```
//!
//! FileHeader:
//!
//! | offset | size | field                                         |
//! |--------|------|-----------------------------------------------|
//! | 0      | 4    | magic `0x434C494E`                            |
//! | 4      | 2    | format version                                |
//! | 6      | 2    | flags (`QUANTIZED = 0x1`)                     |
//! | 8      | 1    | compression (0 none, 1 gzip, 2 snappy, 3 zstd)|
//! | 9      | 3    | reserved                                      |
//! | 12     | 8    | index size (IndexHeader + sections)           |
//! | 20     | 8    | metadata JSON size                            |
//! | 28     | 4    | crc32 of everything after the header, 0 = off |
//!
//! IndexHeader holds the vector/file/chunk counts and then the absolute
//! offsets of the three sections in the uncompressed layout. When the
//! payload is gzip-compressed the header stays raw; sizes and offsets still
//! describe the uncompressed bytes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Magic number identifying an index file ("CLIN").
pub const MAGIC: u32 = 0x434C_494E;

/// Current format version.
pub const FORMAT_VERSION: u16 = 1;

pub const FILE_HEADER_SIZE: usize = 32;
pub const INDEX_HEADER_SIZE: usize = 48;

/// Offset of the vector section in the uncompressed layout.
pub const SECTIONS_START: usize = FILE_HEADER_SIZE + INDEX_HEADER_SIZE;

/// Marker for a chunk that has no vector.
pub const NO_VECTOR: u32 = u32::MAX;

bitflags::bitflags! {
    /// Flags stored in the file header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FormatFlags: u16 {
        /// Vectors are stored as `min f32 | max f32 | D × u8`
        const QUANTIZED = 0x1;
    }
}

/// Payload compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Compression {
    #[default]
    None = 0,
    Gzip = 1,
    Snappy = 2,
    Zstd = 3,
}

impl Compression {
    pub fn from_u8(value: u8) -> Result<Self, StorageError> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip),
            2 => Ok(Self::Snappy),
            3 => Ok(Self::Zstd),
            other => Err(StorageError::UnknownCompression(other)),
        }
    }

    /// Only `none` and `gzip` are produced and read.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::None | Self::Gzip)
    }
}

/// Errors raised while decoding an index file.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("bad magic number {found:#010x}")]
    BadMagic { found: u32 },

    #[error("unsupported format version {0} (this build reads version {FORMAT_VERSION})")]
    UnsupportedVersion(u16),

    #[error("unknown compression code {0}")]
    UnknownCompression(u8),

    #[error("compression {0:?} is not supported")]
    UnsupportedCompression(Compression),

    #[error("truncated {section}: needed {needed} bytes at offset {offset}")]
    Truncated {
        section: &'static str,
        offset: usize,
        needed: usize,
    },

    #[error("section offset {offset} outside the {len}-byte payload")]
    OffsetOutOfRange { offset: u64, len: usize },

    #[error("checksum mismatch: header says {expected:#010x}, data has {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("invalid {what}: {reason}")]
    Invalid { what: &'static str, reason: String },
}

impl From<StorageError> for crate::error::IndexError {
    fn from(err: StorageError) -> Self {
        Self::corrupt(err.to_string())
    }
}

/// The fixed 32-byte file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: FormatFlags,
    pub compression: Compression,
    pub index_size: u64,
    pub metadata_size: u64,
    pub checksum: u32,
}

impl FileHeader {
    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut out = [0u8; FILE_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out[6..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        out[8] = self.compression as u8;
        // 9..12 reserved
        out[12..20].copy_from_slice(&self.index_size.to_le_bytes());
        out[20..28].copy_from_slice(&self.metadata_size.to_le_bytes());
        out[28..32].copy_from_slice(&self.checksum.to_le_bytes());
        out
    }

    /// Parse and validate magic, version and compression.
    pub fn parse(bytes: &[u8]) -> Result<Self, StorageError> {
        let mut reader = ByteReader::new(bytes, "file header");
        let magic = reader.u32()?;
        if magic != MAGIC {
            return Err(StorageError::BadMagic { found: magic });
        }
        let version = reader.u16()?;
        if version != FORMAT_VERSION {
            return Err(StorageError::UnsupportedVersion(version));
        }
        let flags = FormatFlags::from_bits_truncate(reader.u16()?);
        let compression = Compression::from_u8(reader.u8()?)?;
        if !compression.is_supported() {
            return Err(StorageError::UnsupportedCompression(compression));
        }
        reader.skip(3)?;
        Ok(Self {
            magic,
            version,
            flags,
            compression,
            index_size: reader.u64()?,
            metadata_size: reader.u64()?,
            checksum: reader.u32()?,
        })
    }

    /// Total length of the uncompressed layout described by this header.
    #[must_use]
    pub fn uncompressed_len(&self) -> usize {
        FILE_HEADER_SIZE + self.index_size as usize + self.metadata_size as usize
    }
}

/// Section counts and absolute offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexHeader {
    pub vector_count: u64,
    pub file_count: u64,
    pub chunk_count: u64,
    pub vector_offset: u64,
    pub file_offset: u64,
    pub chunk_offset: u64,
}

impl IndexHeader {
    pub fn to_bytes(&self) -> [u8; INDEX_HEADER_SIZE] {
        let mut out = [0u8; INDEX_HEADER_SIZE];
        let fields = [
            self.vector_count,
            self.file_count,
            self.chunk_count,
            self.vector_offset,
            self.file_offset,
            self.chunk_offset,
        ];
        for (i, value) in fields.iter().enumerate() {
            out[i * 8..(i + 1) * 8].copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, StorageError> {
        let mut reader = ByteReader::new(bytes, "index header");
        Ok(Self {
            vector_count: reader.u64()?,
            file_count: reader.u64()?,
            chunk_count: reader.u64()?,
            vector_offset: reader.u64()?,
            file_offset: reader.u64()?,
            chunk_offset: reader.u64()?,
        })
    }

    /// Check that sections are ordered and inside `[SECTIONS_START, index_end]`.
    pub fn validate(&self, index_end: usize) -> Result<(), StorageError> {
        let offsets = [self.vector_offset, self.file_offset, self.chunk_offset];
        let mut previous = SECTIONS_START as u64;
        for offset in offsets {
            if offset < previous || offset > index_end as u64 {
                return Err(StorageError::OffsetOutOfRange {
                    offset,
                    len: index_end,
                });
            }
            previous = offset;
        }
        Ok(())
    }
}

/// Bounds-checked little-endian reader over a byte slice.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    section: &'static str,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8], section: &'static str) -> Self {
        Self {
            buf,
            pos: 0,
            section,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], StorageError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(StorageError::Truncated {
                section: self.section,
                offset: self.pos,
                needed: len,
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), StorageError> {
        self.bytes(len).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, StorageError> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, StorageError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, StorageError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, StorageError> {
        let b = self.bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    pub fn f32(&mut self) -> Result<f32, StorageError> {
        Ok(f32::from_bits(self.u32()?))
    }

    pub fn string(&mut self, len: usize, what: &'static str) -> Result<String, StorageError> {
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| StorageError::Invalid {
            what,
            reason: e.to_string(),
        })
    }
}

/// Encode a vector as raw little-endian f32s.
pub fn encode_vector(out: &mut Vec<u8>, vector: &[f32]) {
    for value in vector {
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// Encode a vector as `min | max | D × u8`.
pub fn encode_quantized(out: &mut Vec<u8>, vector: &[f32]) {
    let min = vector.iter().copied().fold(f32::INFINITY, f32::min);
    let max = vector.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let (min, max) = if vector.is_empty() { (0.0, 0.0) } else { (min, max) };
    out.extend_from_slice(&min.to_le_bytes());
    out.extend_from_slice(&max.to_le_bytes());
    let range = max - min;
    for &value in vector {
        let q = if range > 0.0 {
            (((value - min) / range) * 255.0).round() as u8
        } else {
            0
        };
        out.push(q);
    }
}

/// Decode a vector section of `len` bytes in either representation.
pub fn decode_vector(bytes: &[u8], quantized: bool) -> Result<Vec<f32>, StorageError> {
    let mut reader = ByteReader::new(bytes, "vector");
    if quantized {
        let min = reader.f32()?;
        let max = reader.f32()?;
        let range = max - min;
        let rest = reader.bytes(bytes.len() - 8)?;
        Ok(rest
            .iter()
            .map(|&q| min + (f32::from(q) / 255.0) * range)
            .collect())
    } else {
        if bytes.len() % 4 != 0 {
            return Err(StorageError::Invalid {
                what: "vector",
                reason: format!("{} bytes is not a whole number of f32", bytes.len()),
            });
        }
        (0..bytes.len() / 4).map(|_| reader.f32()).collect()
    }
}
