//! Piecewise reading of large files under a memory budget.
//!
//! Pieces of `chunk_size` bytes are reserved against a [`MemoryLimiter`]
//! before they are read. When the budget is exhausted, buffered pieces are
//! spilled to a temporary file and their reservation released. Spill files
//! are deleted when the read finishes, fails or is cancelled.

use super::{CancellationToken, MemoryLimiter};
use crate::config::StreamingConfig;
use crate::error::{IndexResult, IoContext};
use crate::pool::PoolManager;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamingStats {
    pub files: u64,
    pub bytes: u64,
    pub pieces: u64,
    pub spills: u64,
}

#[derive(Debug, Default)]
struct Counters {
    files: AtomicU64,
    bytes: AtomicU64,
    pieces: AtomicU64,
    spills: AtomicU64,
}

enum Segment {
    Memory(Vec<u8>),
    Spilled(NamedTempFile),
}

/// Reads files above the streaming threshold piece by piece.
#[derive(Debug)]
pub struct StreamingProcessor {
    config: StreamingConfig,
    limiter: Arc<MemoryLimiter>,
    pools: PoolManager,
    spill_dir: PathBuf,
    counters: Counters,
}

impl StreamingProcessor {
    pub fn new(config: StreamingConfig, limiter: Arc<MemoryLimiter>, pools: PoolManager) -> Self {
        Self {
            config,
            limiter,
            pools,
            spill_dir: std::env::temp_dir(),
            counters: Counters::default(),
        }
    }

    /// Write spill files under `dir` instead of the system temp dir.
    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = dir.into();
        self
    }

    /// Files at least this large should go through [`read`](Self::read).
    pub fn should_stream(&self, size: u64) -> bool {
        size >= self.config.threshold
    }

    pub fn limiter(&self) -> &MemoryLimiter {
        &self.limiter
    }

    /// Read the whole file, checking `cancel` before every piece.
    pub fn read(&self, path: &Path, cancel: &CancellationToken) -> IndexResult<Vec<u8>> {
        let mut file = File::open(path).with_path(path, "open")?;
        let piece_size = self.config.chunk_size.max(1);
        let mut segments: Vec<Segment> = Vec::new();
        let mut reserved: u64 = 0;

        let result = self.read_pieces(&mut file, path, piece_size, cancel, &mut segments, &mut reserved);
        self.limiter.release(reserved);
        let total = result?;

        let mut out = Vec::with_capacity(total as usize);
        for segment in segments {
            match segment {
                Segment::Memory(piece) => {
                    out.extend_from_slice(&piece);
                    self.pools.buffers().put(piece);
                }
                Segment::Spilled(mut spill) => {
                    let spill_path = spill.path().to_path_buf();
                    let handle = spill.as_file_mut();
                    handle
                        .seek(SeekFrom::Start(0))
                        .with_path(&spill_path, "rewind spill file")?;
                    handle
                        .read_to_end(&mut out)
                        .with_path(&spill_path, "read spill file")?;
                }
            }
        }

        self.counters.files.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes.fetch_add(total, Ordering::Relaxed);
        debug!(path = %path.display(), bytes = total, "streamed file");
        Ok(out)
    }

    fn read_pieces(
        &self,
        file: &mut File,
        path: &Path,
        piece_size: usize,
        cancel: &CancellationToken,
        segments: &mut Vec<Segment>,
        reserved: &mut u64,
    ) -> IndexResult<u64> {
        let mut total = 0u64;
        let mut over_budget_warned = false;
        loop {
            cancel.check("stream file")?;

            if !self.limiter.try_allocate(piece_size as u64) {
                if self.config.enable_spilling && *reserved > 0 {
                    self.spill(segments, reserved)?;
                    continue;
                }
                if !over_budget_warned {
                    warn!(path = %path.display(), "memory budget exhausted, reading without spilling");
                    over_budget_warned = true;
                }
            } else {
                *reserved += piece_size as u64;
            }

            let mut piece = self.pools.buffers().get(piece_size);
            piece.resize(piece_size, 0);
            let read = read_full(file, &mut piece).with_path(path, "read")?;
            piece.truncate(read);
            if read == 0 {
                self.pools.buffers().put(piece);
                return Ok(total);
            }
            total += read as u64;
            self.counters.pieces.fetch_add(1, Ordering::Relaxed);
            segments.push(Segment::Memory(piece));
        }
    }

    /// Move every buffered piece after the last spill into one temp file.
    fn spill(&self, segments: &mut Vec<Segment>, reserved: &mut u64) -> IndexResult<()> {
        let first_memory = segments
            .iter()
            .rposition(|s| matches!(s, Segment::Spilled(_)))
            .map_or(0, |idx| idx + 1);
        let mut spill = tempfile::Builder::new()
            .prefix("clindex_spill_")
            .suffix(".tmp")
            .tempfile_in(&self.spill_dir)
            .with_path(&self.spill_dir, "create spill file")?;

        for segment in segments.drain(first_memory..) {
            if let Segment::Memory(piece) = segment {
                spill
                    .write_all(&piece)
                    .with_path(spill.path().to_path_buf(), "write spill file")?;
                self.pools.buffers().put(piece);
            }
        }
        self.limiter.release(*reserved);
        *reserved = 0;
        self.counters.spills.fetch_add(1, Ordering::Relaxed);
        debug!(file = %spill.path().display(), "spilled buffered pieces");
        segments.push(Segment::Spilled(spill));
        Ok(())
    }

    pub fn stats(&self) -> StreamingStats {
        StreamingStats {
            files: self.counters.files.load(Ordering::Relaxed),
            bytes: self.counters.bytes.load(Ordering::Relaxed),
            pieces: self.counters.pieces.load(Ordering::Relaxed),
            spills: self.counters.spills.load(Ordering::Relaxed),
        }
    }
}

/// Fill `buf` unless EOF comes first; returns bytes read.
fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
