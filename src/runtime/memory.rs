//! Byte budget for buffered data.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counts bytes handed out against a fixed limit.
///
/// Callers reserve before buffering and release when the buffer is gone;
/// the limiter never allocates anything itself.
#[derive(Debug)]
pub struct MemoryLimiter {
    limit: u64,
    current: AtomicU64,
    peak: AtomicU64,
}

impl MemoryLimiter {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            current: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        }
    }

    /// Reserve `size` bytes; `false` if that would exceed the limit.
    pub fn try_allocate(&self, size: u64) -> bool {
        let reserved = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(size).filter(|&next| next <= self.limit)
            });
        match reserved {
            Ok(previous) => {
                self.peak.fetch_max(previous + size, Ordering::AcqRel);
                true
            }
            Err(_) => false,
        }
    }

    /// Return `size` bytes; releasing more than is held clamps at zero.
    pub fn release(&self, size: u64) {
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(size))
            });
    }

    pub fn current_usage(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn peak_usage(&self) -> u64 {
        self.peak.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}
