//! Copy-on-write access to a [`CodeIndex`].
//!
//! Readers take an `Arc` snapshot from an [`ArcSwap`] and never block.
//! Writers clone the current snapshot, modify the private copy and publish
//! it with a single atomic store, bumping the version. Queued updates go
//! through a bounded channel to a background thread that applies them in
//! batches of up to `update_batch_size`.

use super::CodeIndex;
use crate::config::ConcurrencyConfig;
use crate::error::{IndexError, IndexResult};
use crate::types::{Chunk, FileEntry};
use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A queued mutation.
#[derive(Debug, Clone)]
pub enum IndexUpdate {
    AddFile(FileEntry),
    RemoveFile(String),
    AddChunk(Chunk),
    RemoveChunk(String),
    /// Applied in order; stops at the first failing update
    Batch(Vec<IndexUpdate>),
    /// Rebuild the vector store from the file table
    Rebuild,
}

impl IndexUpdate {
    fn apply(self, index: &mut CodeIndex) -> IndexResult<()> {
        match self {
            Self::AddFile(entry) => index.upsert_file(entry),
            Self::RemoveFile(path) => index
                .remove_file(&path)?
                .map(|_| ())
                .ok_or_else(|| IndexError::not_found("file", path)),
            Self::AddChunk(chunk) => index.add_chunk(chunk),
            Self::RemoveChunk(id) => index.remove_chunk(&id).map(|_| ()),
            Self::Batch(updates) => updates.into_iter().try_for_each(|u| u.apply(index)),
            Self::Rebuild => index.rebuild(),
        }
    }
}

enum Message {
    Update(IndexUpdate),
    Flush(Sender<()>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConcurrentStats {
    pub version: u64,
    pub reads: u64,
    pub writes: u64,
    pub updates: u64,
    pub errors: u64,
    pub active_readers: usize,
    pub peak_readers: usize,
    pub pending_updates: usize,
}

#[derive(Debug, Default)]
struct Counters {
    version: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    updates: AtomicU64,
    errors: AtomicU64,
    readers: AtomicUsize,
    peak_readers: AtomicUsize,
}

struct Shared {
    current: ArcSwap<CodeIndex>,
    writer: Mutex<()>,
    counters: Counters,
}

impl Shared {
    /// Clone, modify, publish. The writer mutex serialises publishers.
    fn modify<T>(&self, f: impl FnOnce(&mut CodeIndex) -> IndexResult<T>) -> IndexResult<T> {
        let _writer = self.writer.lock();
        let mut next = CodeIndex::clone(&self.current.load());
        let value = f(&mut next)?;
        self.current.store(Arc::new(next));
        self.counters.version.fetch_add(1, Ordering::AcqRel);
        Ok(value)
    }

    fn apply_batch(&self, batch: Vec<IndexUpdate>) {
        if batch.is_empty() {
            return;
        }
        let counters = &self.counters;
        let applied = self.modify(|index| {
            for update in batch {
                match update.apply(index) {
                    Ok(()) => counters.updates.fetch_add(1, Ordering::Relaxed),
                    Err(e) => {
                        warn!("queued index update failed: {e}");
                        counters.errors.fetch_add(1, Ordering::Relaxed)
                    }
                };
            }
            Ok(())
        });
        if let Err(e) = applied {
            warn!("failed to publish update batch: {e}");
        }
    }
}

/// Snapshot handle counted against the reader limit until dropped.
pub struct ReadGuard<'a> {
    snapshot: Arc<CodeIndex>,
    counters: &'a Counters,
}

impl ReadGuard<'_> {
    /// Owned snapshot that outlives the guard.
    pub fn snapshot(&self) -> Arc<CodeIndex> {
        Arc::clone(&self.snapshot)
    }
}

impl Deref for ReadGuard<'_> {
    type Target = CodeIndex;

    fn deref(&self) -> &CodeIndex {
        &self.snapshot
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.counters.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shared index with lock-free reads and copy-on-write updates.
pub struct ConcurrentIndex {
    shared: Arc<Shared>,
    config: ConcurrencyConfig,
    tx: Mutex<Option<Sender<Message>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConcurrentIndex {
    pub fn new(index: CodeIndex, config: ConcurrencyConfig) -> Self {
        let shared = Arc::new(Shared {
            current: ArcSwap::from_pointee(index),
            writer: Mutex::new(()),
            counters: Counters::default(),
        });
        let (tx, rx) = bounded(config.max_queue_size.max(1));
        let batch_size = config.update_batch_size.max(1);
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("clindex-index-updates".to_string())
            .spawn(move || drain_updates(&worker_shared, &rx, batch_size))
            .map_err(|e| warn!("failed to spawn update thread: {e}"))
            .ok();

        Self {
            shared,
            config,
            tx: Mutex::new(worker.as_ref().map(|_| tx)),
            worker: Mutex::new(worker),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> IndexResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(IndexError::Unavailable)
        } else {
            Ok(())
        }
    }

    /// Take a snapshot; `TooManyReaders` past `max_readers` live guards.
    pub fn acquire(&self) -> IndexResult<ReadGuard<'_>> {
        self.ensure_open()?;
        let counters = &self.shared.counters;
        let limit = self.config.max_readers.max(1);
        let reserved = counters
            .readers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1));
        let active = match reserved {
            Ok(previous) => previous + 1,
            Err(_) => return Err(IndexError::TooManyReaders { limit }),
        };
        counters.peak_readers.fetch_max(active, Ordering::AcqRel);
        counters.reads.fetch_add(1, Ordering::Relaxed);
        Ok(ReadGuard {
            snapshot: self.shared.current.load_full(),
            counters,
        })
    }

    /// Run `f` against the current snapshot.
    pub fn read<T>(&self, f: impl FnOnce(&CodeIndex) -> T) -> IndexResult<T> {
        let guard = self.acquire()?;
        Ok(f(&guard))
    }

    /// Apply `f` to a private copy and publish it. Readers keep seeing the
    /// previous snapshot until the store; a failing `f` publishes nothing.
    pub fn write<T>(&self, f: impl FnOnce(&mut CodeIndex) -> IndexResult<T>) -> IndexResult<T> {
        self.ensure_open()?;
        let result = self.shared.modify(f);
        let counter = if result.is_ok() {
            &self.shared.counters.writes
        } else {
            &self.shared.counters.errors
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Queue an update for the background thread.
    ///
    /// Waits up to `update_timeout_ms` for queue space, then fails with
    /// `QueueFull`.
    pub fn queue(&self, update: IndexUpdate) -> IndexResult<()> {
        self.ensure_open()?;
        let tx = self.tx.lock().clone().ok_or(IndexError::Unavailable)?;
        let timeout = Duration::from_millis(self.config.update_timeout_ms);
        let started = Instant::now();
        tx.send_timeout(Message::Update(update), timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => IndexError::QueueFull {
                    waited_ms: started.elapsed().as_millis() as u64,
                },
                SendTimeoutError::Disconnected(_) => IndexError::Unavailable,
            })
    }

    /// Queue a full rebuild of the vector store.
    pub fn compact(&self) -> IndexResult<()> {
        self.queue(IndexUpdate::Rebuild)
    }

    /// Block until every update queued before this call is published.
    pub fn flush(&self) -> IndexResult<()> {
        self.ensure_open()?;
        let tx = self.tx.lock().clone().ok_or(IndexError::Unavailable)?;
        let (done_tx, done_rx) = bounded(1);
        tx.send(Message::Flush(done_tx))
            .map_err(|_| IndexError::Unavailable)?;
        done_rx.recv().map_err(|_| IndexError::Unavailable)
    }

    /// Current snapshot without reader accounting.
    pub fn snapshot(&self) -> Arc<CodeIndex> {
        self.shared.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.shared.counters.version.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ConcurrentStats {
        let c = &self.shared.counters;
        ConcurrentStats {
            version: c.version.load(Ordering::Acquire),
            reads: c.reads.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            updates: c.updates.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            active_readers: c.readers.load(Ordering::Acquire),
            peak_readers: c.peak_readers.load(Ordering::Acquire),
            pending_updates: self.tx.lock().as_ref().map_or(0, Sender::len),
        }
    }

    /// Apply pending updates and stop the background thread. Later calls
    /// fail with `Unavailable`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tx.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        debug!(version = self.version(), "closed concurrent index");
    }
}

impl Drop for ConcurrentIndex {
    fn drop(&mut self) {
        self.close();
    }
}

fn drain_updates(shared: &Shared, rx: &Receiver<Message>, batch_size: usize) {
    while let Ok(first) = rx.recv() {
        let mut batch = Vec::with_capacity(batch_size);
        let mut waiters = Vec::new();
        let mut next = Some(first);
        while let Some(message) = next.take() {
            match message {
                Message::Update(update) => batch.push(update),
                Message::Flush(done) => waiters.push(done),
            }
            if batch.len() >= batch_size || !waiters.is_empty() {
                break;
            }
            next = rx.try_recv().ok();
        }
        shared.apply_batch(batch);
        for done in waiters {
            let _ = done.send(());
        }
    }
}
