//! Reusable buffers, float vectors and bounded result queues.
//!
//! Every pool keeps its free objects in bounded `crossbeam-channel` slabs,
//! so steady-state get/put never takes a lock. An empty slab falls back to
//! a fresh allocation; a full slab drops the returned object.
//!
//! A [`PoolManager`] is created once by the caller and passed to whatever
//! needs it. There is no process-wide instance.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Buffer size classes in bytes.
pub const BUFFER_CLASSES: [usize; 3] = [1024, 4 * 1024, 16 * 1024];

/// Default number of free objects kept per size class.
pub const DEFAULT_SLAB_CAPACITY: usize = 64;

#[derive(Debug)]
struct Slab<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Slab<T> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx }
    }

    fn take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    fn give(&self, value: T) -> bool {
        self.tx.try_send(value).is_ok()
    }

    fn len(&self) -> usize {
        self.rx.len()
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    returned: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self, pooled: usize) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            pooled,
        }
    }

    fn record_get(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_put(&self, kept: bool) {
        let counter = if kept { &self.returned } else { &self.dropped };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub returned: u64,
    pub dropped: u64,
    /// Free objects currently held
    pub pooled: usize,
}

/// Byte buffers in 1, 4 and 16 KiB classes.
#[derive(Debug)]
pub struct BufferPool {
    slabs: Vec<Slab<Vec<u8>>>,
    counters: Counters,
}

impl BufferPool {
    pub fn new(slab_capacity: usize) -> Self {
        Self {
            slabs: BUFFER_CLASSES.iter().map(|_| Slab::new(slab_capacity)).collect(),
            counters: Counters::default(),
        }
    }

    /// Empty buffer with capacity of at least `size` bytes.
    ///
    /// Requests above the largest class are allocated exactly and never
    /// pooled.
    pub fn get(&self, size: usize) -> Vec<u8> {
        let Some(class) = BUFFER_CLASSES.iter().position(|&c| c >= size) else {
            self.counters.record_get(false);
            return Vec::with_capacity(size);
        };
        match self.slabs[class].take() {
            Some(buffer) => {
                self.counters.record_get(true);
                buffer
            }
            None => {
                self.counters.record_get(false);
                Vec::with_capacity(BUFFER_CLASSES[class])
            }
        }
    }

    /// Return a buffer to the largest class its capacity satisfies.
    pub fn put(&self, mut buffer: Vec<u8>) {
        let Some(class) = BUFFER_CLASSES.iter().rposition(|&c| buffer.capacity() >= c) else {
            self.counters.record_put(false);
            return;
        };
        buffer.clear();
        let kept = self.slabs[class].give(buffer);
        self.counters.record_put(kept);
    }

    pub fn stats(&self) -> PoolStats {
        self.counters
            .snapshot(self.slabs.iter().map(Slab::len).sum())
    }
}

/// Zeroed `f32` vectors keyed by exact length.
#[derive(Debug)]
pub struct VectorPool {
    slabs: RwLock<HashMap<usize, Arc<Slab<Vec<f32>>>>>,
    slab_capacity: usize,
    counters: Counters,
}

impl VectorPool {
    pub fn new(slab_capacity: usize) -> Self {
        Self {
            slabs: RwLock::new(HashMap::new()),
            slab_capacity,
            counters: Counters::default(),
        }
    }

    fn slab(&self, len: usize) -> Arc<Slab<Vec<f32>>> {
        if let Some(slab) = self.slabs.read().get(&len) {
            return Arc::clone(slab);
        }
        Arc::clone(
            self.slabs
                .write()
                .entry(len)
                .or_insert_with(|| Arc::new(Slab::new(self.slab_capacity))),
        )
    }

    /// Vector of `len` zeros.
    pub fn get(&self, len: usize) -> Vec<f32> {
        match self.slab(len).take() {
            Some(mut vector) => {
                self.counters.record_get(true);
                vector.fill(0.0);
                vector
            }
            None => {
                self.counters.record_get(false);
                vec![0.0; len]
            }
        }
    }

    pub fn put(&self, vector: Vec<f32>) {
        if vector.is_empty() {
            self.counters.record_put(false);
            return;
        }
        let kept = self.slab(vector.len()).give(vector);
        self.counters.record_put(kept);
    }

    pub fn stats(&self) -> PoolStats {
        let pooled = self.slabs.read().values().map(|slab| slab.len()).sum();
        self.counters.snapshot(pooled)
    }
}

/// Bounded multi-producer queue of result batches.
#[derive(Debug, Clone)]
pub struct ResultQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> ResultQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Push without blocking; gives the value back when the queue is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        self.tx.try_send(value).map_err(|e| match e {
            TrySendError::Full(v) | TrySendError::Disconnected(v) => v,
        })
    }

    /// Push, waiting for space.
    pub fn push_blocking(&self, value: T) {
        // Both ends live in `self`, so the channel cannot be disconnected.
        let _ = self.tx.send(value);
    }

    pub fn pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Everything currently queued, in push order.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolManagerStats {
    pub buffers: PoolStats,
    pub vectors: PoolStats,
}

/// Handle to the shared pools.
#[derive(Debug, Clone)]
pub struct PoolManager {
    buffers: Arc<BufferPool>,
    vectors: Arc<VectorPool>,
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new(DEFAULT_SLAB_CAPACITY)
    }
}

impl PoolManager {
    pub fn new(slab_capacity: usize) -> Self {
        Self {
            buffers: Arc::new(BufferPool::new(slab_capacity)),
            vectors: Arc::new(VectorPool::new(slab_capacity)),
        }
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub fn vectors(&self) -> &VectorPool {
        &self.vectors
    }

    pub fn result_queue<T>(&self, capacity: usize) -> ResultQueue<T> {
        ResultQueue::new(capacity)
    }

    pub fn stats(&self) -> PoolManagerStats {
        PoolManagerStats {
            buffers: self.buffers.stats(),
            vectors: self.vectors.stats(),
        }
    }
}
