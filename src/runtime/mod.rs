//! Threads, cancellation and memory accounting shared by indexing and
//! search.

mod cancel;
mod memory;
mod streaming;
mod worker_pool;

pub use cancel::CancellationToken;
pub use memory::MemoryLimiter;
pub use streaming::{StreamingProcessor, StreamingStats};
pub use worker_pool::{WorkFuture, WorkerPool, WorkerPoolOptions, WorkerPoolStats};
