//! The in-memory index and its concurrent wrapper.

mod code_index;
mod concurrent;

pub use code_index::{CodeIndex, IndexStats, vector_metadata};
pub use concurrent::{ConcurrentIndex, ConcurrentStats, IndexUpdate, ReadGuard};
