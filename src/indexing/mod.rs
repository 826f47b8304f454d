//! Building and refreshing the on-disk index.

pub mod builder;
pub mod filter;
pub mod incremental;
pub mod lock;
pub mod migration;
pub mod progress;
pub mod project;
pub mod walker;

pub use builder::{FileProcessor, IndexBuilder, ProcessedFile};
pub use filter::FileFilter;
pub use incremental::{
    ApplyReport, ChangeSet, FileMetadata, INCREMENTAL_FILE, IncrementalIndexer, IncrementalStats,
};
pub use lock::{IndexLock, LockMode};
pub use migration::{MigrationRecord, MigrationStatus};
pub use progress::IndexingReport;
pub use project::ProjectDetector;
pub use walker::{FileWalker, WalkedFile};
