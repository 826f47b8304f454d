//! Turning a directory into an on-disk index.
//!
//! [`FileProcessor`] handles one file: read (streamed when large), chunk,
//! embed every chunk and extract its imports. [`IndexBuilder`] drives a whole
//! run: lock the index directory, move legacy index files into it, load
//! what is there, detect changes, apply them on a rayon pool and write
//! `index.bin`, `metadata.json` and `incremental.json` back. The records are
//! written last so they never describe content that `index.bin` does not hold.

use super::filter::FileFilter;
use super::incremental::{IncrementalIndexer, extract_dependencies};
use super::lock::IndexLock;
use super::migration;
use super::progress::IndexingReport;
use super::walker::{FileWalker, WalkedFile};
use crate::chunking::Chunker;
use crate::config::Settings;
use crate::display::{create_progress_bar, with_spinner};
use crate::error::{IndexError, IndexResult, IoContext};
use crate::index::CodeIndex;
use crate::pool::PoolManager;
use crate::runtime::{CancellationToken, MemoryLimiter, StreamingProcessor};
use crate::search::cache::invalidate_disk;
use crate::storage::WriteOptions;
use crate::types::FileEntry;
use crate::vector::{Embedder, chunk_text, embedder_from_settings};
use indicatif::ProgressBar;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A file after chunking and embedding.
#[derive(Debug, Clone)]
pub struct ProcessedFile {
    /// Entry whose chunks all carry a vector
    pub entry: FileEntry,
    pub dependencies: Vec<String>,
}

/// Reads, chunks and embeds single files. Shared across rayon workers.
pub struct FileProcessor {
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    streaming: StreamingProcessor,
    progress: Option<ProgressBar>,
}

impl FileProcessor {
    pub fn new(chunker: Chunker, embedder: Arc<dyn Embedder>, streaming: StreamingProcessor) -> Self {
        Self {
            chunker,
            embedder,
            streaming,
            progress: None,
        }
    }

    /// Processor configured from `settings`, with its own memory limiter and
    /// pools.
    pub fn from_settings(settings: &Settings) -> IndexResult<Self> {
        let embedder = embedder_from_settings(settings)?;
        let limiter = Arc::new(MemoryLimiter::new(settings.streaming.max_memory_usage));
        let streaming =
            StreamingProcessor::new(settings.streaming.clone(), limiter, PoolManager::default());
        Ok(Self::new(
            Chunker::new(settings.chunking.clone()),
            embedder,
            streaming,
        ))
    }

    /// Advance `bar` once per processed file.
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn streaming(&self) -> &StreamingProcessor {
        &self.streaming
    }

    pub fn process(&self, file: &WalkedFile, cancel: &CancellationToken) -> IndexResult<ProcessedFile> {
        let result = self.process_inner(file, cancel);
        if let Some(bar) = &self.progress {
            bar.inc(1);
        }
        result
    }

    fn process_inner(&self, file: &WalkedFile, cancel: &CancellationToken) -> IndexResult<ProcessedFile> {
        cancel.check("index file")?;
        let bytes = if self.streaming.should_stream(file.size) {
            self.streaming.read(&file.abs_path, cancel)?
        } else {
            std::fs::read(&file.abs_path).with_path(&file.abs_path, "read")?
        };

        let mut chunks = self.chunker.parse(&file.rel_path, &bytes, file.language);
        let texts: Vec<String> = chunks.iter().map(chunk_text).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let vectors = self.embedder.embed_batch(&refs)?;
        for (chunk, vector) in chunks.iter_mut().zip(vectors) {
            chunk.vector = Some(vector);
        }

        let text = String::from_utf8_lossy(&bytes);
        let dependencies = extract_dependencies(&file.rel_path, file.language, &text);

        let mut entry = FileEntry::new(file.rel_path.clone(), file.language, file.mtime, file.size);
        entry.chunks = chunks;
        debug!(
            path = %file.rel_path,
            chunks = entry.chunks.len(),
            dependencies = dependencies.len(),
            "processed file"
        );
        Ok(ProcessedFile {
            entry,
            dependencies,
        })
    }
}

/// Builds or refreshes the index of one directory.
#[derive(Debug, Clone)]
pub struct IndexBuilder {
    root: PathBuf,
    settings: Settings,
    force: bool,
    progress: bool,
    cancel: CancellationToken,
}

impl IndexBuilder {
    pub fn new(root: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            root: root.into(),
            settings,
            force: false,
            progress: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Discard any existing index and start over.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Draw a progress bar on stderr while files are processed.
    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_dir(&self) -> PathBuf {
        self.settings.index_path(&self.root)
    }

    /// Run the build. Per-file failures end up in the report; the run
    /// itself fails on lock contention, cancellation, write errors and on
    /// an existing index that is corrupt or built with another embedder
    /// (unless forced).
    pub fn build(&self) -> IndexResult<IndexingReport> {
        if !self.root.is_dir() {
            return Err(IndexError::not_found(
                "directory",
                self.root.display().to_string(),
            ));
        }
        let mut report = IndexingReport::new();
        let index_dir = self.index_dir();
        let legacy_pending = migration::needs_migration(&self.root, &index_dir)
            || (self.force && !migration::legacy_files(&self.root).is_empty());
        std::fs::create_dir_all(&index_dir).with_path(&index_dir, "create index directory")?;
        let _lock = IndexLock::exclusive(&index_dir)?;
        if legacy_pending
            && let Some(record) = migration::migrate(&self.root, &index_dir, true)?
        {
            report.migrated_files = record.legacy_files.len();
        }

        let model = self.settings.embedding.model.as_str();
        let dimension = self.settings.embedding.dimension;
        let (mut index, fresh) = self.load_or_create(&index_dir, model, dimension)?;
        report.rebuilt = fresh;

        let records = index_dir.join(super::incremental::INCREMENTAL_FILE);
        if self.force && records.exists() {
            std::fs::remove_file(&records).with_path(&records, "remove incremental records")?;
        }
        let mut incremental = IncrementalIndexer::open(&index_dir, self.settings.incremental.clone())?;
        if fresh {
            incremental.clear();
        }

        let filter = FileFilter::with_extra_excludes(
            &self.settings.indexing,
            &self.settings.incremental.exclude_patterns,
        )?;
        let walker = FileWalker::new(Arc::new(filter)).skip_dir(&index_dir);

        let threads = match self.settings.indexing.parallel_threads {
            0 => num_cpus::get(),
            n => n,
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("clindex-index-{i}"))
            .build()
            .map_err(|e| IndexError::invalid(format!("cannot start indexing threads: {e}")))?;

        let walked = if self.progress {
            with_spinner("Scanning files", || walker.walk(&self.root))
        } else {
            walker.walk(&self.root)
        };
        report.total_files = walked.len();
        let changes = pool.install(|| incremental.classify(walked));
        report.unchanged_files =
            report.total_files - changes.to_index.len() - changes.to_update.len();

        let mut processor = FileProcessor::from_settings(&self.settings)?;
        let bar = (self.progress && !changes.is_empty()).then(|| {
            create_progress_bar(
                (changes.to_index.len() + changes.to_update.len()) as u64,
                "Indexing",
            )
        });
        if let Some(bar) = &bar {
            processor = processor.with_progress(bar.clone());
        }

        let applied = pool.install(|| {
            incremental.apply_change_set(&mut index, &changes, &processor, &self.cancel)
        });
        if let Some(bar) = &bar {
            bar.finish_and_clear();
        }
        let applied = applied?;

        report.new_files = applied.indexed.len();
        report.updated_files = applied.updated.len();
        report.deleted_files = applied.deleted.len();
        report.chunks = applied.chunks;
        for (path, error) in applied.errors {
            report.add_error(path, error);
        }

        let index_file = index_dir.join(crate::storage::INDEX_FILE);
        if report.has_changes() || !index_file.exists() {
            let options = WriteOptions {
                compression: self.settings.storage.compression,
                quantize: self.settings.storage.quantize,
            };
            index.save(&index_dir, options)?;
            incremental.save()?;
            match invalidate_disk(&self.settings.cache, &index_dir) {
                Ok(removed) => debug!(removed, "invalidated persistent query cache"),
                Err(e) => warn!("failed to invalidate query cache: {e}"),
            }
        } else {
            incremental.save()?;
        }

        report.stop_timing();
        info!(
            total = report.total_files,
            new = report.new_files,
            updated = report.updated_files,
            deleted = report.deleted_files,
            unchanged = report.unchanged_files,
            errors = report.files_failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "indexing finished"
        );
        Ok(report)
    }

    fn load_or_create(
        &self,
        index_dir: &Path,
        model: &str,
        dimension: usize,
    ) -> IndexResult<(CodeIndex, bool)> {
        if self.force {
            return Ok((CodeIndex::new(&self.root, model, dimension), true));
        }
        match CodeIndex::load(&self.root, index_dir, model, dimension) {
            Ok(index) => Ok((index, false)),
            Err(IndexError::NotFound { .. }) => {
                debug!(dir = %index_dir.display(), "no existing index");
                Ok((CodeIndex::new(&self.root, model, dimension), true))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::CodeIndex;
    use crate::vector::HASHING_MODEL_NAME;
    use std::fs;
    use tempfile::TempDir;

    fn settings_for(dir: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.cache.dir = Some(dir.path().join("cache"));
        settings.indexing.exclude_patterns.push("cache".to_string());
        settings.indexing.parallel_threads = 2;
        settings
    }

    fn write(dir: &TempDir, rel: &str, content: &str) {
        let path = dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_process_embeds_every_chunk() {
        let dir = TempDir::new().unwrap();
        write(&dir, "calc.py", "import math\n\ndef area(r):\n    return math.pi * r * r\n");
        let processor = FileProcessor::from_settings(&Settings::default()).unwrap();
        let file = WalkedFile {
            rel_path: "calc.py".to_string(),
            abs_path: dir.path().join("calc.py"),
            language: crate::types::Language::Python,
            size: 48,
            mtime: 1,
        };
        let processed = processor.process(&file, &CancellationToken::new()).unwrap();
        assert!(!processed.entry.chunks.is_empty());
        assert!(processed.entry.chunks.iter().all(|c| c.vector.as_ref().map(Vec::len) == Some(384)));
        assert_eq!(processed.dependencies, vec!["math"]);
    }

    #[test]
    fn test_build_then_rebuild_incrementally() {
        let dir = TempDir::new().unwrap();
        write(&dir, "main.go", "package main\n\nfunc main() {\n\tprintln(\"hi\")\n}\n");
        write(&dir, "util.py", "def helper():\n    return 1\n");
        let settings = settings_for(&dir);

        let report = IndexBuilder::new(dir.path(), settings.clone()).build().unwrap();
        assert!(report.rebuilt);
        assert_eq!(report.total_files, 2);
        assert_eq!(report.new_files, 2);
        assert!(report.errors.is_empty());
        let index_dir = dir.path().join(".clindex");
        assert!(index_dir.join("index.bin").exists());
        assert!(index_dir.join("metadata.json").exists());
        assert!(index_dir.join("incremental.json").exists());

        let report = IndexBuilder::new(dir.path(), settings.clone()).build().unwrap();
        assert!(!report.rebuilt);
        assert_eq!(report.unchanged_files, 2);
        assert!(!report.has_changes());

        write(&dir, "util.py", "def helper():\n    return 2 + 2\n");
        fs::remove_file(dir.path().join("main.go")).unwrap();
        let report = IndexBuilder::new(dir.path(), settings.clone()).build().unwrap();
        assert_eq!(report.updated_files, 1);
        assert_eq!(report.deleted_files, 1);

        let index = CodeIndex::load(dir.path(), &index_dir, HASHING_MODEL_NAME, 384).unwrap();
        assert_eq!(index.file_count(), 1);
        assert!(index.file("util.py").is_some());
    }

    #[test]
    fn test_force_rebuilds() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.js", "function a() {\n  return 1;\n}\n");
        let settings = settings_for(&dir);
        IndexBuilder::new(dir.path(), settings.clone()).build().unwrap();

        let report = IndexBuilder::new(dir.path(), settings).force(true).build().unwrap();
        assert!(report.rebuilt);
        assert_eq!(report.new_files, 1);
        assert_eq!(report.unchanged_files, 0);
    }

    #[test]
    fn test_incompatible_index_needs_force() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.py", "x = 1\n");
        let mut settings = settings_for(&dir);
        settings.embedding.dimension = 64;
        IndexBuilder::new(dir.path(), settings.clone()).build().unwrap();

        settings.embedding.dimension = 384;
        let err = IndexBuilder::new(dir.path(), settings.clone()).build().unwrap_err();
        assert!(matches!(err, IndexError::Incompatible { .. }));

        let report = IndexBuilder::new(dir.path(), settings).force(true).build().unwrap();
        assert!(report.rebuilt);
        assert_eq!(report.new_files, 1);
    }

    #[test]
    fn test_corrupt_records_need_force() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.py", "x = 1\n");
        let settings = settings_for(&dir);
        IndexBuilder::new(dir.path(), settings.clone()).build().unwrap();
        fs::write(dir.path().join(".clindex/incremental.json"), "garbage").unwrap();

        let err = IndexBuilder::new(dir.path(), settings.clone()).build().unwrap_err();
        assert!(matches!(err, IndexError::Corrupt { .. }));
        IndexBuilder::new(dir.path(), settings).force(true).build().unwrap();
    }

    #[test]
    fn test_missing_root() {
        let dir = TempDir::new().unwrap();
        let err = IndexBuilder::new(dir.path().join("nope"), Settings::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, IndexError::NotFound { .. }));
    }

    #[test]
    fn test_cancelled_build() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.py", "x = 1\n");
        let token = CancellationToken::new();
        token.cancel();
        let err = IndexBuilder::new(dir.path(), settings_for(&dir))
            .with_cancellation(token)
            .build()
            .unwrap_err();
        assert!(matches!(err, IndexError::Timeout { .. }));
    }
}
