//! Change detection between index runs.
//!
//! One [`FileMetadata`] record per indexed file is kept in
//! `<index_dir>/incremental.json`. A run walks the tree, compares what it
//! finds with the records and produces a [`ChangeSet`]; applying the change
//! set re-chunks and re-embeds only the files that need it.
//!
//! With hashing enabled a file whose content hash and size are unchanged is
//! not re-indexed even if its mtime moved. Files that import a changed file
//! are re-indexed as well when dependency tracking is on.

use super::builder::FileProcessor;
use super::walker::{FileWalker, WalkedFile};
use crate::config::IncrementalConfig;
use crate::error::{IndexError, IndexResult, IoContext};
use crate::index::CodeIndex;
use crate::runtime::CancellationToken;
use crate::storage::write_atomic;
use crate::types::Language;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

/// Name of the change-tracking file inside the index directory.
pub const INCREMENTAL_FILE: &str = "incremental.json";

const RECORDS_VERSION: u32 = 1;

/// What the last successful run recorded about one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    pub size: u64,
    /// Seconds since the unix epoch
    pub mtime: u64,
    /// SHA-256 of the content, hex; absent above the hashing ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    pub last_indexed: DateTime<Utc>,
    pub language: Language,
    /// Normalised import targets
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Incremented every time the file is re-indexed
    pub version: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RecordsFile {
    version: u32,
    files: BTreeMap<String, FileMetadata>,
}

/// Files to add, re-index and drop, each sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub to_index: Vec<String>,
    pub to_update: Vec<String>,
    pub to_delete: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.to_index.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_index.len() + self.to_update.len() + self.to_delete.len()
    }
}

/// Outcome of [`IncrementalIndexer::apply_change_set`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub indexed: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub chunks: usize,
    /// `(path, message)` for files that could not be processed
    pub errors: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IncrementalStats {
    pub total_files: usize,
    pub hashed_files: usize,
    pub dependencies: usize,
    pub files_by_language: BTreeMap<Language, usize>,
}

#[derive(Debug, Clone)]
struct ScannedFile {
    file: WalkedFile,
    hash: Option<String>,
}

/// Tracks per-file metadata across runs.
#[derive(Debug)]
pub struct IncrementalIndexer {
    path: PathBuf,
    config: IncrementalConfig,
    records: BTreeMap<String, FileMetadata>,
    scanned: HashMap<String, ScannedFile>,
}

impl IncrementalIndexer {
    /// Load the records in `index_dir`, or start empty if there are none.
    pub fn open(index_dir: &Path, config: IncrementalConfig) -> IndexResult<Self> {
        let path = index_dir.join(INCREMENTAL_FILE);
        let records = if path.exists() {
            let bytes = std::fs::read(&path).with_path(&path, "read incremental records")?;
            let file: RecordsFile = serde_json::from_slice(&bytes)
                .map_err(|e| IndexError::corrupt(format!("invalid {INCREMENTAL_FILE}: {e}")))?;
            file.files
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), records = records.len(), "opened incremental records");
        Ok(Self {
            path,
            config,
            records,
            scanned: HashMap::new(),
        })
    }

    pub fn config(&self) -> &IncrementalConfig {
        &self.config
    }

    pub fn get(&self, path: &str) -> Option<&FileMetadata> {
        self.records.get(path)
    }

    /// Records in path order.
    pub fn records(&self) -> impl Iterator<Item = &FileMetadata> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forget every record, forcing the next run to index everything.
    pub fn clear(&mut self) {
        self.records.clear();
        self.scanned.clear();
    }

    /// Walk `root` and classify every file against the records.
    pub fn detect_changes(&mut self, root: &Path, walker: &FileWalker) -> IndexResult<ChangeSet> {
        let walked = walker.walk(root);
        Ok(self.classify(walked))
    }

    /// Classify an already walked file list.
    pub fn classify(&mut self, walked: Vec<WalkedFile>) -> ChangeSet {
        let hashing = self.config.enable_hashing;
        let ceiling = self.config.max_file_size_hash;
        let scanned: Vec<ScannedFile> = walked
            .into_par_iter()
            .map(|file| {
                let hash = (hashing && file.size <= ceiling)
                    .then(|| hash_file(&file.abs_path))
                    .flatten();
                ScannedFile { file, hash }
            })
            .collect();

        let mut changes = ChangeSet::default();
        for scan in &scanned {
            let path = &scan.file.rel_path;
            match self.records.get_mut(path) {
                None => changes.to_index.push(path.clone()),
                Some(record) if has_changed(record, scan) => changes.to_update.push(path.clone()),
                Some(record) => record.mtime = scan.file.mtime,
            }
        }

        self.scanned = scanned
            .into_iter()
            .map(|scan| (scan.file.rel_path.clone(), scan))
            .collect();
        changes.to_delete = self
            .records
            .keys()
            .filter(|path| !self.scanned.contains_key(*path))
            .cloned()
            .collect();

        if self.config.enable_dependencies {
            let changed: Vec<&str> = changes
                .to_index
                .iter()
                .chain(&changes.to_update)
                .chain(&changes.to_delete)
                .map(String::as_str)
                .collect();
            let already: BTreeSet<&str> = changed.iter().copied().collect();
            let dependents: Vec<String> = self
                .records
                .values()
                .filter(|record| !already.contains(record.path.as_str()))
                .filter(|record| self.scanned.contains_key(&record.path))
                .filter(|record| {
                    record
                        .dependencies
                        .iter()
                        .any(|dep| changed.iter().any(|c| depends_on(dep, c)))
                })
                .map(|record| record.path.clone())
                .collect();
            if !dependents.is_empty() {
                debug!(count = dependents.len(), "re-indexing dependents of changed files");
            }
            changes.to_update.extend(dependents);
        }

        changes.to_index.sort();
        changes.to_update.sort();
        changes.to_update.dedup();
        changes.to_delete.sort();
        debug!(
            new = changes.to_index.len(),
            modified = changes.to_update.len(),
            deleted = changes.to_delete.len(),
            "detected changes"
        );
        changes
    }

    /// Apply `changes` to `index`.
    ///
    /// Deleted files are dropped first. The remaining files are processed
    /// in parallel; a file that fails keeps its previous entry and record
    /// and is reported in [`ApplyReport::errors`]. Records are only updated
    /// in memory; call [`save`](Self::save) once the index itself is on disk.
    pub fn apply_change_set(
        &mut self,
        index: &mut CodeIndex,
        changes: &ChangeSet,
        processor: &FileProcessor,
        cancel: &CancellationToken,
    ) -> IndexResult<ApplyReport> {
        let mut report = ApplyReport::default();

        for path in &changes.to_delete {
            index.remove_file(path)?;
            self.records.remove(path);
            report.deleted.push(path.clone());
        }

        let mut targets = Vec::with_capacity(changes.to_index.len() + changes.to_update.len());
        for (path, is_update) in changes
            .to_index
            .iter()
            .map(|p| (p, false))
            .chain(changes.to_update.iter().map(|p| (p, true)))
        {
            match self.scanned.get(path) {
                Some(scan) => targets.push((scan.clone(), is_update)),
                None => report
                    .errors
                    .push((path.clone(), "file was not seen by the last scan".to_string())),
            }
        }

        let results: Vec<_> = targets
            .into_par_iter()
            .map(|(scan, is_update)| {
                let result = cancel
                    .check("index files")
                    .and_then(|()| processor.process(&scan.file, cancel));
                (scan, is_update, result)
            })
            .collect();
        cancel.check("index files")?;

        let now = Utc::now();
        for (scan, is_update, result) in results {
            let path = scan.file.rel_path.clone();
            let processed = match result {
                Ok(processed) => processed,
                Err(e) => {
                    warn!("skipping {path}: {e}");
                    report.errors.push((path, e.to_string()));
                    continue;
                }
            };
            report.chunks += processed.entry.chunks.len();
            index.upsert_file(processed.entry)?;
            let version = self.records.get(&path).map_or(0, |r| r.version) + 1;
            self.records.insert(
                path.clone(),
                FileMetadata {
                    path: path.clone(),
                    size: scan.file.size,
                    mtime: scan.file.mtime,
                    hash: scan.hash,
                    last_indexed: now,
                    language: scan.file.language,
                    dependencies: processed.dependencies,
                    version,
                },
            );
            if is_update {
                report.updated.push(path);
            } else {
                report.indexed.push(path);
            }
        }

        report.errors.sort();
        info!(
            indexed = report.indexed.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            errors = report.errors.len(),
            "applied change set"
        );
        Ok(report)
    }

    /// Persist the records atomically.
    pub fn save(&self) -> IndexResult<()> {
        let file = RecordsFile {
            version: RECORDS_VERSION,
            files: self.records.clone(),
        };
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).with_path(dir, "create index directory")?;
        }
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| IndexError::corrupt(format!("cannot serialise records: {e}")))?;
        write_atomic(&self.path, &json).with_path(&self.path, "write incremental records")
    }

    pub fn stats(&self) -> IncrementalStats {
        let mut stats = IncrementalStats {
            total_files: self.records.len(),
            ..IncrementalStats::default()
        };
        for record in self.records.values() {
            if record.hash.is_some() {
                stats.hashed_files += 1;
            }
            stats.dependencies += record.dependencies.len();
            *stats.files_by_language.entry(record.language).or_insert(0) += 1;
        }
        stats
    }

    /// Drop records last indexed more than `max_age` ago; saves when any
    /// were removed. Returns how many were removed.
    pub fn cleanup(&mut self, max_age: chrono::Duration) -> IndexResult<usize> {
        let cutoff = Utc::now() - max_age;
        let before = self.records.len();
        self.records.retain(|_, record| record.last_indexed >= cutoff);
        let removed = before - self.records.len();
        if removed > 0 {
            self.save()?;
        }
        Ok(removed)
    }
}

fn hash_file(path: &Path) -> Option<String> {
    match std::fs::read(path) {
        Ok(bytes) => Some(hex::encode(Sha256::digest(&bytes))),
        Err(e) => {
            debug!("cannot hash {}: {e}", path.display());
            None
        }
    }
}

fn has_changed(record: &FileMetadata, scan: &ScannedFile) -> bool {
    if record.size != scan.file.size || record.language != scan.file.language {
        return true;
    }
    match (&record.hash, &scan.hash) {
        (Some(old), Some(new)) => old != new,
        _ => record.mtime != scan.file.mtime,
    }
}

static GO_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*import\s+(?:[\w.]+\s+)?"([^"]+)""#).expect("valid go import regex")
});
static GO_IMPORT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*import\s*\(").expect("valid go import block regex"));
static GO_IMPORT_SPEC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(?:[\w.]+\s+)?"([^"]+)""#).expect("valid go import spec regex")
});
static PY_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*import\s+([\w.]+(?:\s*,\s*[\w.]+)*)").expect("valid python import regex")
});
static PY_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*from\s+(\.*[\w.]*)\s+import\b").expect("valid python from regex")
});
static JS_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(?:import|export)\b[^'"]*\bfrom\s*['"]([^'"]+)['"]"#)
        .expect("valid js import regex")
});
static JS_BARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*import\s*['"]([^'"]+)['"]"#).expect("valid js bare import regex")
});
static JS_REQUIRE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\brequire\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("valid require regex")
});
static C_INCLUDE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*#\s*include\s+"([^"]+)""#).expect("valid include regex")
});

/// Normalised import targets of a file.
///
/// Relative imports are resolved against the importing file's directory
/// and every target loses its extension, so `./util.js` imported from
/// `web/app.js` becomes `web/util`. Package imports are kept as written
/// (`example.com/shop/tax`, `numpy/linalg`).
pub fn extract_dependencies(rel_path: &str, language: Language, text: &str) -> Vec<String> {
    let dir = parent_dir(rel_path);
    let mut deps = BTreeSet::new();
    match language {
        Language::Go => {
            let mut in_block = false;
            for line in text.lines() {
                let trimmed = line.trim();
                if in_block {
                    if trimmed.starts_with(')') {
                        in_block = false;
                    } else if let Some(caps) = GO_IMPORT_SPEC.captures(line) {
                        deps.insert(caps[1].to_string());
                    }
                } else if let Some(caps) = GO_IMPORT.captures(line) {
                    deps.insert(caps[1].to_string());
                } else if GO_IMPORT_BLOCK.is_match(line) {
                    in_block = !trimmed.ends_with(')');
                }
            }
        }
        Language::Python => {
            for line in text.lines() {
                if let Some(caps) = PY_FROM.captures(line) {
                    if let Some(dep) = python_module(dir, &caps[1]) {
                        deps.insert(dep);
                    }
                } else if let Some(caps) = PY_IMPORT.captures(line) {
                    for module in caps[1].split(',') {
                        if let Some(dep) = python_module(dir, module.trim()) {
                            deps.insert(dep);
                        }
                    }
                }
            }
        }
        Language::JavaScript | Language::TypeScript => {
            for line in text.lines() {
                let targets = JS_FROM
                    .captures(line)
                    .or_else(|| JS_BARE.captures(line))
                    .map(|caps| caps[1].to_string())
                    .into_iter()
                    .chain(JS_REQUIRE.captures_iter(line).map(|caps| caps[1].to_string()));
                for target in targets {
                    deps.insert(relative_target(dir, &target));
                }
            }
        }
        Language::C | Language::Cpp => {
            for line in text.lines() {
                if let Some(caps) = C_INCLUDE.captures(line) {
                    deps.insert(join_relative(dir, &strip_extension(&caps[1])));
                }
            }
        }
        _ => {}
    }
    deps.into_iter().filter(|d| !d.is_empty()).collect()
}

/// Whether dependency `dep` refers to the file at `changed`.
pub fn depends_on(dep: &str, changed: &str) -> bool {
    let stem = strip_extension(changed);
    if dep == stem || dep.ends_with(&format!("/{stem}")) {
        return true;
    }
    let is_go = Language::from_path(Path::new(changed)) == Some(Language::Go);
    let dir = parent_dir(changed);
    is_go && !dir.is_empty() && (dep == dir || dep.ends_with(&format!("/{dir}")))
}

fn parent_dir(path: &str) -> &str {
    path.rfind('/').map_or("", |idx| &path[..idx])
}

fn strip_extension(path: &str) -> String {
    let name_start = path.rfind('/').map_or(0, |idx| idx + 1);
    match path[name_start..].rfind('.') {
        Some(dot) if dot > 0 => path[..name_start + dot].to_string(),
        _ => path.to_string(),
    }
}

/// `base/rel` with `.` and `..` collapsed.
fn join_relative(base: &str, rel: &str) -> String {
    let mut parts: Vec<&str> = base.split('/').filter(|p| !p.is_empty()).collect();
    for part in rel.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

fn relative_target(dir: &str, target: &str) -> String {
    if target.starts_with("./") || target.starts_with("../") {
        join_relative(dir, &strip_extension(target))
    } else {
        target.to_string()
    }
}

fn python_module(dir: &str, module: &str) -> Option<String> {
    let dots = module.chars().take_while(|&c| c == '.').count();
    let name = module[dots..].replace('.', "/");
    if dots == 0 {
        return (!name.is_empty()).then_some(name);
    }
    let mut base = dir.to_string();
    for _ in 1..dots {
        base = parent_dir(&base).to_string();
    }
    let resolved = join_relative(&base, &name);
    (!resolved.is_empty()).then_some(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexingConfig, Settings};
    use crate::indexing::FileFilter;
    use crate::vector::HASHING_MODEL_NAME;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        walker: FileWalker,
        processor: FileProcessor,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let filter = FileFilter::new(&IndexingConfig::default()).unwrap();
            let walker =
                FileWalker::new(Arc::new(filter)).skip_dir(dir.path().join(".clindex"));
            let processor = FileProcessor::from_settings(&Settings::default()).unwrap();
            Self {
                dir,
                walker,
                processor,
            }
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn index_dir(&self) -> PathBuf {
            self.dir.path().join(".clindex")
        }

        fn write(&self, rel: &str, content: &str) {
            let path = self.root().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        fn indexer(&self, config: IncrementalConfig) -> IncrementalIndexer {
            IncrementalIndexer::open(&self.index_dir(), config).unwrap()
        }

        fn run(&self, indexer: &mut IncrementalIndexer, index: &mut CodeIndex) -> ChangeSet {
            let changes = indexer.detect_changes(self.root(), &self.walker).unwrap();
            indexer
                .apply_change_set(index, &changes, &self.processor, &CancellationToken::new())
                .unwrap();
            changes
        }

        fn set_mtime(&self, rel: &str, secs: u64) {
            let file = fs::File::options()
                .write(true)
                .open(self.root().join(rel))
                .unwrap();
            file.set_modified(std::time::UNIX_EPOCH + std::time::Duration::from_secs(secs))
                .unwrap();
        }
    }

    fn empty_index(root: &Path) -> CodeIndex {
        CodeIndex::new(root, HASHING_MODEL_NAME, 384)
    }

    #[test]
    fn test_first_run_indexes_everything() {
        let fx = Fixture::new();
        fx.write("a.go", "package a\n\nfunc A() {}\n");
        fx.write("b.py", "def b():\n    return 1\n");
        let mut indexer = fx.indexer(IncrementalConfig::default());
        let mut index = empty_index(fx.root());

        let changes = fx.run(&mut indexer, &mut index);
        assert_eq!(changes.to_index, vec!["a.go", "b.py"]);
        assert!(changes.to_update.is_empty());
        assert_eq!(index.file_count(), 2);
        assert_eq!(indexer.get("a.go").unwrap().version, 1);
        assert!(indexer.get("a.go").unwrap().hash.is_some());
        assert!(!fx.index_dir().join(INCREMENTAL_FILE).exists());
    }

    #[test]
    fn test_second_run_detects_each_kind_of_change() {
        let fx = Fixture::new();
        fx.write("keep.py", "def keep():\n    pass\n");
        fx.write("edit.py", "def edit():\n    pass\n");
        fx.write("gone.py", "def gone():\n    pass\n");
        let mut indexer = fx.indexer(IncrementalConfig::default());
        let mut index = empty_index(fx.root());
        fx.run(&mut indexer, &mut index);

        fx.write("edit.py", "def edit():\n    return 42\n");
        fs::remove_file(fx.root().join("gone.py")).unwrap();
        fx.write("new.py", "def new():\n    pass\n");

        let changes = fx.run(&mut indexer, &mut index);
        assert_eq!(changes.to_index, vec!["new.py"]);
        assert_eq!(changes.to_update, vec!["edit.py"]);
        assert_eq!(changes.to_delete, vec!["gone.py"]);
        assert!(index.file("gone.py").is_none());
        assert_eq!(indexer.get("edit.py").unwrap().version, 2);
        assert_eq!(indexer.get("keep.py").unwrap().version, 1);

        assert!(fx.run(&mut indexer, &mut index).is_empty());
    }

    #[test]
    fn test_touch_without_change_with_and_without_hashing() {
        let fx = Fixture::new();
        fx.write("a.py", "def a():\n    pass\n");
        fx.set_mtime("a.py", 1_000_000);

        let mut hashed = fx.indexer(IncrementalConfig::default());
        let mut index = empty_index(fx.root());
        fx.run(&mut hashed, &mut index);
        fx.write("a.py", "def a():\n    pass\n");
        fx.set_mtime("a.py", 2_000_000);
        let changes = hashed.detect_changes(fx.root(), &fx.walker).unwrap();
        assert!(changes.is_empty());

        let config = IncrementalConfig {
            enable_hashing: false,
            ..IncrementalConfig::default()
        };
        let mut plain = fx.indexer(config);
        let mut index = empty_index(fx.root());
        fx.run(&mut plain, &mut index);
        fx.set_mtime("a.py", 3_000_000);
        let changes = plain.detect_changes(fx.root(), &fx.walker).unwrap();
        assert_eq!(changes.to_update, vec!["a.py"]);
    }

    #[test]
    fn test_dependents_are_reindexed() {
        let fx = Fixture::new();
        fx.write("web/util.js", "export function add(a, b) {\n  return a + b;\n}\n");
        fx.write(
            "web/app.js",
            "import { add } from './util.js';\nconsole.log(add(1, 2));\n",
        );
        fx.write("web/other.js", "console.log('unrelated');\n");
        let mut indexer = fx.indexer(IncrementalConfig::default());
        let mut index = empty_index(fx.root());
        fx.run(&mut indexer, &mut index);
        assert_eq!(indexer.get("web/app.js").unwrap().dependencies, vec!["web/util"]);

        fx.write("web/util.js", "export function add(a, b) {\n  return b + a;\n}\n");
        let changes = indexer.detect_changes(fx.root(), &fx.walker).unwrap();
        assert_eq!(changes.to_update, vec!["web/app.js", "web/util.js"]);

        let config = IncrementalConfig {
            enable_dependencies: false,
            ..IncrementalConfig::default()
        };
        let mut indexer = IncrementalIndexer {
            config,
            ..indexer
        };
        let changes = indexer.detect_changes(fx.root(), &fx.walker).unwrap();
        assert_eq!(changes.to_update, vec!["web/util.js"]);
    }

    #[test]
    fn test_failed_update_keeps_previous_entry() {
        let fx = Fixture::new();
        fx.write("a.py", "def a():\n    pass\n");
        let mut indexer = fx.indexer(IncrementalConfig::default());
        let mut index = empty_index(fx.root());
        fx.run(&mut indexer, &mut index);

        fx.write("a.py", "def a():\n    return 2\n");
        let changes = indexer.detect_changes(fx.root(), &fx.walker).unwrap();
        fs::remove_file(fx.root().join("a.py")).unwrap();
        let report = indexer
            .apply_change_set(&mut index, &changes, &fx.processor, &CancellationToken::new())
            .unwrap();
        assert_eq!(report.errors.len(), 1);
        assert!(index.file("a.py").is_some());
        assert_eq!(indexer.get("a.py").unwrap().version, 1);
    }

    #[test]
    fn test_cancelled_apply_fails() {
        let fx = Fixture::new();
        fx.write("a.py", "def a():\n    pass\n");
        let mut indexer = fx.indexer(IncrementalConfig::default());
        let mut index = empty_index(fx.root());
        let changes = indexer.detect_changes(fx.root(), &fx.walker).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = indexer
            .apply_change_set(&mut index, &changes, &fx.processor, &token)
            .unwrap_err();
        assert!(matches!(err, IndexError::Timeout { .. }));
        assert!(indexer.is_empty());
    }

    #[test]
    fn test_save_reopen_stats_and_cleanup() {
        let fx = Fixture::new();
        fx.write("a.go", "package a\n\nimport \"fmt\"\n\nfunc A() { fmt.Println() }\n");
        fx.write("b.py", "import os\n");
        let mut indexer = fx.indexer(IncrementalConfig::default());
        let mut index = empty_index(fx.root());
        fx.run(&mut indexer, &mut index);
        indexer.save().unwrap();
        assert!(fx.index_dir().join(INCREMENTAL_FILE).exists());

        let mut reopened = fx.indexer(IncrementalConfig::default());
        assert_eq!(reopened.len(), 2);
        let stats = reopened.stats();
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.hashed_files, 2);
        assert_eq!(stats.dependencies, 2);
        assert_eq!(stats.files_by_language.get(&Language::Go), Some(&1));

        assert_eq!(reopened.cleanup(chrono::Duration::days(1)).unwrap(), 0);
        assert_eq!(reopened.cleanup(chrono::Duration::seconds(-60)).unwrap(), 2);
        assert!(fx.indexer(IncrementalConfig::default()).is_empty());
    }

    #[test]
    fn test_corrupt_records_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(INCREMENTAL_FILE), "{not json").unwrap();
        let err = IncrementalIndexer::open(dir.path(), IncrementalConfig::default()).unwrap_err();
        assert!(matches!(err, IndexError::Corrupt { .. }));
    }

    #[test]
    fn test_extract_go_imports() {
        let source = "package main\n\nimport \"fmt\"\nimport (\n\t\"os\"\n\tstr \"strings\"\n\t\"example.com/shop/tax\"\n)\n";
        assert_eq!(
            extract_dependencies("main.go", Language::Go, source),
            vec!["example.com/shop/tax", "fmt", "os", "strings"]
        );
    }

    #[test]
    fn test_extract_python_imports() {
        let source = "import os, sys\nfrom pkg.sub import thing\nfrom . import sibling\nfrom ..core import base\n";
        assert_eq!(
            extract_dependencies("app/views/main.py", Language::Python, source),
            vec!["app/core", "app/views", "os", "pkg/sub", "sys"]
        );
    }

    #[test]
    fn test_extract_js_and_c_imports() {
        let js = "import React from 'react';\nimport './styles.css';\nconst lib = require('../lib/helpers.js');\n";
        assert_eq!(
            extract_dependencies("src/app.js", Language::JavaScript, js),
            vec!["lib/helpers", "react", "src/styles"]
        );
        let c = "#include <stdio.h>\n#include \"util.h\"\n";
        assert_eq!(extract_dependencies("src/main.c", Language::C, c), vec!["src/util"]);
    }

    #[test]
    fn test_depends_on() {
        assert!(depends_on("web/util", "web/util.js"));
        assert!(depends_on("src/util", "src/util.c"));
        assert!(depends_on("example.com/shop/tax", "tax/calc.go"));
        assert!(depends_on("example.com/shop/tax", "shop/tax/rates.go"));
        assert!(!depends_on("example.com/shop/tax", "tax/calc.py"));
        assert!(!depends_on("web/util", "web/utils.js"));
        assert!(!depends_on("fmt", "main.go"));
    }
}
