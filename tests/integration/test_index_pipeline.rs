//! Index builds against real directories: change detection, dependency
//! tracking and what ends up on disk.

use super::common::TestProject;
use super::common::sample_code::{FOO_JS, MAIN_PY, MATH_PY, TAX_GO, VAT_GO};
use clindex::indexing::{INCREMENTAL_FILE, IncrementalIndexer};
use clindex::storage::{INDEX_FILE, IndexMetadata, MmapIndexReader, Segment};
use clindex::{CodeIndex, IndexBuilder, IndexError, Language};
use std::fs;
use std::thread;
use std::time::Duration;

fn load(project: &TestProject) -> CodeIndex {
    let settings = project.settings();
    CodeIndex::load(
        project.path(),
        &project.index_dir(),
        &settings.embedding.model,
        settings.embedding.dimension,
    )
    .expect("index loads")
}

#[test]
fn test_first_build_writes_everything() {
    let project = TestProject::new();
    project.add_file("f.go", TAX_GO);
    project.add_file("web/a.js", FOO_JS);
    project.add_file("node_modules/dep/index.js", FOO_JS);
    project.add_file("assets/logo.png", "not really a png");

    let report = project.index();
    assert_eq!(report.total_files, 2);
    assert_eq!(report.new_files, 2);
    assert!(report.rebuilt);
    assert!(report.errors.is_empty());

    let dir = project.index_dir();
    for name in [INDEX_FILE, "metadata.json", INCREMENTAL_FILE] {
        assert!(dir.join(name).exists(), "{name} missing");
    }

    let index = load(&project);
    let stats = index.stats();
    assert_eq!(stats.files, 2);
    assert_eq!(stats.chunks, stats.vectors);
    assert_eq!(stats.languages.get(&Language::Go), Some(&1));
    assert_eq!(stats.languages.get(&Language::JavaScript), Some(&1));

    let metadata = IndexMetadata::load(&dir).unwrap();
    assert_eq!(metadata.file_count, 2);
    assert_eq!(metadata.vector_count, stats.vectors as u64);
}

#[test]
fn test_mmap_reader_matches_loaded_index() {
    let project = TestProject::new();
    project.add_file("f.go", TAX_GO);
    project.add_file("a.js", FOO_JS);
    project.index();

    let reader = MmapIndexReader::open(&project.index_dir().join(INDEX_FILE), &[Segment::Vectors]).unwrap();
    let (vectors, files, chunks) = reader.counts();
    let index = load(&project);
    assert_eq!(files as usize, index.file_count());
    assert_eq!(chunks as usize, index.chunk_count());
    assert_eq!(vectors as usize, index.store().len());

    let data = reader.decode().unwrap();
    let mut ids: Vec<String> = data.vectors.iter().map(|v| v.id.clone()).collect();
    ids.sort();
    let mut expected: Vec<String> = index
        .files()
        .flat_map(|f| f.chunks.iter().map(|c| c.id.clone()))
        .collect();
    expected.sort();
    assert_eq!(ids, expected);
}

#[test]
fn test_unchanged_tree_is_a_no_op() {
    let project = TestProject::new();
    project.add_file("f.go", TAX_GO);
    project.index();
    let written = fs::metadata(project.index_dir().join(INDEX_FILE)).unwrap().modified().unwrap();

    let report = project.index();
    assert_eq!(report.unchanged_files, 1);
    assert!(!report.has_changes());
    let after = fs::metadata(project.index_dir().join(INDEX_FILE)).unwrap().modified().unwrap();
    assert_eq!(written, after);
}

#[test]
fn test_touch_with_identical_content() {
    let project = TestProject::new();
    project.add_file("f.go", TAX_GO);
    project.index();

    thread::sleep(Duration::from_millis(1100));
    project.add_file("f.go", TAX_GO);
    assert!(!project.index().has_changes());

    let mut settings = project.settings();
    settings.incremental.enable_hashing = false;
    thread::sleep(Duration::from_millis(1100));
    project.add_file("f.go", TAX_GO);
    let report = project.index_with(settings, false);
    assert_eq!(report.updated_files, 1);
}

#[test]
fn test_update_and_delete() {
    let project = TestProject::new();
    project.add_file("f.go", TAX_GO);
    project.add_file("a.js", FOO_JS);
    project.index();

    project.append("f.go", VAT_GO);
    project.remove_file("a.js");
    let report = project.index();
    assert_eq!(report.updated_files, 1);
    assert_eq!(report.deleted_files, 1);
    assert_eq!(report.new_files, 0);

    let index = load(&project);
    assert!(index.file("a.js").is_none());
    let lines = index.file("f.go").unwrap().lines();
    assert_eq!(lines.len(), 3);
    assert!(lines[2].contains("calculateVAT"));

    let records = IncrementalIndexer::open(&project.index_dir(), project.settings().incremental).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records.get("f.go").unwrap().version, 2);
}

#[test]
fn test_dependents_are_reindexed() {
    let project = TestProject::new();
    project.add_file("math_utils.py", MATH_PY);
    project.add_file("main.py", MAIN_PY);
    project.add_file("other.py", "def unrelated():\n    return 0\n");
    project.index();

    let records = IncrementalIndexer::open(&project.index_dir(), project.settings().incremental).unwrap();
    assert_eq!(records.get("main.py").unwrap().dependencies, vec!["math_utils"]);
    assert_eq!(records.get("math_utils.py").unwrap().dependencies, vec!["os"]);

    project.append("math_utils.py", "\ndef sub(a, b):\n    return a - b\n");
    let report = project.index();
    assert_eq!(report.updated_files, 2, "math_utils.py and its importer main.py");
    assert_eq!(report.unchanged_files, 1);
}

#[test]
fn test_corrupt_index_needs_force() {
    let project = TestProject::new();
    project.add_file("f.go", TAX_GO);
    project.index();

    let path = project.index_dir().join(INDEX_FILE);
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&path, bytes).unwrap();

    let err = IndexBuilder::new(project.path(), project.settings()).build().unwrap_err();
    assert!(matches!(err, IndexError::Corrupt { .. }), "{err:?}");

    let report = project.index_with(project.settings(), true);
    assert!(report.rebuilt);
    assert_eq!(report.new_files, 1);
    assert_eq!(load(&project).file_count(), 1);
}

#[test]
fn test_other_embedder_is_incompatible() {
    let project = TestProject::new();
    project.add_file("f.go", TAX_GO);
    project.index();

    let mut settings = project.settings();
    settings.embedding.dimension = 128;
    let err = IndexBuilder::new(project.path(), settings.clone()).build().unwrap_err();
    assert!(matches!(err, IndexError::Incompatible { .. }), "{err:?}");

    let report = project.index_with(settings, true);
    assert!(report.rebuilt);
}

#[test]
fn test_compressed_index_round_trip() {
    let project = TestProject::new();
    project.add_file("f.go", TAX_GO);
    project.add_file("a.js", FOO_JS);
    let mut settings = project.settings();
    settings.storage.compression = clindex::storage::Compression::Gzip;
    project.index_with(settings, false);

    let index = load(&project);
    assert_eq!(index.file_count(), 2);
    assert_eq!(index.chunk_count(), index.store().len());
}

#[test]
fn test_failed_index_write_keeps_changes_pending() {
    let project = TestProject::new();
    project.add_file("f.go", TAX_GO);
    project.index();
    let records = project.index_dir().join(INCREMENTAL_FILE);
    let saved_records = fs::read(&records).unwrap();

    project.append("f.go", VAT_GO);
    let blocker = project.index_dir().join(format!("{INDEX_FILE}.tmp"));
    fs::create_dir(&blocker).unwrap();
    let err = IndexBuilder::new(project.path(), project.settings()).build().unwrap_err();
    assert!(matches!(err, IndexError::Io { .. }), "{err:?}");
    assert_eq!(fs::read(&records).unwrap(), saved_records);

    fs::remove_dir(&blocker).unwrap();
    let report = project.index();
    assert_eq!(report.updated_files, 1);
    let lines = load(&project).file("f.go").unwrap().lines();
    assert!(lines.iter().any(|line| line.contains("calculateVAT")));
}

#[test]
fn test_legacy_files_are_migrated_on_first_build() {
    let project = TestProject::new();
    project.add_file("f.go", TAX_GO);
    project.add_file(".code-search-index.db", "legacy");

    let report = project.index();
    assert_eq!(report.migrated_files, 1);
    assert_eq!(report.new_files, 1);
    assert!(!project.path().join(".code-search-index.db").exists());
    let record = clindex::indexing::MigrationRecord::load(&project.index_dir())
        .unwrap()
        .unwrap();
    assert_eq!(record.legacy_files, vec![".code-search-index.db"]);

    // A later legacy file next to a populated index waits for an explicit migration.
    project.add_file(".search-index", "legacy");
    assert_eq!(project.index().migrated_files, 0);
    assert!(project.path().join(".search-index").exists());
    assert_eq!(project.index_with(project.settings(), true).migrated_files, 1);
}

#[test]
fn test_disk_embedding_cache_is_reused_across_builds() {
    let project = TestProject::new();
    project.add_file("f.go", TAX_GO);
    project.add_file("a.js", FOO_JS);
    let mut settings = project.settings();
    settings.embedding.cache.disk = true;

    project.index_with(settings.clone(), false);
    let cache_dir = clindex::vector::embedding_cache_dir(&settings);
    let entries = || {
        let mut entries: Vec<_> = fs::read_dir(&cache_dir)
            .unwrap()
            .flatten()
            .map(|e| (e.file_name(), e.metadata().unwrap().modified().unwrap()))
            .collect();
        entries.sort();
        entries
    };
    let first = entries();
    assert!(!first.is_empty());

    // A forced rebuild embeds nothing new: every entry is read, none rewritten.
    let report = project.index_with(settings, true);
    assert_eq!(report.new_files, 2);
    assert_eq!(entries(), first);
}

