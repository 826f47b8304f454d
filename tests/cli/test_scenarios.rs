//! End-to-end scenarios driven through the compiled binary.

use super::common::sample_code::{CALC_PY, FOO_JS, INVOICE_GO, TAX_GO, VAT_GO};
use super::common::{TestProject, stderr, stdout};

fn indexed(files: &[(&str, &str)]) -> TestProject {
    let project = TestProject::new();
    for (path, content) in files {
        project.add_file(path, content);
    }
    let output = project.run(&["index", "--quiet"]);
    assert!(output.status.success(), "index failed: {}", stderr(&output));
    project
}

fn search_json(project: &TestProject, args: &[&str]) -> serde_json::Value {
    let mut full = vec!["search"];
    full.extend_from_slice(args);
    full.extend_from_slice(&["--format", "json"]);
    let output = project.run(&full);
    assert!(output.status.success(), "search failed: {}", stderr(&output));
    serde_json::from_str(&stdout(&output)).expect("search output is JSON")
}

#[test]
fn test_index_then_search_single_function() {
    let project = indexed(&[("f.go", TAX_GO)]);

    let json = search_json(&project, &["calculateTax"]);
    let results = json["results"].as_array().unwrap();
    assert_eq!(results.len(), 1, "{json}");
    assert_eq!(results[0]["file_path"], "f.go");
    assert_eq!(results[0]["start_line"], 2);
    assert_eq!(results[0]["end_line"], 2);
    assert!(results[0]["relevance_score"].as_f64().unwrap() > 0.5);
}

#[test]
fn test_semantic_search_finds_both_files() {
    let project = indexed(&[("calc.go", TAX_GO), ("inv.go", INVOICE_GO)]);

    let json = search_json(&project, &["calculate tax", "--semantic", "--max-results", "5"]);
    assert_eq!(json["total_results"], 2, "{json}");
    let results = json["results"].as_array().unwrap();
    let paths: Vec<&str> = results.iter().map(|r| r["file_path"].as_str().unwrap()).collect();
    assert!(paths.contains(&"calc.go") && paths.contains(&"inv.go"), "{paths:?}");

    let scores: Vec<f64> = results
        .iter()
        .map(|r| r["relevance_score"].as_f64().unwrap())
        .collect();
    assert!(scores.iter().all(|s| *s >= 0.5), "{scores:?}");
    assert!(scores[0] > scores[1], "{scores:?}");
}

#[test]
fn test_regex_raw_output() {
    let project = indexed(&[("a.js", FOO_JS)]);

    let output = project.run(&["search", "function.*\\(", "--format", "raw"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1, "{text}");
    assert!(lines[0].starts_with("a.js:1:1:"), "{text}");
}

#[test]
fn test_fuzzy_threshold() {
    let project = indexed(&[("m.py", CALC_PY)]);

    let strict = search_json(&project, &["celculate", "--fuzzy", "--threshold", "0.9"]);
    assert_eq!(strict["total_results"], 0, "{strict}");

    let loose = search_json(&project, &["celculate", "--fuzzy", "--threshold", "0.3"]);
    let results = loose["results"].as_array().unwrap();
    assert_eq!(results.len(), 1, "{loose}");
    assert_eq!(results[0]["file_path"], "m.py");
    assert_eq!(results[0]["start_line"], 1);
    assert_eq!(results[0]["end_line"], 1);
    let score = results[0]["relevance_score"].as_f64().unwrap();
    assert!((0.3..=1.0).contains(&score), "{score}");
}

#[test]
fn test_incremental_reindex() {
    let project = indexed(&[("f.go", TAX_GO)]);
    project.append("f.go", VAT_GO);

    let output = project.run(&["index"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let report = stdout(&output);
    assert!(report.contains("Updated: 1\n"), "{report}");
    assert!(report.contains("New: 0\n"), "{report}");

    let json = search_json(&project, &["calculateVAT"]);
    let results = json["results"].as_array().unwrap();
    assert_eq!(results.len(), 1, "{json}");
    assert_eq!(results[0]["file_path"], "f.go");
    assert_eq!(results[0]["start_line"], 3);
}

#[test]
fn test_table_output() {
    let project = indexed(&[("f.go", TAX_GO)]);

    let output = project.run(&["search", "calculateTax"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    assert!(text.starts_with("Found 1 results:\n\n1. f.go:2-2\n"), "{text}");
    assert!(text.contains("Score: "), "{text}");
    assert!(text.contains("Search completed in "), "{text}");

    let output = project.run(&["search", "nothingMatchesThis"]);
    assert_eq!(stdout(&output), "No results found.\n");
}

#[test]
fn test_force_reindex_counts_every_file_as_new() {
    let project = indexed(&[("f.go", TAX_GO), ("a.js", FOO_JS)]);

    let output = project.run(&["index", "--force"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("New: 2\n"), "{}", stdout(&output));
}

#[test]
fn test_commands_from_a_subdirectory_use_the_project_root() {
    let project = TestProject::new();
    project.add_file("pkg/tax/f.go", TAX_GO);
    project.add_file("web/a.js", FOO_JS);

    let output = project.run_in("pkg/tax", &["index", "--quiet"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(project.index_dir().join("index.bin").exists());
    assert!(!project.path().join("pkg/tax/.clindex").exists());

    let output = project.run_in("web", &["search", "calculateTax", "--format", "json"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(json["results"][0]["file_path"], "pkg/tax/f.go", "{json}");
}

#[test]
fn test_migrate_command() {
    let project = TestProject::new();
    project.add_file(".code-search-index", "old index");

    let status = project.run(&["migrate", "--status"]);
    assert_eq!(stdout(&status), "legacy\n");

    let output = project.run(&["migrate"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    assert!(text.starts_with("Migrated 1 legacy entries (9 bytes)"), "{text}");
    assert!(project.index_dir().join("legacy/.code-search-index").exists());
    assert_eq!(stdout(&project.run(&["migrate", "--status"])), "migrated\n");

    let output = project.run(&["migrate", "--rollback"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).starts_with("Restored 1 legacy entries"));
    assert!(project.path().join(".code-search-index").exists());

    // Indexing picks the legacy file up on its own.
    project.add_file("f.go", TAX_GO);
    let output = project.run(&["index"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("Migrated legacy files: 1\n"), "{}", stdout(&output));
    assert!(!project.path().join(".code-search-index").exists());

    project.add_file(".code-index", "older index");
    let output = project.run(&["migrate"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("already has content"), "{}", stderr(&output));
    assert!(project.run(&["migrate", "--force"]).status.success());
    assert!(project.index_dir().join("legacy/.code-index").exists());
}

