//! Exit codes and error output of the binary.

use super::common::sample_code::TAX_GO;
use super::common::{TestProject, stderr, stdout};

#[test]
fn test_search_without_index_exits_3() {
    let project = TestProject::new();
    project.add_file("f.go", TAX_GO);

    let output = project.run(&["search", "calculateTax"]);
    assert_eq!(output.status.code(), Some(3));
    assert!(stderr(&output).starts_with("Error: "), "{}", stderr(&output));
}

#[test]
fn test_json_error_body() {
    let project = TestProject::new();

    let output = project.run(&["search", "calculateTax", "--format", "json"]);
    assert_eq!(output.status.code(), Some(3));
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(json["query"], "calculateTax");
    assert!(json["error"].as_str().unwrap().contains("not found"), "{json}");
}

#[test]
fn test_invalid_arguments_exit_2() {
    let project = TestProject::new();
    project.add_file("f.go", TAX_GO);
    assert!(project.run(&["index", "--quiet"]).status.success());

    let empty = project.run(&["search", "   "]);
    assert_eq!(empty.status.code(), Some(2), "{}", stderr(&empty));

    let threshold = project.run(&["search", "tax", "--threshold", "1.5"]);
    assert_eq!(threshold.status.code(), Some(2));

    let max = project.run(&["search", "tax", "--max-results", "0"]);
    assert_eq!(max.status.code(), Some(2));

    let regex = project.run(&["search", "fn(", "--regex"]);
    assert_eq!(regex.status.code(), Some(2));

    let conflicting = project.run(&["search", "tax", "--exact", "--fuzzy"]);
    assert_eq!(conflicting.status.code(), Some(2));

    let format = project.run(&["search", "tax", "--format", "xml"]);
    assert_eq!(format.status.code(), Some(2));
}

#[test]
fn test_index_missing_directory_exits_3() {
    let project = TestProject::new();
    let output = project.run(&["index", "does/not/exist"]);
    assert_eq!(output.status.code(), Some(3), "{}", stderr(&output));
}

#[test]
fn test_version() {
    let project = TestProject::new();
    let output = project.run(&["version"]);
    assert!(output.status.success());
    assert_eq!(
        stdout(&output).trim(),
        format!("clindex {}", env!("CARGO_PKG_VERSION"))
    );

    let flag = project.run(&["--version"]);
    assert!(flag.status.success());
    assert!(stdout(&flag).contains(env!("CARGO_PKG_VERSION")));
}
