#![allow(dead_code)]

use clindex::{IndexBuilder, IndexingReport, SearchEngine, Settings};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// A throwaway source tree with its own index and query cache.
pub struct TestProject {
    pub dir: TempDir,
}

impl TestProject {
    /// The `.git` directory marks the project root, so commands run
    /// without a path never walk above the temp dir.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        fs::create_dir(dir.path().join(".git")).expect("Failed to create .git");
        Self { dir }
    }

    pub fn add_file(&self, path: &str, content: &str) -> PathBuf {
        let file_path = self.dir.path().join(path);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dirs");
        }
        fs::write(&file_path, content).expect("Failed to write file");
        file_path
    }

    pub fn append(&self, path: &str, content: &str) {
        let file_path = self.dir.path().join(path);
        let mut existing = fs::read_to_string(&file_path).expect("Failed to read file");
        existing.push_str(content);
        fs::write(&file_path, existing).expect("Failed to write file");
    }

    pub fn remove_file(&self, path: &str) {
        fs::remove_file(self.dir.path().join(path)).expect("Failed to remove file");
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn index_dir(&self) -> PathBuf {
        self.path().join(".clindex")
    }

    /// Query cache location kept inside the project so tests never share it.
    pub fn cache_dir(&self) -> PathBuf {
        self.path().join(".cache")
    }

    pub fn settings(&self) -> Settings {
        let mut settings = Settings::default();
        settings.cache.dir = Some(self.cache_dir());
        settings.indexing.parallel_threads = 2;
        settings.concurrency.min_workers = 1;
        settings.concurrency.max_workers = 2;
        settings
    }

    pub fn index(&self) -> IndexingReport {
        self.index_with(self.settings(), false)
    }

    pub fn index_with(&self, settings: Settings, force: bool) -> IndexingReport {
        IndexBuilder::new(self.path(), settings)
            .force(force)
            .build()
            .expect("indexing failed")
    }

    pub fn engine(&self) -> SearchEngine {
        SearchEngine::open(self.path(), self.settings()).expect("Failed to open engine")
    }

    /// Run the compiled binary in the project directory.
    pub fn run(&self, args: &[&str]) -> Output {
        self.run_in("", args)
    }

    /// Run the compiled binary in `subdir` of the project.
    pub fn run_in(&self, subdir: &str, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_clindex"))
            .args(args)
            .current_dir(self.path().join(subdir))
            .env("CLINDEX_CACHE__DIR", self.cache_dir())
            .env_remove("CLINDEX_LOG")
            .output()
            .expect("Failed to run clindex")
    }
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

pub mod sample_code {
    pub const TAX_GO: &str =
        "package main\nfunc calculateTax(amount float64) float64 { return amount * 0.08 }\n";

    pub const INVOICE_GO: &str = r#"package billing

type Invoice struct {
	Total float64
}

func (i Invoice) CalculateTax(amount float64) float64 {
	return amount * 0.2
}
"#;

    pub const VAT_GO: &str = "func calculateVAT(amount float64) float64 { return amount * 0.2 }\n";

    pub const FOO_JS: &str = "function foo() {}\nconst bar = 1;\n";

    pub const CALC_PY: &str = "def calc_total():\n    return 1\n";

    pub const MATH_PY: &str = r#"import os

def add(a, b):
    return a + b


class Accumulator:
    def __init__(self):
        self.total = 0

    def push(self, value):
        self.total = add(self.total, value)
        return self.total
"#;

    pub const MAIN_PY: &str = r#"from math_utils import add

def main():
    print(add(1, 2))
"#;
}
