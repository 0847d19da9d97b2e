#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use csv_loader::{LoadOptions, MemoryStore, Orchestrator, RetryPolicy, data::Row};
use tempfile::{TempDir, tempdir};

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory for the current test case.
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    /// Returns the root path for all files owned by this workspace.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }

    /// Writes a CSV with `header` and `rows` produced by `row(i)` for `0..rows`.
    pub fn write_generated(
        &self,
        name: &str,
        header: &str,
        rows: usize,
        row: impl Fn(usize) -> String,
    ) -> PathBuf {
        let mut contents = String::from(header);
        contents.push('\n');
        for idx in 0..rows {
            contents.push_str(&row(idx));
            contents.push('\n');
        }
        self.write(name, &contents)
    }
}

/// Options for `table` with retries that do not sleep.
pub fn options(table: &str) -> LoadOptions {
    LoadOptions {
        retry: RetryPolicy {
            max_retries: 3,
            base_delay: Duration::ZERO,
        },
        ..LoadOptions::new(table)
    }
}

pub fn orchestrator(store: &MemoryStore, options: LoadOptions) -> Orchestrator {
    Orchestrator::new(Arc::new(store.clone()), options)
}

/// Committed rows of `table`, sorted for order-insensitive comparisons.
pub fn sorted_rows(store: &MemoryStore, table: &str) -> Vec<Row> {
    let mut rows = store.table(table).map(|t| t.rows).unwrap_or_default();
    rows.sort_by_key(|row| format!("{row:?}"));
    rows
}
