//! Error taxonomy for scanning, reconciliation, and loading.
//!
//! Every failure the loader can report is a [`LoadError`] variant. The
//! [`ErrorKind`] tag is what the job report records next to each failed file.

use std::{fmt, path::PathBuf};

use itertools::Itertools;
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

pub type Result<T, E = LoadError> = std::result::Result<T, E>;

/// One file's deviation from the reference layout under the `exact` or
/// `declared` reconciliation policies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileDeviation {
    pub path: PathBuf,
    pub extra_columns: Vec<String>,
    pub missing_columns: Vec<String>,
    pub order_differs: bool,
}

impl FileDeviation {
    pub fn is_empty(&self) -> bool {
        self.extra_columns.is_empty() && self.missing_columns.is_empty() && !self.order_differs
    }
}

impl fmt::Display for FileDeviation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.extra_columns.is_empty() {
            parts.push(format!("extra [{}]", self.extra_columns.iter().join(", ")));
        }
        if !self.missing_columns.is_empty() {
            parts.push(format!(
                "missing [{}]",
                self.missing_columns.iter().join(", ")
            ));
        }
        if self.order_differs {
            parts.push("column order differs".to_string());
        }
        write!(f, "{:?}: {}", self.path, parts.join("; "))
    }
}

/// Full per-file diff carried by [`LoadError::SchemaMismatch`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchemaDiff {
    pub reference: Option<PathBuf>,
    pub deviations: Vec<FileDeviation>,
}

impl SchemaDiff {
    pub fn deviation_for(&self, path: &std::path::Path) -> Option<&FileDeviation> {
        self.deviations.iter().find(|d| d.path == path)
    }
}

impl fmt::Display for SchemaDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self.deviations.iter().map(|d| d.to_string()).join("\n  ");
        match &self.reference {
            Some(reference) => write!(f, "relative to {reference:?}:\n  {rendered}"),
            None => write!(f, "relative to declared schema:\n  {rendered}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Malformed header in {path:?}: {reason}")]
    MalformedHeader { path: PathBuf, reason: String },

    #[error("Schema mismatch in {} file(s) {diff}", .diff.deviations.len())]
    SchemaMismatch { diff: SchemaDiff },

    #[error("Transform failed for {path:?} at chunk {chunk_index}: {message}")]
    Transform {
        path: PathBuf,
        chunk_index: usize,
        message: String,
    },

    #[error("Malformed value in {path:?} line {line}{}: {message}", column_suffix(.column))]
    MalformedValue {
        path: PathBuf,
        line: u64,
        column: Option<String>,
        message: String,
    },

    #[error("Table '{table}' already exists")]
    TableExists { table: String },

    #[error(
        "Table '{table}' is incompatible with the load schema: missing [{}], unexpected [{}]",
        .missing.iter().join(", "),
        .unexpected.iter().join(", ")
    )]
    IncompatibleTable {
        table: String,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("Transient store failure after {attempts} attempt(s): {message}")]
    TransientStore { attempts: u32, message: String },

    #[error("Store error: {message}")]
    Store { message: String },

    #[error("I/O error on {path:?}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Load cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

fn column_suffix(column: &Option<String>) -> String {
    column
        .as_ref()
        .map(|c| format!(" column '{c}'"))
        .unwrap_or_default()
}

/// Stable tag for each [`LoadError`] variant, recorded in job reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedHeader,
    SchemaMismatch,
    Transform,
    MalformedValue,
    TableExists,
    IncompatibleTable,
    TransientStore,
    Store,
    Io,
    Cancelled,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::MalformedHeader => "malformed_header",
            ErrorKind::SchemaMismatch => "schema_mismatch",
            ErrorKind::Transform => "transform",
            ErrorKind::MalformedValue => "malformed_value",
            ErrorKind::TableExists => "table_exists",
            ErrorKind::IncompatibleTable => "incompatible_table",
            ErrorKind::TransientStore => "transient_store",
            ErrorKind::Store => "store",
            ErrorKind::Io => "io",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
        };
        f.write_str(label)
    }
}

impl LoadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::MalformedHeader { .. } => ErrorKind::MalformedHeader,
            LoadError::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            LoadError::Transform { .. } => ErrorKind::Transform,
            LoadError::MalformedValue { .. } => ErrorKind::MalformedValue,
            LoadError::TableExists { .. } => ErrorKind::TableExists,
            LoadError::IncompatibleTable { .. } => ErrorKind::IncompatibleTable,
            LoadError::TransientStore { .. } => ErrorKind::TransientStore,
            LoadError::Store { .. } => ErrorKind::Store,
            LoadError::Io { .. } => ErrorKind::Io,
            LoadError::Cancelled => ErrorKind::Cancelled,
            LoadError::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        LoadError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, LoadError::TransientStore { .. })
    }
}

impl From<StoreError> for LoadError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transient(message) => LoadError::TransientStore {
                attempts: 1,
                message,
            },
            StoreError::Fatal(message) => LoadError::Store { message },
        }
    }
}
