//! Per-file column inventory.
//!
//! Scanning reads the header and a bounded prefix of rows, never the whole
//! file, and guesses a type for each column from the sampled values.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use log::debug;
use serde::Serialize;

use crate::{
    data::{parse_boolean, parse_guid, parse_naive_date, parse_naive_datetime},
    error::{LoadError, Result},
    io_utils::{CsvChunkReader, Dialect},
    schema::{ColumnDef, ColumnType},
};

pub const DEFAULT_SAMPLE_ROWS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub columns: Vec<ColumnDef>,
    pub sampled_rows: usize,
}

impl FileDescriptor {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

#[derive(Debug, Clone)]
struct TypeCandidate {
    possible_boolean: bool,
    possible_integer: bool,
    possible_float: bool,
    possible_date: bool,
    possible_datetime: bool,
    possible_guid: bool,
    observed: bool,
}

impl TypeCandidate {
    fn new() -> Self {
        Self {
            possible_boolean: true,
            possible_integer: true,
            possible_float: true,
            possible_date: true,
            possible_datetime: true,
            possible_guid: true,
            observed: false,
        }
    }

    fn observe(&mut self, value: &str) {
        if value.is_empty() {
            return;
        }
        self.observed = true;
        // Only word literals count here so 0/1 columns stay integers.
        if self.possible_boolean
            && (parse_boolean(value).is_none() || value.chars().all(|c| c.is_ascii_digit()))
        {
            self.possible_boolean = false;
        }
        if self.possible_integer && value.parse::<i64>().is_err() {
            self.possible_integer = false;
        }
        if self.possible_float && value.parse::<f64>().is_err() {
            self.possible_float = false;
        }
        if self.possible_date && parse_naive_date(value).is_err() {
            self.possible_date = false;
        }
        if self.possible_datetime && parse_naive_datetime(value).is_err() {
            self.possible_datetime = false;
        }
        if self.possible_guid && parse_guid(value).is_err() {
            self.possible_guid = false;
        }
    }

    fn decide(&self) -> ColumnType {
        if !self.observed {
            ColumnType::String
        } else if self.possible_boolean {
            ColumnType::Boolean
        } else if self.possible_integer {
            ColumnType::Integer
        } else if self.possible_float {
            ColumnType::Float
        } else if self.possible_date {
            ColumnType::Date
        } else if self.possible_datetime {
            ColumnType::DateTime
        } else if self.possible_guid {
            ColumnType::Guid
        } else {
            ColumnType::String
        }
    }
}

pub(crate) fn validate_header(path: &Path, headers: &[String]) -> Result<()> {
    let malformed = |reason: String| LoadError::MalformedHeader {
        path: path.to_path_buf(),
        reason,
    };
    if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
        return Err(malformed("missing header row".to_string()));
    }
    if let Some(position) = headers.iter().position(|h| h.trim().is_empty()) {
        return Err(malformed(format!("column {} has an empty name", position + 1)));
    }
    let mut seen = HashSet::with_capacity(headers.len());
    let duplicates = headers
        .iter()
        .filter(|h| !seen.insert(h.as_str()))
        .cloned()
        .collect::<Vec<_>>();
    if !duplicates.is_empty() {
        return Err(malformed(format!(
            "duplicate column name(s): {}",
            duplicates.join(", ")
        )));
    }
    Ok(())
}

/// Scans the header and up to `sample_rows` records of `path`.
pub fn scan_file(path: &Path, dialect: &Dialect, sample_rows: usize) -> Result<FileDescriptor> {
    if sample_rows == 0 {
        return Err(LoadError::Config(
            "sample_rows must be at least 1".to_string(),
        ));
    }
    let mut reader = CsvChunkReader::open(path, dialect)?;
    let headers = reader.headers().to_vec();
    validate_header(path, &headers)?;

    let mut candidates = vec![TypeCandidate::new(); headers.len()];
    let sample = reader.read_chunk(sample_rows)?.unwrap_or_default();
    reader.close();
    for record in &sample {
        for (candidate, value) in candidates.iter_mut().zip(record.fields.iter()) {
            candidate.observe(value);
        }
    }

    let columns = headers
        .into_iter()
        .zip(candidates.iter())
        .map(|(name, candidate)| ColumnDef::new(name, candidate.decide()))
        .collect::<Vec<_>>();
    debug!(
        "Scanned {:?}: {} column(s) from {} sampled row(s)",
        path,
        columns.len(),
        sample.len()
    );
    Ok(FileDescriptor {
        path: path.to_path_buf(),
        columns,
        sampled_rows: sample.len(),
    })
}

/// Scans every path in order, stopping at the first failure.
pub fn scan_files<P: AsRef<Path>>(
    paths: &[P],
    dialect: &Dialect,
    sample_rows: usize,
) -> Result<Vec<FileDescriptor>> {
    paths
        .iter()
        .map(|path| scan_file(path.as_ref(), dialect, sample_rows))
        .collect()
}
