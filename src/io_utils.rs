//! I/O utilities for dialect resolution and chunked CSV reading.
//!
//! All source-file access in csv-loader flows through this module:
//!
//! - **Dialect**: delimiter, quoting, and encoding for one input set, with
//!   extension-based delimiter detection (`.csv` → comma, `.tsv` → tab).
//! - **Encoding**: fields are read as bytes and decoded via `encoding_rs`,
//!   defaulting to UTF-8.
//! - **Chunked reads**: [`CsvChunkReader`] exposes `open` / `read_chunk` /
//!   `close` so callers never hold more than `max_rows` records at a time.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use anyhow::anyhow;
use encoding_rs::{Encoding, UTF_8};

use crate::error::{LoadError, Result};

pub const DEFAULT_CSV_DELIMITER: u8 = b',';
pub const DEFAULT_TSV_DELIMITER: u8 = b'\t';

#[derive(Debug, Clone, Copy)]
pub struct Dialect {
    pub delimiter: u8,
    pub quote: u8,
    pub double_quote: bool,
    pub escape: Option<u8>,
    pub encoding: &'static Encoding,
}

impl Default for Dialect {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_CSV_DELIMITER,
            quote: b'"',
            double_quote: true,
            escape: None,
            encoding: UTF_8,
        }
    }
}

impl Dialect {
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_encoding(mut self, encoding: &'static Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    fn reader_builder(&self) -> csv::ReaderBuilder {
        let mut builder = csv::ReaderBuilder::new();
        builder
            .has_headers(true)
            .delimiter(self.delimiter)
            .quote(self.quote)
            .double_quote(self.double_quote)
            .escape(self.escape)
            .flexible(false);
        builder
    }
}

pub fn resolve_encoding(label: Option<&str>) -> anyhow::Result<&'static Encoding> {
    if let Some(value) = label {
        Encoding::for_label(value.trim().as_bytes())
            .ok_or_else(|| anyhow!("Unknown encoding '{value}'"))
    } else {
        Ok(UTF_8)
    }
}

pub fn resolve_input_delimiter(path: &Path, provided: Option<u8>) -> u8 {
    provided.unwrap_or_else(|| match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => DEFAULT_TSV_DELIMITER,
        _ => DEFAULT_CSV_DELIMITER,
    })
}

pub fn decode_bytes(
    bytes: &[u8],
    encoding: &'static Encoding,
) -> std::result::Result<String, String> {
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        Err(format!(
            "Failed to decode text with encoding {}",
            encoding.name()
        ))
    } else {
        Ok(text.into_owned())
    }
}

pub fn decode_record(
    record: &csv::ByteRecord,
    encoding: &'static Encoding,
) -> std::result::Result<Vec<String>, String> {
    record
        .iter()
        .map(|field| decode_bytes(field, encoding))
        .collect()
}

/// One decoded source record with its 1-based starting line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub line: u64,
    pub fields: Vec<String>,
}

/// Open handle over one delimited file, read in bounded batches.
pub struct CsvChunkReader {
    path: PathBuf,
    reader: csv::Reader<Box<dyn Read + Send>>,
    encoding: &'static Encoding,
    headers: Vec<String>,
    record: csv::ByteRecord,
    exhausted: bool,
}

impl CsvChunkReader {
    pub fn open(path: &Path, dialect: &Dialect) -> Result<Self> {
        let file = File::open(path).map_err(|err| LoadError::io(path, err))?;
        let source: Box<dyn Read + Send> = Box::new(BufReader::new(file));
        let mut reader = dialect.reader_builder().from_reader(source);
        let header_record = reader
            .byte_headers()
            .map_err(|err| LoadError::MalformedHeader {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?
            .clone();
        let headers = decode_record(&header_record, dialect.encoding).map_err(|reason| {
            LoadError::MalformedHeader {
                path: path.to_path_buf(),
                reason,
            }
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            encoding: dialect.encoding,
            headers,
            record: csv::ByteRecord::new(),
            exhausted: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Reads up to `max_rows` records; `None` signals end of input.
    pub fn read_chunk(&mut self, max_rows: usize) -> Result<Option<Vec<RawRecord>>> {
        if self.exhausted {
            return Ok(None);
        }
        let mut rows = Vec::with_capacity(max_rows.min(8192));
        while rows.len() < max_rows {
            let more = self
                .reader
                .read_byte_record(&mut self.record)
                .map_err(|err| self.read_error(err))?;
            if !more {
                self.exhausted = true;
                break;
            }
            let line = self
                .record
                .position()
                .map(|pos| pos.line())
                .unwrap_or_default();
            let fields =
                decode_record(&self.record, self.encoding).map_err(|message| LoadError::Io {
                    path: self.path.clone(),
                    message: format!("line {line}: {message}"),
                })?;
            rows.push(RawRecord { line, fields });
        }
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(rows))
        }
    }

    pub fn close(self) {
        drop(self);
    }

    fn read_error(&self, err: csv::Error) -> LoadError {
        let line = err.position().map(|pos| pos.line()).unwrap_or_default();
        match err.kind() {
            csv::ErrorKind::UnequalLengths {
                expected_len, len, ..
            } => LoadError::MalformedValue {
                path: self.path.clone(),
                line,
                column: None,
                message: format!("expected {expected_len} field(s) but found {len}"),
            },
            csv::ErrorKind::Io(io_err) => LoadError::io(&self.path, io_err),
            _ => LoadError::MalformedValue {
                path: self.path.clone(),
                line,
                column: None,
                message: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn temp_csv(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write csv");
        file
    }

    #[test]
    fn read_chunk_respects_row_bound_and_signals_end() {
        let file = temp_csv("id,name\n1,a\n2,b\n3,c\n");
        let mut reader = CsvChunkReader::open(file.path(), &Dialect::default()).unwrap();
        assert_eq!(reader.headers(), ["id", "name"]);

        let first = reader.read_chunk(2).unwrap().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].line, 2);
        let second = reader.read_chunk(2).unwrap().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].fields, vec!["3", "c"]);
        assert!(reader.read_chunk(2).unwrap().is_none());
    }

    #[test]
    fn ragged_record_reports_line_number() {
        let file = temp_csv("id,name\n1,a\n2\n");
        let mut reader = CsvChunkReader::open(file.path(), &Dialect::default()).unwrap();
        let err = reader.read_chunk(10).unwrap_err();
        match err {
            LoadError::MalformedValue { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn decodes_non_utf8_input_with_configured_encoding() {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(b"name\ncaf\xe9\n").unwrap();
        let dialect = Dialect::default().with_encoding(encoding_rs::WINDOWS_1252);
        let mut reader = CsvChunkReader::open(file.path(), &dialect).unwrap();
        let rows = reader.read_chunk(10).unwrap().unwrap();
        assert_eq!(rows[0].fields, vec!["café"]);
    }

    #[test]
    fn resolve_input_delimiter_prefers_tab_for_tsv() {
        assert_eq!(resolve_input_delimiter(Path::new("a.tsv"), None), b'\t');
        assert_eq!(resolve_input_delimiter(Path::new("a.csv"), None), b',');
        assert_eq!(resolve_input_delimiter(Path::new("a.tsv"), Some(b';')), b';');
    }
}
