mod common;

use common::TestWorkspace;
use csv_loader::{ColumnType, Dialect, ErrorKind, io_utils, scan_file};

#[test]
fn scan_infers_types_from_sample() {
    let workspace = TestWorkspace::new();
    let path = workspace.write(
        "orders.csv",
        "id,amount,active,ordered_at,ref,note\n\
         1,9.5,yes,2024-01-01,67e55044-10b1-426f-9247-bb680e5fe0c8,first\n\
         2,10,no,2024-01-02,67e55044-10b1-426f-9247-bb680e5fe0c9,\n",
    );
    let descriptor = scan_file(&path, &Dialect::default(), 100).expect("scan");
    let types: Vec<ColumnType> = descriptor.columns.iter().map(|c| c.datatype).collect();
    assert_eq!(
        types,
        vec![
            ColumnType::Integer,
            ColumnType::Float,
            ColumnType::Boolean,
            ColumnType::Date,
            ColumnType::Guid,
            ColumnType::String,
        ]
    );
    assert_eq!(descriptor.sampled_rows, 2);
}

#[test]
fn sample_window_is_bounded() {
    let workspace = TestWorkspace::new();
    let path = workspace.write_generated("big.csv", "value", 50, |idx| {
        if idx < 5 { idx.to_string() } else { format!("v{idx}") }
    });
    let descriptor = scan_file(&path, &Dialect::default(), 5).expect("scan");
    assert_eq!(descriptor.sampled_rows, 5);
    assert_eq!(descriptor.columns[0].datatype, ColumnType::Integer);
}

#[test]
fn zero_sample_rows_is_rejected() {
    let workspace = TestWorkspace::new();
    let path = workspace.write("a.csv", "id\n1\n");
    let err = scan_file(&path, &Dialect::default(), 0).expect_err("zero sample");
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn missing_empty_or_duplicate_headers_are_malformed() {
    let workspace = TestWorkspace::new();
    for (name, contents) in [
        ("empty.csv", ""),
        ("blank.csv", "id,,name\n1,2,3\n"),
        ("dupe.csv", "id,id\n1,2\n"),
    ] {
        let path = workspace.write(name, contents);
        let err = scan_file(&path, &Dialect::default(), 10).expect_err(name);
        assert_eq!(err.kind(), ErrorKind::MalformedHeader, "{name}");
    }
}

#[test]
fn ragged_rows_are_malformed_values() {
    let workspace = TestWorkspace::new();
    let path = workspace.write("ragged.csv", "id,name\n1,ann\n2\n");
    let err = scan_file(&path, &Dialect::default(), 10).expect_err("ragged");
    assert_eq!(err.kind(), ErrorKind::MalformedValue);
}

#[test]
fn tsv_extension_selects_tab_delimiter() {
    let workspace = TestWorkspace::new();
    let path = workspace.write("data.tsv", "id\tname\n1\tann\n");
    let dialect = Dialect::default().with_delimiter(io_utils::resolve_input_delimiter(&path, None));
    let descriptor = scan_file(&path, &dialect, 10).expect("scan tsv");
    assert_eq!(descriptor.column_names(), vec!["id", "name"]);
}

#[test]
fn non_utf8_input_decodes_with_configured_encoding() {
    let workspace = TestWorkspace::new();
    let path = workspace.path().join("latin1.csv");
    std::fs::write(&path, b"name\ncaf\xe9\n").expect("write latin1");

    let err = scan_file(&path, &Dialect::default(), 10).expect_err("utf-8 decode");
    assert_eq!(err.kind(), ErrorKind::Io);

    let encoding = io_utils::resolve_encoding(Some("windows-1252")).expect("encoding");
    let dialect = Dialect::default().with_encoding(encoding);
    let descriptor = scan_file(&path, &dialect, 10).expect("scan latin1");
    assert_eq!(descriptor.columns[0].datatype, ColumnType::String);
}
