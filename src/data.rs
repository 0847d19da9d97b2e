//! Typed cell values and the parsers that turn raw CSV fields into them.
//!
//! A field is parsed under the canonical column type, which may be wider than
//! the type inferred for the file it came from. Every value accepted under the
//! narrower type must therefore parse under the wider one: integers as floats
//! and plain dates as midnight timestamps.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::ColumnType;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Guid(Uuid),
}

/// A single cell; `None` is the null sentinel used for absent columns.
pub type Cell = Option<Value>;

pub type Row = Vec<Cell>;

const DATE_DISPLAY: &str = "%Y-%m-%d";
const DATETIME_DISPLAY: &str = "%Y-%m-%d %H:%M:%S";

impl Value {
    pub fn as_display(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Date(d) => d.format(DATE_DISPLAY).to_string(),
            Value::DateTime(dt) => dt.format(DATETIME_DISPLAY).to_string(),
            Value::Guid(g) => g.to_string(),
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::String(_) => ColumnType::String,
            Value::Integer(_) => ColumnType::Integer,
            Value::Float(_) => ColumnType::Float,
            Value::Boolean(_) => ColumnType::Boolean,
            Value::Date(_) => ColumnType::Date,
            Value::DateTime(_) => ColumnType::DateTime,
            Value::Guid(_) => ColumnType::Guid,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_display())
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%Y/%m/%d", "%d-%m-%Y"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

pub fn parse_naive_date(value: &str) -> Result<NaiveDate, String> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
        .ok_or_else(|| format!("Failed to parse '{value}' as date"))
}

/// Strict timestamp parsing; plain dates are rejected so inference can tell
/// Date columns from DateTime columns.
pub fn parse_naive_datetime(value: &str) -> Result<NaiveDateTime, String> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .ok_or_else(|| format!("Failed to parse '{value}' as datetime"))
}

/// Timestamp parsing for values loaded into a DateTime column. A plain date
/// becomes midnight of that day.
pub fn parse_datetime_lenient(value: &str) -> Result<NaiveDateTime, String> {
    parse_naive_datetime(value).or_else(|err| {
        parse_naive_date(value)
            .map(|date| date.and_time(NaiveTime::MIN))
            .map_err(|_| err)
    })
}

pub fn parse_boolean(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

pub fn parse_guid(value: &str) -> Result<Uuid, String> {
    let trimmed = value.trim().trim_matches(|c| matches!(c, '{' | '}'));
    Uuid::parse_str(trimmed).map_err(|_| format!("Failed to parse '{value}' as GUID"))
}

/// Lowercases `name` and replaces anything outside `[A-Za-z0-9]` with `_`.
pub fn normalize_column_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Parses a raw field under `ty`. Empty fields are null.
pub fn parse_typed_value(value: &str, ty: &ColumnType) -> Result<Cell, String> {
    if value.is_empty() {
        return Ok(None);
    }
    let invalid = |what: &str| format!("Failed to parse '{value}' as {what}");
    let parsed = match ty {
        ColumnType::String => Value::String(value.to_string()),
        ColumnType::Integer => Value::Integer(value.parse().map_err(|_| invalid("integer"))?),
        ColumnType::Float => Value::Float(value.parse().map_err(|_| invalid("float"))?),
        ColumnType::Boolean => {
            Value::Boolean(parse_boolean(value).ok_or_else(|| invalid("boolean"))?)
        }
        ColumnType::Date => Value::Date(parse_naive_date(value)?),
        ColumnType::DateTime => Value::DateTime(parse_datetime_lenient(value)?),
        ColumnType::Guid => Value::Guid(parse_guid(value)?),
    };
    Ok(Some(parsed))
}

/// Binds a cell value for expression evaluation. Temporal and GUID values are
/// exposed as their display strings.
pub fn value_to_evalexpr(value: &Value) -> evalexpr::Value {
    match value {
        Value::Integer(i) => evalexpr::Value::Int(*i),
        Value::Float(f) => evalexpr::Value::Float(*f),
        Value::Boolean(b) => evalexpr::Value::Boolean(*b),
        Value::String(s) => evalexpr::Value::String(s.clone()),
        other => evalexpr::Value::String(other.as_display()),
    }
}
