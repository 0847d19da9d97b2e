//! COPY text-format serialization for typed rows.
//!
//! COPY text format rules:
//! - NULL: `\N`
//! - Strings: backslash-escape `\`, tab, newline, carriage return; strip null bytes
//! - Booleans: `t` / `f`
//! - Floats: decimal representation, with `NaN` / `Infinity` / `-Infinity` literals
//! - Fields separated by tab, rows terminated by newline

use std::io::Write;

use crate::data::{Cell, Value};

pub fn format_copy_value(buf: &mut Vec<u8>, cell: &Cell) {
    let Some(value) = cell else {
        buf.extend_from_slice(b"\\N");
        return;
    };
    match value {
        Value::String(text) => {
            for byte in text.bytes() {
                match byte {
                    b'\\' => buf.extend_from_slice(b"\\\\"),
                    b'\t' => buf.extend_from_slice(b"\\t"),
                    b'\n' => buf.extend_from_slice(b"\\n"),
                    b'\r' => buf.extend_from_slice(b"\\r"),
                    0 => {}
                    _ => buf.push(byte),
                }
            }
        }
        Value::Integer(i) => {
            let _ = write!(buf, "{i}");
        }
        Value::Float(f) => {
            if f.is_nan() {
                buf.extend_from_slice(b"NaN");
            } else if f.is_infinite() {
                if *f > 0.0 {
                    buf.extend_from_slice(b"Infinity");
                } else {
                    buf.extend_from_slice(b"-Infinity");
                }
            } else {
                let _ = write!(buf, "{f}");
            }
        }
        Value::Boolean(b) => buf.push(if *b { b't' } else { b'f' }),
        Value::Date(d) => {
            let _ = write!(buf, "{}", d.format("%Y-%m-%d"));
        }
        Value::DateTime(dt) => {
            let _ = write!(buf, "{}", dt.format("%Y-%m-%d %H:%M:%S%.f"));
        }
        Value::Guid(g) => {
            let _ = write!(buf, "{g}");
        }
    }
}

pub fn format_copy_row(buf: &mut Vec<u8>, row: &[Cell]) {
    for (idx, cell) in row.iter().enumerate() {
        if idx > 0 {
            buf.push(b'\t');
        }
        format_copy_value(buf, cell);
    }
    buf.push(b'\n');
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn render(row: &[Cell]) -> String {
        let mut buf = Vec::new();
        format_copy_row(&mut buf, row);
        String::from_utf8(buf).expect("utf8")
    }

    #[test]
    fn escapes_text_and_marks_nulls() {
        let row = vec![
            Some(Value::String("a\tb\nc\rd\\e\0f".to_string())),
            None,
            Some(Value::Boolean(false)),
        ];
        assert_eq!(render(&row), "a\\tb\\nc\\rd\\\\ef\t\\N\tf\n");
    }

    #[test]
    fn formats_float_specials_and_temporals() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let row = vec![
            Some(Value::Float(f64::NAN)),
            Some(Value::Float(f64::NEG_INFINITY)),
            Some(Value::Date(date)),
            Some(Value::DateTime(date.and_hms_opt(10, 30, 0).unwrap())),
        ];
        assert_eq!(
            render(&row),
            "NaN\t-Infinity\t2024-01-15\t2024-01-15 10:30:00\n"
        );
    }
}
