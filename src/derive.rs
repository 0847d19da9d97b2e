//! Derived columns as a chunk transform.
//!
//! Each definition has the form `name=expression` or `name:type=expression`. The
//! expression is evaluated with `evalexpr` once per row, with every input
//! column bound under its normalized name and as `c{index}`. Null inputs are
//! bound as the empty value.

use anyhow::{Context, Result, anyhow, ensure};
use evalexpr::{
    ContextWithMutableVariables, HashMapContext, Value as EvalValue, eval_with_context,
};

use crate::{
    data::{Cell, normalize_column_name, parse_typed_value, value_to_evalexpr},
    pipeline::{Chunk, ChunkTransform},
    schema::{CanonicalSchema, ColumnDef, ColumnType},
};

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedColumn {
    pub name: String,
    pub datatype: ColumnType,
    pub expression: String,
}

impl DerivedColumn {
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.splitn(2, '=');
        let target = parts
            .next()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("Derived column is missing a name"))?;
        let (name, datatype) = match target.split_once(':') {
            Some((name, ty)) => (
                name.trim(),
                ty.trim()
                    .parse::<ColumnType>()
                    .with_context(|| format!("Derived column '{}'", name.trim()))?,
            ),
            None => (target, ColumnType::String),
        };
        ensure!(!name.is_empty(), "Derived column is missing a name");
        let expression = parts
            .next()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("Derived column '{name}' is missing an expression"))?;
        Ok(DerivedColumn {
            name: name.to_string(),
            datatype,
            expression: expression.to_string(),
        })
    }

    pub fn evaluate(&self, schema: &CanonicalSchema, row: &[Cell]) -> Result<Cell> {
        let mut context: HashMapContext = HashMapContext::new();
        for (idx, column) in schema.columns.iter().enumerate() {
            let bound = match row.get(idx).and_then(|v| v.as_ref()) {
                Some(value) => value_to_evalexpr(value),
                None => EvalValue::Empty,
            };
            context
                .set_value(normalize_column_name(&column.name), bound.clone())
                .with_context(|| format!("Binding column '{}'", column.name))?;
            context
                .set_value(format!("c{idx}"), bound)
                .with_context(|| format!("Binding column index {idx}"))?;
        }

        let result = eval_with_context(&self.expression, &context)
            .with_context(|| format!("Evaluating expression for column '{}'", self.name))?;
        let rendered = match result {
            EvalValue::String(s) => s,
            EvalValue::Int(i) => i.to_string(),
            EvalValue::Float(f) => f.to_string(),
            EvalValue::Boolean(b) => b.to_string(),
            EvalValue::Tuple(values) => values
                .into_iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("|"),
            EvalValue::Empty => String::new(),
        };
        parse_typed_value(&rendered, &self.datatype)
            .map_err(|err| anyhow!("Derived column '{}': {err}", self.name))
    }
}

pub fn parse_derived_columns(specs: &[String]) -> Result<Vec<DerivedColumn>> {
    specs
        .iter()
        .map(|spec| DerivedColumn::parse(spec))
        .collect()
}

/// Appends one column per [`DerivedColumn`] to every row.
#[derive(Debug, Clone)]
pub struct DeriveTransform {
    columns: Vec<DerivedColumn>,
}

impl DeriveTransform {
    pub fn new(columns: Vec<DerivedColumn>) -> Self {
        Self { columns }
    }

    pub fn from_specs(specs: &[String]) -> Result<Self> {
        Ok(Self::new(parse_derived_columns(specs)?))
    }

    pub fn columns(&self) -> &[DerivedColumn] {
        &self.columns
    }
}

impl ChunkTransform for DeriveTransform {
    fn output_schema(&self, input: &CanonicalSchema) -> Result<CanonicalSchema> {
        let mut columns = input.columns.clone();
        for derived in &self.columns {
            ensure!(
                input.column_index(&derived.name).is_none(),
                "Derived column '{}' already exists in the input",
                derived.name
            );
            columns.push(ColumnDef::new(derived.name.clone(), derived.datatype));
        }
        CanonicalSchema::new(columns)
    }

    fn apply(&self, chunk: Chunk) -> Result<Chunk> {
        let schema = std::sync::Arc::new(self.output_schema(&chunk.schema)?);
        let width = chunk.schema.len();
        let rows = chunk
            .rows
            .into_iter()
            .enumerate()
            .map(|(offset, mut row)| {
                ensure!(
                    row.len() == width,
                    "Row {offset} of chunk {} has {} value(s) for {width} column(s)",
                    chunk.index,
                    row.len()
                );
                for derived in &self.columns {
                    let value = derived
                        .evaluate(&chunk.schema, &row[..width])
                        .with_context(|| format!("Row {offset} of chunk {}", chunk.index))?;
                    row.push(value);
                }
                Ok(row)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Chunk {
            index: chunk.index,
            schema,
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::data::Value;

    fn input_schema() -> CanonicalSchema {
        CanonicalSchema::new(vec![
            ColumnDef::new("Unit Price", ColumnType::Float),
            ColumnDef::new("qty", ColumnType::Integer),
        ])
        .unwrap()
    }

    #[test]
    fn parse_accepts_optional_type() {
        let plain = DerivedColumn::parse("label = \"x\"").unwrap();
        assert_eq!(plain.name, "label");
        assert_eq!(plain.datatype, ColumnType::String);

        let typed = DerivedColumn::parse("total:float=unit_price * qty").unwrap();
        assert_eq!(typed.datatype, ColumnType::Float);
        assert_eq!(typed.expression, "unit_price * qty");

        assert!(DerivedColumn::parse("=1").is_err());
        assert!(DerivedColumn::parse("x=").is_err());
        assert!(DerivedColumn::parse("x:blob=1").is_err());
    }

    #[test]
    fn apply_appends_typed_values() {
        let transform = DeriveTransform::from_specs(&[
            "total:float=unit_price * c1".to_string(),
            "big:boolean=qty > 2".to_string(),
        ])
        .unwrap();
        let chunk = Chunk {
            index: 0,
            schema: Arc::new(input_schema()),
            rows: vec![vec![Some(Value::Float(2.5)), Some(Value::Integer(4))]],
        };
        let output = transform.apply(chunk).unwrap();
        assert_eq!(output.schema.names(), vec!["Unit Price", "qty", "total", "big"]);
        assert_eq!(output.rows[0][2], Some(Value::Float(10.0)));
        assert_eq!(output.rows[0][3], Some(Value::Boolean(true)));
    }

    #[test]
    fn output_schema_rejects_name_collisions() {
        let transform = DeriveTransform::from_specs(&["qty=1".to_string()]).unwrap();
        assert!(transform.output_schema(&input_schema()).is_err());
    }

    #[test]
    fn evaluation_failure_is_reported() {
        let transform =
            DeriveTransform::from_specs(&["x:integer=missing + 1".to_string()]).unwrap();
        let chunk = Chunk {
            index: 3,
            schema: Arc::new(input_schema()),
            rows: vec![vec![None, Some(Value::Integer(1))]],
        };
        let err = transform.apply(chunk).unwrap_err();
        assert!(format!("{err:#}").contains("chunk 3"));
    }

    #[test]
    fn short_rows_are_rejected_without_panicking() {
        let transform = DeriveTransform::from_specs(&["flag=true".to_string()]).unwrap();
        let chunk = Chunk {
            index: 1,
            schema: Arc::new(input_schema()),
            rows: vec![vec![Some(Value::Float(2.0))]],
        };
        let err = transform.apply(chunk).unwrap_err();
        assert!(err.to_string().contains("has 1 value(s) for 2 column(s)"), "{err}");
    }
}
