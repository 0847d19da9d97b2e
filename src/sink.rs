//! Bulk load sink: table preparation and transactional chunk writes.

use std::fmt;

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    error::{LoadError, Result},
    pipeline::{CancelFlag, Chunk},
    schema::CanonicalSchema,
    store::{Ddl, RelationalStore},
};

/// What to do when the target table already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistencePolicy {
    #[default]
    Fail,
    Replace,
    Append,
}

impl fmt::Display for ExistencePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExistencePolicy::Fail => "fail",
            ExistencePolicy::Replace => "replace",
            ExistencePolicy::Append => "append",
        })
    }
}

/// How an existing table's columns must relate to the load schema under
/// [`ExistencePolicy::Append`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendMode {
    /// The table may carry columns the load does not supply; they are left null.
    #[default]
    Superset,
    Exact,
}

/// Applies `policy` to `table` so that it is ready to receive rows of `schema`.
///
/// Every check runs before any row is written.
pub fn prepare_table(
    store: &mut dyn RelationalStore,
    table: &str,
    schema: &CanonicalSchema,
    policy: ExistencePolicy,
    append_mode: AppendMode,
) -> Result<()> {
    let exists = store.table_exists(table)?;
    match (policy, exists) {
        (ExistencePolicy::Fail, true) => {
            return Err(LoadError::TableExists {
                table: table.to_string(),
            });
        }
        (ExistencePolicy::Replace, true) => {
            info!("Replacing existing table '{table}'");
            store.execute_ddl(&Ddl::DropTable {
                table: table.to_string(),
                if_exists: true,
            })?;
        }
        (ExistencePolicy::Append, true) => {
            let existing = store.table_columns(table)?;
            check_append_compatibility(table, &existing, schema, append_mode)?;
            debug!("Appending to existing table '{table}'");
            return Ok(());
        }
        (_, false) => {}
    }
    store.execute_ddl(&Ddl::CreateTable {
        table: table.to_string(),
        schema: schema.clone(),
    })?;
    info!(
        "Created table '{table}' with {} column(s)",
        schema.columns.len()
    );
    Ok(())
}

fn check_append_compatibility(
    table: &str,
    existing: &[String],
    schema: &CanonicalSchema,
    mode: AppendMode,
) -> Result<()> {
    let missing: Vec<String> = schema
        .columns
        .iter()
        .filter(|column| !existing.contains(&column.name))
        .map(|column| column.name.clone())
        .collect();
    let unexpected: Vec<String> = match mode {
        AppendMode::Superset => Vec::new(),
        AppendMode::Exact => existing
            .iter()
            .filter(|name| schema.column_index(name).is_none())
            .cloned()
            .collect(),
    };
    if missing.is_empty() && unexpected.is_empty() {
        Ok(())
    } else {
        Err(LoadError::IncompatibleTable {
            table: table.to_string(),
            missing,
            unexpected,
        })
    }
}

/// Writes chunks of one schema into one table over a borrowed session.
pub struct BulkLoadSink<'a> {
    store: &'a mut dyn RelationalStore,
    table: &'a str,
    schema: &'a CanonicalSchema,
}

impl<'a> BulkLoadSink<'a> {
    pub fn new(
        store: &'a mut dyn RelationalStore,
        table: &'a str,
        schema: &'a CanonicalSchema,
    ) -> Self {
        Self {
            store,
            table,
            schema,
        }
    }

    /// Copies every chunk into the table inside the caller's transaction.
    ///
    /// Stops with [`LoadError::Cancelled`] when `cancel` is raised between
    /// chunks, and with the first chunk error otherwise.
    pub fn write_all<I>(&mut self, chunks: I, cancel: &CancelFlag) -> Result<u64>
    where
        I: IntoIterator<Item = Result<Chunk>>,
    {
        let mut rows = 0u64;
        for chunk in chunks {
            if cancel.is_cancelled() {
                return Err(LoadError::Cancelled);
            }
            let chunk = chunk?;
            rows += self.store.bulk_copy_stream(self.table, self.schema, &chunk)?;
        }
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        Ok(rows)
    }

    /// Loads one file's chunks in a transaction of their own. On any error
    /// the transaction is rolled back, so none of the file's rows are visible.
    pub fn load_file<I>(&mut self, chunks: I, cancel: &CancelFlag) -> Result<u64>
    where
        I: IntoIterator<Item = Result<Chunk>>,
    {
        self.store.begin_transaction()?;
        match self.write_all(chunks, cancel) {
            Ok(rows) => {
                self.store.commit()?;
                Ok(rows)
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    /// Runs [`prepare_table`] for this sink's table over its session.
    pub fn prepare(&mut self, policy: ExistencePolicy, append_mode: AppendMode) -> Result<()> {
        prepare_table(&mut *self.store, self.table, self.schema, policy, append_mode)
    }

    pub fn begin(&mut self) -> Result<()> {
        Ok(self.store.begin_transaction()?)
    }

    pub fn commit(&mut self) -> Result<()> {
        Ok(self.store.commit()?)
    }

    /// Rolls back the open transaction; a failed rollback is only logged.
    pub fn rollback(&mut self) {
        if let Err(err) = self.store.rollback() {
            warn!("Rollback on '{}' failed: {err}", self.table);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        data::Value,
        schema::{ColumnDef, ColumnType},
        store::memory::{MemorySession, MemoryStore},
    };

    fn schema() -> CanonicalSchema {
        CanonicalSchema::new(vec![
            ColumnDef::new("id", ColumnType::Integer),
            ColumnDef::new("name", ColumnType::String),
        ])
        .unwrap()
    }

    fn chunk(schema: &CanonicalSchema, index: usize, ids: &[i64]) -> Result<Chunk> {
        Ok(Chunk {
            index,
            schema: Arc::new(schema.clone()),
            rows: ids
                .iter()
                .map(|id| vec![Some(Value::Integer(*id)), Some(Value::String(format!("n{id}")))])
                .collect(),
        })
    }

    fn prepare(
        session: &mut MemorySession,
        schema: &CanonicalSchema,
        policy: ExistencePolicy,
        mode: AppendMode,
    ) -> Result<()> {
        prepare_table(session, "t", schema, policy, mode)
    }

    #[test]
    fn fail_policy_rejects_existing_table() {
        let store = MemoryStore::new();
        let mut session = store.session();
        let schema = schema();
        prepare(&mut session, &schema, ExistencePolicy::Fail, AppendMode::Superset).unwrap();
        let err = prepare(&mut session, &schema, ExistencePolicy::Fail, AppendMode::Superset)
            .unwrap_err();
        assert!(matches!(err, LoadError::TableExists { .. }));
    }

    #[test]
    fn replace_policy_drops_previous_rows() {
        let store = MemoryStore::new();
        let mut session = store.session();
        let schema = schema();
        prepare(&mut session, &schema, ExistencePolicy::Replace, AppendMode::Superset).unwrap();
        BulkLoadSink::new(&mut session, "t", &schema)
            .load_file(vec![chunk(&schema, 0, &[1, 2])], &CancelFlag::new())
            .unwrap();
        assert_eq!(store.row_count("t"), 2);

        prepare(&mut session, &schema, ExistencePolicy::Replace, AppendMode::Superset).unwrap();
        assert_eq!(store.row_count("t"), 0);
    }

    #[test]
    fn replace_inside_a_rolled_back_transaction_keeps_previous_rows() {
        let store = MemoryStore::new();
        let mut session = store.session();
        let schema = schema();
        prepare(&mut session, &schema, ExistencePolicy::Fail, AppendMode::Superset).unwrap();
        BulkLoadSink::new(&mut session, "t", &schema)
            .load_file(vec![chunk(&schema, 0, &[1, 2])], &CancelFlag::new())
            .unwrap();

        let mut sink = BulkLoadSink::new(&mut session, "t", &schema);
        sink.begin().unwrap();
        sink.prepare(ExistencePolicy::Replace, AppendMode::Superset).unwrap();
        sink.write_all(vec![chunk(&schema, 0, &[3])], &CancelFlag::new()).unwrap();
        sink.rollback();
        assert_eq!(store.row_count("t"), 2);
    }

    #[test]
    fn append_checks_column_compatibility() {
        let store = MemoryStore::new();
        let mut session = store.session();
        let narrow = schema();
        let wide = CanonicalSchema::new(vec![
            ColumnDef::new("id", ColumnType::Integer),
            ColumnDef::new("name", ColumnType::String),
            ColumnDef::new("extra", ColumnType::String),
        ])
        .unwrap();
        prepare(&mut session, &wide, ExistencePolicy::Append, AppendMode::Superset).unwrap();

        prepare(&mut session, &narrow, ExistencePolicy::Append, AppendMode::Superset).unwrap();
        match prepare(&mut session, &narrow, ExistencePolicy::Append, AppendMode::Exact) {
            Err(LoadError::IncompatibleTable { unexpected, .. }) => {
                assert_eq!(unexpected, vec!["extra".to_string()]);
            }
            other => panic!("unexpected result {other:?}"),
        }

        let other =
            CanonicalSchema::new(vec![ColumnDef::new("missing", ColumnType::String)]).unwrap();
        match prepare(&mut session, &other, ExistencePolicy::Append, AppendMode::Superset) {
            Err(LoadError::IncompatibleTable { missing, .. }) => {
                assert_eq!(missing, vec!["missing".to_string()]);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn failed_chunk_rolls_back_the_whole_file() {
        let store = MemoryStore::new();
        let mut session = store.session();
        let schema = schema();
        prepare(&mut session, &schema, ExistencePolicy::Fail, AppendMode::Superset).unwrap();
        let chunks = vec![
            chunk(&schema, 0, &[1, 2]),
            Err(LoadError::Transform {
                path: "a.csv".into(),
                chunk_index: 1,
                message: "boom".into(),
            }),
        ];
        let err = BulkLoadSink::new(&mut session, "t", &schema)
            .load_file(chunks, &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, LoadError::Transform { chunk_index: 1, .. }));
        assert_eq!(store.row_count("t"), 0);
    }

    #[test]
    fn cancellation_between_chunks_rolls_back() {
        let store = MemoryStore::new();
        let mut session = store.session();
        let schema = schema();
        prepare(&mut session, &schema, ExistencePolicy::Fail, AppendMode::Superset).unwrap();
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        let chunks = (0..3).map(|index| {
            if index == 1 {
                trigger.cancel();
            }
            chunk(&schema, index, &[index as i64])
        });
        let err = BulkLoadSink::new(&mut session, "t", &schema)
            .load_file(chunks, &cancel)
            .unwrap_err();
        assert!(matches!(err, LoadError::Cancelled));
        assert_eq!(store.row_count("t"), 0);
    }
}
