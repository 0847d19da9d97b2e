//! In-process relational store.
//!
//! Tables live behind a shared mutex so every session opened from one
//! [`MemoryStore`] sees the same committed data. Each session stages its
//! uncommitted work until `commit`, including DDL issued inside a
//! transaction, so a rollback also restores dropped or recreated tables.
//! Used for `--dry-run` loads and as the reference store in tests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use log::debug;

use crate::{
    data::Row,
    pipeline::Chunk,
    schema::CanonicalSchema,
    store::{Ddl, RelationalStore, StoreConnector, StoreError, StoreResult},
};

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryTable {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct Database {
    tables: HashMap<String, MemoryTable>,
    transient_failures: u32,
    copy_calls: u64,
}

/// Handle to a shared in-memory database; cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    db: Arc<Mutex<Database>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens a session; equivalent to [`StoreConnector::connect`].
    pub fn session(&self) -> MemorySession {
        MemorySession {
            db: Arc::clone(&self.db),
            txn: None,
        }
    }

    /// Committed contents of `table`.
    pub fn table(&self, name: &str) -> Option<MemoryTable> {
        self.lock().tables.get(name).cloned()
    }

    pub fn row_count(&self, name: &str) -> usize {
        self.lock()
            .tables
            .get(name)
            .map(|t| t.rows.len())
            .unwrap_or_default()
    }

    /// Makes the next `count` bulk-copy calls fail with a transient error.
    pub fn inject_transient_failures(&self, count: u32) {
        self.lock().transient_failures = count;
    }

    pub fn copy_calls(&self) -> u64 {
        self.lock().copy_calls
    }
}

impl StoreConnector for MemoryStore {
    fn connect(&self) -> StoreResult<Box<dyn RelationalStore>> {
        Ok(Box::new(self.session()))
    }
}

/// Uncommitted work of one session.
#[derive(Debug, Default)]
struct Transaction {
    /// Tables created or dropped in this transaction; `None` marks a drop.
    replaced: HashMap<String, Option<MemoryTable>>,
    /// Rows for tables that were not replaced in this transaction.
    appended: HashMap<String, Vec<Row>>,
}

/// One session over a [`MemoryStore`].
pub struct MemorySession {
    db: Arc<Mutex<Database>>,
    txn: Option<Transaction>,
}

impl MemorySession {
    fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Columns of `name` as this session sees it, staged DDL included.
    fn visible_columns(&self, name: &str) -> Option<Vec<String>> {
        if let Some(replaced) = self.txn.as_ref().and_then(|txn| txn.replaced.get(name)) {
            return replaced.as_ref().map(|t| t.columns.clone());
        }
        self.lock().tables.get(name).map(|t| t.columns.clone())
    }

    fn replace_table(&mut self, name: &str, table: Option<MemoryTable>) {
        if let Some(txn) = self.txn.as_mut() {
            txn.appended.remove(name);
            txn.replaced.insert(name.to_string(), table);
            return;
        }
        let mut db = self.lock();
        match table {
            Some(table) => {
                db.tables.insert(name.to_string(), table);
            }
            None => {
                db.tables.remove(name);
            }
        }
    }
}

fn missing_relation(name: &str) -> StoreError {
    StoreError::Fatal(format!("relation \"{name}\" does not exist"))
}

impl RelationalStore for MemorySession {
    fn execute_ddl(&mut self, ddl: &Ddl) -> StoreResult<()> {
        debug!("memory store: {ddl}");
        match ddl {
            Ddl::CreateTable { table, schema } => {
                if self.visible_columns(table).is_some() {
                    return Err(StoreError::Fatal(format!(
                        "relation \"{table}\" already exists"
                    )));
                }
                let created = MemoryTable {
                    columns: schema.names(),
                    rows: Vec::new(),
                };
                self.replace_table(table, Some(created));
            }
            Ddl::DropTable { table, if_exists } => {
                if self.visible_columns(table).is_none() {
                    return if *if_exists {
                        Ok(())
                    } else {
                        Err(missing_relation(table))
                    };
                }
                self.replace_table(table, None);
            }
        }
        Ok(())
    }

    fn begin_transaction(&mut self) -> StoreResult<()> {
        if self.txn.is_some() {
            return Err(StoreError::Fatal(
                "a transaction is already in progress".to_string(),
            ));
        }
        self.txn = Some(Transaction::default());
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| StoreError::Fatal("no transaction in progress".to_string()))?;
        let mut db = self.lock();
        if let Some(table) = txn.appended.keys().find(|t| !db.tables.contains_key(*t)) {
            return Err(StoreError::Fatal(format!(
                "relation \"{table}\" was dropped mid-transaction"
            )));
        }
        for (name, table) in txn.replaced {
            match table {
                Some(table) => {
                    db.tables.insert(name, table);
                }
                None => {
                    db.tables.remove(&name);
                }
            }
        }
        for (name, rows) in txn.appended {
            if let Some(target) = db.tables.get_mut(&name) {
                target.rows.extend(rows);
            }
        }
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        self.txn = None;
        Ok(())
    }

    fn bulk_copy_stream(
        &mut self,
        table: &str,
        schema: &CanonicalSchema,
        chunk: &Chunk,
    ) -> StoreResult<u64> {
        {
            let mut db = self.lock();
            db.copy_calls += 1;
            if db.transient_failures > 0 {
                db.transient_failures -= 1;
                return Err(StoreError::Transient(
                    "connection reset during copy".to_string(),
                ));
            }
        }
        let columns = self
            .visible_columns(table)
            .ok_or_else(|| missing_relation(table))?;
        let positions = schema
            .columns
            .iter()
            .map(|column| {
                columns
                    .iter()
                    .position(|name| *name == column.name)
                    .ok_or_else(|| {
                        StoreError::Fatal(format!(
                            "column \"{}\" of relation \"{table}\" does not exist",
                            column.name
                        ))
                    })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        let txn = self
            .txn
            .as_mut()
            .ok_or_else(|| StoreError::Fatal("copy outside of a transaction".to_string()))?;
        let rows = match txn.replaced.get_mut(table) {
            Some(Some(created)) => &mut created.rows,
            _ => txn.appended.entry(table.to_string()).or_default(),
        };
        for source in &chunk.rows {
            if source.len() != positions.len() {
                return Err(StoreError::Fatal(format!(
                    "row has {} value(s) but copy lists {} column(s)",
                    source.len(),
                    positions.len()
                )));
            }
            let mut row: Row = vec![None; columns.len()];
            for (value, &position) in source.iter().zip(positions.iter()) {
                row[position] = value.clone();
            }
            rows.push(row);
        }
        Ok(chunk.rows.len() as u64)
    }

    fn table_exists(&mut self, name: &str) -> StoreResult<bool> {
        Ok(self.visible_columns(name).is_some())
    }

    fn table_columns(&mut self, name: &str) -> StoreResult<Vec<String>> {
        self.visible_columns(name).ok_or_else(|| missing_relation(name))
    }
}
