//! Relational-store collaborator.
//!
//! The loader only needs a narrow surface from a database: DDL, explicit
//! transactions, a bulk-copy path, and table introspection. [`RelationalStore`]
//! is that surface; [`StoreConnector`] opens one session per worker.

pub mod copy_format;
pub mod memory;
pub mod pg;

use std::fmt;

use itertools::Itertools;
use thiserror::Error;

use crate::{pipeline::Chunk, schema::CanonicalSchema};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Connection or network failure; the operation may succeed if retried.
    #[error("transient: {0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Table DDL the loader issues. Rendered to SQL by [`Ddl::to_sql`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ddl {
    CreateTable {
        table: String,
        schema: CanonicalSchema,
    },
    DropTable {
        table: String,
        if_exists: bool,
    },
}

impl Ddl {
    pub fn to_sql(&self) -> String {
        match self {
            Ddl::CreateTable { table, schema } => {
                let columns = schema
                    .columns
                    .iter()
                    .map(|c| format!("{} {}", quote_identifier(&c.name), c.datatype.sql_type()))
                    .join(", ");
                format!("CREATE TABLE {} ({columns})", quote_table_name(table))
            }
            Ddl::DropTable { table, if_exists } => {
                let guard = if *if_exists { "IF EXISTS " } else { "" };
                format!("DROP TABLE {guard}{}", quote_table_name(table))
            }
        }
    }
}

impl fmt::Display for Ddl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

/// One session against the target store.
pub trait RelationalStore: Send {
    fn execute_ddl(&mut self, ddl: &Ddl) -> StoreResult<()>;

    fn begin_transaction(&mut self) -> StoreResult<()>;

    fn commit(&mut self) -> StoreResult<()>;

    fn rollback(&mut self) -> StoreResult<()>;

    /// Streams every row of `chunk` into `table` using the store's bulk path.
    /// `schema` names the target columns, in the chunk's row order.
    fn bulk_copy_stream(
        &mut self,
        table: &str,
        schema: &CanonicalSchema,
        chunk: &Chunk,
    ) -> StoreResult<u64>;

    fn table_exists(&mut self, name: &str) -> StoreResult<bool>;

    fn table_columns(&mut self, name: &str) -> StoreResult<Vec<String>>;
}

/// Opens independent sessions; one is held by each load worker.
pub trait StoreConnector: Send + Sync {
    fn connect(&self) -> StoreResult<Box<dyn RelationalStore>>;
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a possibly schema-qualified table name (`schema.table`).
pub fn quote_table_name(name: &str) -> String {
    split_table_name(name)
        .map(|(schema, table)| format!("{}.{}", quote_identifier(schema), quote_identifier(table)))
        .unwrap_or_else(|| quote_identifier(name))
}

pub(crate) fn split_table_name(name: &str) -> Option<(&str, &str)> {
    name.split_once('.')
        .filter(|(schema, table)| !schema.is_empty() && !table.is_empty())
}
