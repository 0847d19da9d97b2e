//! PostgreSQL store using `COPY ... FROM STDIN` for bulk loads.

use std::io::Write;

use ::postgres::{Client, NoTls, error::SqlState};
use itertools::Itertools;
use log::debug;

use crate::{
    pipeline::Chunk,
    schema::CanonicalSchema,
    store::{
        Ddl, RelationalStore, StoreConnector, StoreError, StoreResult, copy_format,
        quote_identifier, quote_table_name, split_table_name,
    },
};

/// Buffer size for COPY data before flushing to the socket.
const COPY_FLUSH_BYTES: usize = 4 * 1024 * 1024;

const INTROSPECTION_SCHEMA: &str = "COALESCE($1::text, current_schema()::text)";

fn classify(err: ::postgres::Error) -> StoreError {
    if err.is_closed() {
        return StoreError::Transient(err.to_string());
    }
    match err.code() {
        Some(code)
            if [
                SqlState::CONNECTION_EXCEPTION,
                SqlState::CONNECTION_FAILURE,
                SqlState::CONNECTION_DOES_NOT_EXIST,
                SqlState::ADMIN_SHUTDOWN,
                SqlState::CRASH_SHUTDOWN,
                SqlState::CANNOT_CONNECT_NOW,
                SqlState::TOO_MANY_CONNECTIONS,
                SqlState::T_R_SERIALIZATION_FAILURE,
                SqlState::T_R_DEADLOCK_DETECTED,
            ]
            .contains(code) =>
        {
            StoreError::Transient(err.to_string())
        }
        Some(_) => StoreError::Fatal(err.to_string()),
        // No server error code: the failure happened on the wire.
        None => StoreError::Transient(err.to_string()),
    }
}

fn split_for_introspection(name: &str) -> (Option<&str>, &str) {
    match split_table_name(name) {
        Some((schema, table)) => (Some(schema), table),
        None => (None, name),
    }
}

pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    pub fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::connect(url, NoTls).map_err(classify)?;
        Ok(Self { client })
    }
}

impl RelationalStore for PostgresStore {
    fn execute_ddl(&mut self, ddl: &Ddl) -> StoreResult<()> {
        let sql = ddl.to_sql();
        debug!("postgres: {sql}");
        self.client.batch_execute(&sql).map_err(classify)
    }

    fn begin_transaction(&mut self) -> StoreResult<()> {
        self.client.batch_execute("BEGIN").map_err(classify)
    }

    fn commit(&mut self) -> StoreResult<()> {
        self.client.batch_execute("COMMIT").map_err(classify)
    }

    fn rollback(&mut self) -> StoreResult<()> {
        self.client.batch_execute("ROLLBACK").map_err(classify)
    }

    fn bulk_copy_stream(
        &mut self,
        table: &str,
        schema: &CanonicalSchema,
        chunk: &Chunk,
    ) -> StoreResult<u64> {
        if chunk.rows.is_empty() {
            return Ok(0);
        }
        let column_list = schema
            .columns
            .iter()
            .map(|c| quote_identifier(&c.name))
            .join(", ");
        let statement = format!(
            "COPY {} ({column_list}) FROM STDIN",
            quote_table_name(table)
        );
        let mut writer = self.client.copy_in(statement.as_str()).map_err(classify)?;
        let mut buf = Vec::with_capacity(COPY_FLUSH_BYTES.min(chunk.rows.len() * 64));
        for row in &chunk.rows {
            copy_format::format_copy_row(&mut buf, row);
            if buf.len() >= COPY_FLUSH_BYTES {
                writer
                    .write_all(&buf)
                    .map_err(|e| StoreError::Transient(format!("COPY write failed: {e}")))?;
                buf.clear();
            }
        }
        if !buf.is_empty() {
            writer
                .write_all(&buf)
                .map_err(|e| StoreError::Transient(format!("COPY write failed: {e}")))?;
        }
        writer.finish().map_err(classify)
    }

    fn table_exists(&mut self, name: &str) -> StoreResult<bool> {
        let (schema, table) = split_for_introspection(name);
        let query = format!(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema::text = {INTROSPECTION_SCHEMA} AND table_name::text = $2::text)"
        );
        let row = self
            .client
            .query_one(query.as_str(), &[&schema, &table])
            .map_err(classify)?;
        Ok(row.get(0))
    }

    fn table_columns(&mut self, name: &str) -> StoreResult<Vec<String>> {
        let (schema, table) = split_for_introspection(name);
        let query = format!(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema::text = {INTROSPECTION_SCHEMA} AND table_name::text = $2::text \
             ORDER BY ordinal_position"
        );
        let rows = self
            .client
            .query(query.as_str(), &[&schema, &table])
            .map_err(classify)?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }
}

/// Opens a fresh PostgreSQL session per call.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    url: String,
}

impl PostgresConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl StoreConnector for PostgresConnector {
    fn connect(&self) -> StoreResult<Box<dyn RelationalStore>> {
        Ok(Box::new(PostgresStore::connect(&self.url)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn introspection_splits_schema_qualified_names() {
        assert_eq!(split_for_introspection("events"), (None, "events"));
        assert_eq!(
            split_for_introspection("staging.events"),
            (Some("staging"), "events")
        );
    }
}
