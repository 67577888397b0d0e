// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Local query engine over an in-process DuckDB connection
//!
//! Datasets and sheets never load their contents into the engine. Queries
//! reference them as virtual tables (`read_parquet(...)`, `read_gsheet(...)`)
//! and DuckDB reads the physical location directly.

use crate::credentials::{ServiceToken, StorageCredentials};
use crate::table::Table;
use crate::{Error, Result};
use arrow::array::RecordBatch;
use diagnostics::*;
use duckdb::Connection;
use parquet::arrow::ArrowWriter;
use polars::prelude::DataFrame;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared handle on one DuckDB connection. Clones share the connection.
#[derive(Clone)]
pub struct QueryEngine {
    conn: Arc<Mutex<Connection>>,
}

impl fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEngine").finish_non_exhaustive()
    }
}

impl QueryEngine {
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Integrity("query engine connection poisoned".to_string()))
    }

    /// Run one or more statements, discarding results.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        debug!("DuckDB execute: {sql}", sql: sql);
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }

    /// Run a query and materialize its result.
    pub fn collect(&self, sql: &str) -> Result<Table> {
        debug!("DuckDB query: {sql}", sql: sql);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let arrow = stmt.query_arrow([])?;
        let statement_schema = arrow.get_schema();
        let batches: Vec<RecordBatch> = arrow.collect();
        let schema = batches
            .first()
            .map(RecordBatch::schema)
            .unwrap_or(statement_schema);
        Table::try_new(schema, batches)
    }

    /// A handle that runs `sql` only when materialized.
    #[must_use]
    pub fn query(&self, sql: impl Into<String>) -> QueryResult {
        QueryResult {
            engine: self.clone(),
            sql: sql.into(),
        }
    }

    /// Make `s3://` locations readable and writable by the engine.
    pub fn register_storage_secret(
        &self,
        credentials: &StorageCredentials,
        region: &str,
        endpoint: Option<&str>,
    ) -> Result<()> {
        let mut options = vec![
            "TYPE s3".to_string(),
            format!("KEY_ID {}", quote_literal(&credentials.access_key_id)),
            format!("SECRET {}", quote_literal(&credentials.secret_access_key)),
            format!("REGION {}", quote_literal(region)),
        ];
        if let Some(token) = &credentials.session_token {
            options.push(format!("SESSION_TOKEN {}", quote_literal(token)));
        }
        if let Some(endpoint) = endpoint {
            let host = endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/');
            options.push(format!("ENDPOINT {}", quote_literal(host)));
            options.push("URL_STYLE 'path'".to_string());
            if endpoint.starts_with("http://") {
                options.push("USE_SSL false".to_string());
            }
        }

        self.lock()?.execute_batch(&format!(
            "INSTALL httpfs; LOAD httpfs; CREATE OR REPLACE SECRET arrows_s3 ({});",
            options.join(", ")
        ))?;
        debug!("Registered storage secret for region {region}", region: region);
        Ok(())
    }

    /// Load the community `gsheets` extension and register an access token.
    pub fn register_sheets_secret(&self, token: &ServiceToken) -> Result<()> {
        self.lock()?.execute_batch(&format!(
            "INSTALL gsheets FROM community; LOAD gsheets; \
             CREATE OR REPLACE SECRET arrows_gsheet (TYPE gsheet, PROVIDER access_token, TOKEN {});",
            quote_literal(&token.access_token)
        ))?;
        debug!("Registered spreadsheet secret");
        Ok(())
    }
}

/// Lazily materialized query result.
#[derive(Debug, Clone)]
pub struct QueryResult {
    engine: QueryEngine,
    sql: String,
}

impl QueryResult {
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn to_table(&self) -> Result<Table> {
        self.engine.collect(&self.sql)
    }

    pub fn to_dataframe(&self) -> Result<DataFrame> {
        self.to_table()?.to_dataframe()
    }

    pub fn row_count(&self) -> Result<u64> {
        let sql = format!(
            "SELECT count(*) FROM ({})",
            self.sql.trim().trim_end_matches(';')
        );
        let conn = self.engine.lock()?;
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        u64::try_from(count).map_err(|_| Error::Integrity(format!("negative row count {count}")))
    }
}

/// A table written to a temporary Parquet file so the engine can read it.
/// The file is removed when this value is dropped.
#[derive(Debug)]
pub struct StagedTable {
    file: tempfile::NamedTempFile,
}

impl StagedTable {
    pub fn new(table: &Table) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix("arrows-")
            .suffix(".parquet")
            .tempfile()?;
        let mut writer = ArrowWriter::try_new(file.reopen()?, table.schema(), None)?;
        for batch in table.batches() {
            writer.write(batch)?;
        }
        writer.close()?;
        Ok(Self { file })
    }

    /// `read_parquet('<file>')`
    #[must_use]
    pub fn source(&self) -> String {
        format!(
            "read_parquet({})",
            quote_literal(&self.file.path().display().to_string())
        )
    }
}

/// `'text'` with embedded quotes doubled.
#[must_use]
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// `"name"` with embedded quotes doubled.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
