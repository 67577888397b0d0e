// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Warehouse client interface and the Postgres-protocol implementation

use super::statement::{BulkLoad, Unload};
use crate::credentials::CredentialProvider;
use crate::table::Table;
use crate::{Error, Result};
use arrow::array::{
    ArrayRef, BooleanArray, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array,
    RecordBatch, StringArray,
};
use arrow::datatypes::{DataType, Field, Schema};
use async_trait::async_trait;
use diagnostics::*;
use sqlx::postgres::{PgColumn, PgConnection, PgRow};
use sqlx::{Column, Connection, Executor, Row, TypeInfo};
use std::fmt;
use std::sync::Arc;

#[async_trait]
pub trait WarehouseClient: Send + Sync + fmt::Debug {
    async fn connect(&self) -> Result<Box<dyn WarehouseConnection>>;
}

#[async_trait]
pub trait WarehouseConnection: Send {
    /// Run one statement, discarding any result.
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Run a query and return its rows.
    async fn query(&mut self, sql: &str) -> Result<Table>;

    async fn close(self: Box<Self>) -> Result<()>;

    async fn bulk_unload(&mut self, unload: &Unload) -> Result<()> {
        self.execute(&unload.render()).await
    }

    /// Run the load statements in one transaction.
    async fn bulk_load(&mut self, load: &BulkLoad) -> Result<()> {
        self.execute_in_transaction(&load.statements()?).await
    }

    /// `BEGIN`, the statements, `COMMIT`; `ROLLBACK` if any statement fails.
    async fn execute_in_transaction(&mut self, statements: &[String]) -> Result<()> {
        self.execute("BEGIN").await?;
        for statement in statements {
            if let Err(e) = self.execute(statement).await {
                if let Err(rollback) = self.execute("ROLLBACK").await {
                    let rollback = rollback.to_string();
                    log_warn!("Rollback failed: {rollback}", rollback: rollback.as_str());
                }
                return Err(e);
            }
        }
        self.execute("COMMIT").await
    }
}

/// Redshift (or any Postgres-protocol warehouse) through sqlx.
#[derive(Debug, Clone)]
pub struct PgWarehouseClient {
    credentials: Arc<dyn CredentialProvider>,
}

impl PgWarehouseClient {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl WarehouseClient for PgWarehouseClient {
    async fn connect(&self) -> Result<Box<dyn WarehouseConnection>> {
        let creds = self.credentials.warehouse_credentials().await?;
        let conn = PgConnection::connect(&creds.connection_url()?).await?;
        debug!("Connected to warehouse {host}", host: creds.host.as_str());
        Ok(Box::new(PgWarehouseConnection { conn }))
    }
}

struct PgWarehouseConnection {
    conn: PgConnection,
}

#[async_trait]
impl WarehouseConnection for PgWarehouseConnection {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        // A bare &str goes through the simple query protocol.
        (&mut self.conn).execute(sql).await?;
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<Table> {
        let rows: Vec<PgRow> = (&mut self.conn).fetch_all(sql).await?;
        let columns: Vec<PgColumn> = match rows.first() {
            Some(row) => row.columns().to_vec(),
            None => (&mut self.conn).describe(sql).await?.columns().to_vec(),
        };
        rows_to_table(&columns, &rows)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Boolean,
    Text,
}

impl ColumnKind {
    fn from_type_name(name: &str) -> Self {
        match name {
            "INT2" => ColumnKind::Int16,
            "INT4" => ColumnKind::Int32,
            "INT8" => ColumnKind::Int64,
            "FLOAT4" => ColumnKind::Float32,
            "FLOAT8" => ColumnKind::Float64,
            "BOOL" => ColumnKind::Boolean,
            _ => ColumnKind::Text,
        }
    }

    fn data_type(self) -> DataType {
        match self {
            ColumnKind::Int16 => DataType::Int16,
            ColumnKind::Int32 => DataType::Int32,
            ColumnKind::Int64 => DataType::Int64,
            ColumnKind::Float32 => DataType::Float32,
            ColumnKind::Float64 => DataType::Float64,
            ColumnKind::Boolean => DataType::Boolean,
            ColumnKind::Text => DataType::Utf8,
        }
    }
}

fn column_array(kind: ColumnKind, rows: &[PgRow], i: usize) -> Result<ArrayRef> {
    let array: ArrayRef = match kind {
        ColumnKind::Int16 => Arc::new(Int16Array::from(
            rows.iter()
                .map(|r| r.try_get::<Option<i16>, _>(i))
                .collect::<std::result::Result<Vec<_>, _>>()?,
        )),
        ColumnKind::Int32 => Arc::new(Int32Array::from(
            rows.iter()
                .map(|r| r.try_get::<Option<i32>, _>(i))
                .collect::<std::result::Result<Vec<_>, _>>()?,
        )),
        ColumnKind::Int64 => Arc::new(Int64Array::from(
            rows.iter()
                .map(|r| r.try_get::<Option<i64>, _>(i))
                .collect::<std::result::Result<Vec<_>, _>>()?,
        )),
        ColumnKind::Float32 => Arc::new(Float32Array::from(
            rows.iter()
                .map(|r| r.try_get::<Option<f32>, _>(i))
                .collect::<std::result::Result<Vec<_>, _>>()?,
        )),
        ColumnKind::Float64 => Arc::new(Float64Array::from(
            rows.iter()
                .map(|r| r.try_get::<Option<f64>, _>(i))
                .collect::<std::result::Result<Vec<_>, _>>()?,
        )),
        ColumnKind::Boolean => Arc::new(BooleanArray::from(
            rows.iter()
                .map(|r| r.try_get::<Option<bool>, _>(i))
                .collect::<std::result::Result<Vec<_>, _>>()?,
        )),
        // Values arrive in text format, so any type reads as its text form.
        ColumnKind::Text => Arc::new(StringArray::from(
            rows.iter()
                .map(|r| r.try_get_unchecked::<Option<String>, _>(i))
                .collect::<std::result::Result<Vec<_>, _>>()?,
        )),
    };
    Ok(array)
}

fn rows_to_table(columns: &[PgColumn], rows: &[PgRow]) -> Result<Table> {
    let kinds: Vec<ColumnKind> = columns
        .iter()
        .map(|c| ColumnKind::from_type_name(c.type_info().name()))
        .collect();
    let schema = Arc::new(Schema::new(
        columns
            .iter()
            .zip(&kinds)
            .map(|(c, k)| Field::new(c.name(), k.data_type(), true))
            .collect::<Vec<_>>(),
    ));

    if rows.is_empty() {
        return Ok(Table::empty(schema));
    }

    let arrays = kinds
        .iter()
        .enumerate()
        .map(|(i, kind)| column_array(*kind, rows, i))
        .collect::<Result<Vec<_>>>()?;
    let batch = RecordBatch::try_new(schema, arrays)
        .map_err(|e| Error::Integrity(format!("warehouse result: {e}")))?;
    Ok(Table::from(batch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_mapping() {
        assert_eq!(ColumnKind::from_type_name("INT8").data_type(), DataType::Int64);
        assert_eq!(ColumnKind::from_type_name("FLOAT4").data_type(), DataType::Float32);
        assert_eq!(ColumnKind::from_type_name("BOOL").data_type(), DataType::Boolean);
        assert_eq!(ColumnKind::from_type_name("NUMERIC").data_type(), DataType::Utf8);
        assert_eq!(ColumnKind::from_type_name("TIMESTAMPTZ").data_type(), DataType::Utf8);
    }
}
