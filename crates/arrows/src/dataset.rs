// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Dataset handle: a logical table stored as Parquet files under one prefix
//!
//! A `Dataset` is identified by its path alone. Two handles with the same
//! path address the same storage. Nothing is written until a transfer-in
//! operation runs, and nothing is removed except by [`Dataset::clear`] and
//! [`Dataset::delete`].

use crate::engine::{QueryEngine, QueryResult, StagedTable, quote_literal};
use crate::rewrite::{SELF_PLACEHOLDER, wrap_placeholder_in_cte};
use crate::storage::{DatasetPath, ListType, ObjectStorage, StorageBackend};
use crate::table::Table;
use crate::template::{Template, TemplateVars};
use crate::warehouse::{LoadMode, Warehouse};
use crate::{Error, Result};
use diagnostics::*;
use polars::prelude::DataFrame;
use std::fmt;
use std::sync::Arc;

/// Name of the CTE that dataset queries see in place of `self`.
pub const DATASET_CTE: &str = "temp_s3_dataset_table";

/// Rows per file when a dataframe is written.
pub const DATAFRAME_ROWS_PER_FILE: usize = 512_000;

/// How a table is written into a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteBackend {
    /// Parquet files written directly, at most `max_rows_per_file` rows each.
    Columnar { max_rows_per_file: usize },
    /// DuckDB `COPY ... TO` with a target file size, e.g. `"1GB"`.
    QueryEngine { file_size: String },
}

impl Default for WriteBackend {
    fn default() -> Self {
        WriteBackend::Columnar {
            max_rows_per_file: 1_000_000,
        }
    }
}

/// How a dataset is read back into a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadBackend {
    #[default]
    Columnar,
    QueryEngine,
}

#[derive(Clone)]
pub struct Dataset {
    path: DatasetPath,
    storage: Arc<ObjectStorage>,
    engine: QueryEngine,
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Dataset").field(&self.path.as_str()).finish()
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dataset: {}", self.path)
    }
}

impl PartialEq for Dataset {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for Dataset {}

impl Dataset {
    pub fn new(path: DatasetPath, storage: Arc<ObjectStorage>, engine: QueryEngine) -> Self {
        Self {
            path,
            storage,
            engine,
        }
    }

    /// Use `path` if given, otherwise a fresh path under `bucket`.
    /// Storage is not touched.
    pub fn create(
        path: Option<&str>,
        bucket: Option<&str>,
        storage: Arc<ObjectStorage>,
        engine: QueryEngine,
    ) -> Result<Self> {
        let path = match (path, bucket) {
            (Some(path), _) => DatasetPath::parse(path)?,
            (None, Some(bucket)) => DatasetPath::generate(bucket)?,
            (None, None) => {
                return Err(Error::Configuration(
                    "dataset needs a path or a bucket".to_string(),
                ));
            }
        };
        Ok(Self::new(path, storage, engine))
    }

    #[must_use]
    pub fn path(&self) -> &DatasetPath {
        &self.path
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<ObjectStorage> {
        &self.storage
    }

    /// Replace the contents with `table`. A failed write is not rolled back.
    pub async fn from_table(&self, table: &Table, backend: &WriteBackend) -> Result<()> {
        self.clear().await?;

        let result = match backend {
            WriteBackend::Columnar { max_rows_per_file } => self
                .storage
                .write_columnar(table, &self.path, *max_rows_per_file)
                .await
                .map(|_| ()),
            WriteBackend::QueryEngine { file_size } => {
                self.copy_with_engine(table, file_size).await
            }
        };

        if let Err(e) = &result {
            let error = e.to_string();
            log_error!("Writing {path} failed: {error}", path: self.path.as_str(), error: error.as_str());
        }
        result
    }

    /// Write `frame`, at most [`DATAFRAME_ROWS_PER_FILE`] rows per file.
    pub async fn from_dataframe(&self, frame: &DataFrame) -> Result<()> {
        let table = Table::from_dataframe(frame)?;
        self.from_table(
            &table,
            &WriteBackend::Columnar {
                max_rows_per_file: DATAFRAME_ROWS_PER_FILE,
            },
        )
        .await
    }

    /// Give the engine current storage credentials. Session tokens expire,
    /// so this runs before every engine access on S3.
    async fn prepare_engine(&self) -> Result<()> {
        if *self.storage.backend() != StorageBackend::S3 {
            return Ok(());
        }
        let credentials = self.storage.credentials().storage_credentials().await?;
        self.engine.register_storage_secret(
            &credentials,
            self.storage.region(),
            self.storage.endpoint(),
        )
    }

    async fn copy_with_engine(&self, table: &Table, file_size: &str) -> Result<()> {
        self.prepare_engine().await?;
        let staged = StagedTable::new(table)?;
        self.storage.prepare_directory(&self.path)?;
        self.engine.execute_batch(&format!(
            "COPY (SELECT * FROM {}) TO {} (FORMAT parquet, FILE_SIZE_BYTES {})",
            staged.source(),
            quote_literal(&self.storage.engine_location(&self.path)),
            quote_literal(file_size),
        ))?;
        info!(
            "Wrote {rows} rows to {path} with the query engine",
            rows: table.num_rows(),
            path: self.path.as_str(),
        );
        Ok(())
    }

    /// Read every file under the path into one table.
    pub async fn to_table(&self, backend: ReadBackend) -> Result<Table> {
        match backend {
            ReadBackend::Columnar => self.storage.read_columnar(&self.path).await,
            ReadBackend::QueryEngine => {
                self.prepare_engine().await?;
                self.engine
                    .collect(&format!("SELECT * FROM {}", self.source_expression()))
            }
        }
    }

    pub async fn to_dataframe(&self, backend: ReadBackend) -> Result<DataFrame> {
        self.to_table(backend).await?.to_dataframe()
    }

    /// `read_parquet('<glob>')` over every file under the path.
    #[must_use]
    pub fn source_expression(&self) -> String {
        format!(
            "read_parquet({})",
            quote_literal(&self.storage.engine_glob(&self.path))
        )
    }

    /// Run a SQL fragment in which `self` names this dataset.
    pub async fn query(&self, fragment: &str) -> Result<QueryResult> {
        self.query_with_placeholder(fragment, SELF_PLACEHOLDER).await
    }

    pub async fn query_with_placeholder(
        &self,
        fragment: &str,
        placeholder: &str,
    ) -> Result<QueryResult> {
        self.prepare_engine().await?;
        let sql = wrap_placeholder_in_cte(
            fragment,
            placeholder,
            DATASET_CTE,
            &self.source_expression(),
        )?;
        Ok(self.engine.query(sql))
    }

    /// Render `template` and run it as a query fragment.
    pub async fn query_template(
        &self,
        template: &Template,
        vars: &TemplateVars,
    ) -> Result<QueryResult> {
        self.query(&template.render(vars)?).await
    }

    /// Bulk-load the dataset's files into a warehouse table.
    pub async fn to_warehouse(
        &self,
        warehouse: &Warehouse,
        table_name: &str,
        mode: &LoadMode,
    ) -> Result<()> {
        warehouse.bulk_load(table_name, &self.path, mode).await
    }

    /// Replace the contents with the result of a warehouse query.
    pub async fn from_warehouse(&self, warehouse: &Warehouse, sql: &str) -> Result<()> {
        warehouse.unload(sql, self).await
    }

    /// Delete every object under the path. Safe on an empty or missing path.
    pub async fn clear(&self) -> Result<()> {
        if self.storage.list_type(&self.path).await? == ListType::Directory {
            let count = self.storage.delete_directory_contents(&self.path).await?;
            debug!("Cleared {count} objects from {path}", count: count, path: self.path.as_str());
        }
        Ok(())
    }

    /// Delete the contents and the path itself.
    pub async fn delete(&self) -> Result<()> {
        if self.storage.list_type(&self.path).await? == ListType::File {
            self.storage.delete_file(&self.path).await?;
        }
        // Also removes a leftover empty directory on the local backend.
        self.storage.delete_directory(&self.path).await?;
        info!("Deleted {path}", path: self.path.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::credentials::{
        CredentialProvider, ServiceToken, StaticCredentials, StorageCredentials,
        WarehouseCredentials,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts storage credential requests and refuses every one.
    #[derive(Debug, Default)]
    struct CountingCredentials {
        storage_requests: AtomicUsize,
    }

    #[async_trait]
    impl CredentialProvider for CountingCredentials {
        async fn storage_credentials(&self) -> Result<StorageCredentials> {
            self.storage_requests.fetch_add(1, Ordering::SeqCst);
            Err(Error::Configuration("expired".to_string()))
        }

        async fn warehouse_credentials(&self) -> Result<WarehouseCredentials> {
            Err(Error::Configuration("unused".to_string()))
        }

        async fn service_token(&self) -> Result<ServiceToken> {
            Err(Error::Configuration("unused".to_string()))
        }
    }

    fn dataset(dir: &tempfile::TempDir, path: &str) -> Dataset {
        let storage = Arc::new(ObjectStorage::local(
            dir.path(),
            Arc::new(StaticCredentials::new()),
        ));
        let engine = QueryEngine::open_in_memory().expect("engine");
        Dataset::create(Some(path), None, storage, engine).expect("dataset")
    }

    #[test]
    fn test_create_requires_path_or_bucket() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Arc::new(ObjectStorage::local(
            dir.path(),
            Arc::new(StaticCredentials::new()),
        ));
        let engine = QueryEngine::open_in_memory().expect("engine");

        let err = Dataset::create(None, None, storage.clone(), engine.clone()).expect_err("none");
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);

        let ds = Dataset::create(None, Some("scratch"), storage, engine).expect("bucket");
        assert!(ds.path().as_str().starts_with("s3://scratch/"));
    }

    #[test]
    fn test_identity_is_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dataset(&dir, "bucket/x");
        let b = dataset(&dir, "s3://bucket/x/");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "Dataset: s3://bucket/x/");
    }

    #[tokio::test]
    async fn test_clear_twice_on_empty_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ds = dataset(&dir, "bucket/nothing");
        ds.clear().await.expect("first clear");
        ds.clear().await.expect("second clear");
        ds.delete().await.expect("delete missing");
    }

    #[tokio::test]
    async fn test_query_sql_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ds = dataset(&dir, "bucket/q");
        let result = ds.query("SELECT count(*) FROM self").await.expect("query");
        assert!(result.sql().starts_with("WITH temp_s3_dataset_table AS (SELECT * FROM read_parquet('"));
        assert!(result.sql().ends_with("SELECT count(*) FROM temp_s3_dataset_table"));
    }

    #[tokio::test]
    async fn test_s3_engine_access_fetches_credentials_each_time() {
        let credentials = Arc::new(CountingCredentials::default());
        let storage = Arc::new(ObjectStorage::new(
            StorageBackend::S3,
            &StorageConfig::default(),
            credentials.clone(),
        ));
        let engine = QueryEngine::open_in_memory().expect("engine");
        let ds = Dataset::create(Some("bucket/q"), None, storage, engine).expect("dataset");

        for _ in 0..2 {
            let err = ds.query("SELECT * FROM self").await.expect_err("no credentials");
            assert_eq!(err.kind(), crate::ErrorKind::Configuration);
        }
        let err = ds
            .to_table(ReadBackend::QueryEngine)
            .await
            .expect_err("no credentials");
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
        assert_eq!(credentials.storage_requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_local_engine_access_needs_no_credentials() {
        let dir = tempfile::tempdir().expect("tempdir");
        let credentials = Arc::new(CountingCredentials::default());
        let storage = Arc::new(ObjectStorage::local(dir.path(), credentials.clone()));
        let engine = QueryEngine::open_in_memory().expect("engine");
        let ds = Dataset::create(Some("bucket/q"), None, storage, engine).expect("dataset");

        ds.query("SELECT * FROM self").await.expect("query");
        assert_eq!(credentials.storage_requests.load(Ordering::SeqCst), 0);
    }
}
