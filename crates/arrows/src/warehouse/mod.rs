// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Warehouse bridge
//!
//! Bulk data moves between the warehouse and object storage with server-side
//! `UNLOAD` and `COPY`; a dataset is the staging area. Ad hoc statements run
//! in a transaction. Every operation opens its own connection and closes it
//! before returning, whatever the outcome.

mod client;
mod statement;

pub use client::{PgWarehouseClient, WarehouseClient, WarehouseConnection};
pub use statement::{BulkLoad, LoadMode, StorageAuthorization, TableName, Unload};

use crate::config::WarehouseConfig;
use crate::credentials::CredentialProvider;
use crate::dataset::{Dataset, ReadBackend, WriteBackend};
use crate::engine::QueryEngine;
use crate::storage::{DatasetPath, ObjectStorage};
use crate::table::Table;
use crate::template::{Template, TemplateFolder, TemplateVars};
use crate::{Error, Result};
use diagnostics::*;
use polars::prelude::DataFrame;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// How [`Warehouse::fetch`] retrieves a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStrategy {
    /// Stream rows through the client connection.
    Direct,
    /// `UNLOAD` into a temporary dataset, read it back, then delete it.
    /// Uses the default bucket when `bucket` is `None`.
    Unload { bucket: Option<String> },
}

#[derive(Clone)]
pub struct Warehouse {
    client: Arc<dyn WarehouseClient>,
    credentials: Arc<dyn CredentialProvider>,
    storage: Arc<ObjectStorage>,
    engine: QueryEngine,
    config: WarehouseConfig,
    default_bucket: Option<String>,
    staging_backend: WriteBackend,
}

impl fmt::Debug for Warehouse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Warehouse")
            .field("client", &self.client)
            .field("config", &self.config)
            .field("default_bucket", &self.default_bucket)
            .finish_non_exhaustive()
    }
}

impl Warehouse {
    pub fn new(
        client: Arc<dyn WarehouseClient>,
        credentials: Arc<dyn CredentialProvider>,
        storage: Arc<ObjectStorage>,
        engine: QueryEngine,
        config: WarehouseConfig,
    ) -> Self {
        Self {
            client,
            credentials,
            storage,
            engine,
            config,
            default_bucket: None,
            staging_backend: WriteBackend::default(),
        }
    }

    #[must_use]
    pub fn with_default_bucket(mut self, bucket: Option<String>) -> Self {
        self.default_bucket = bucket;
        self
    }

    /// How tables are written when staged for a bulk load.
    #[must_use]
    pub fn with_staging_backend(mut self, backend: WriteBackend) -> Self {
        self.staging_backend = backend;
        self
    }

    async fn authorization(&self) -> Result<StorageAuthorization> {
        match &self.config.iam_role {
            Some(role) => Ok(StorageAuthorization::IamRole(role.clone())),
            None => Ok(StorageAuthorization::Keys(
                self.credentials.storage_credentials().await?,
            )),
        }
    }

    fn scratch_dataset(&self, bucket: Option<&str>) -> Result<Dataset> {
        let bucket = bucket.or(self.default_bucket.as_deref()).ok_or_else(|| {
            Error::Configuration("no bucket given and no default bucket configured".to_string())
        })?;
        Ok(Dataset::new(
            DatasetPath::generate(bucket)?,
            self.storage.clone(),
            self.engine.clone(),
        ))
    }

    /// Export the result of `sql` into `destination`, replacing its contents.
    /// A failed export leaves whatever it already wrote.
    pub async fn unload(&self, sql: &str, destination: &Dataset) -> Result<()> {
        destination.clear().await?;

        let unload = Unload {
            sql: sql.to_string(),
            destination: destination.path().as_str().to_string(),
            authorization: self.authorization().await?,
            region: self.config.region.clone(),
            parallel: self.config.parallel_unload,
            max_file_size: self.config.unload_max_file_size.clone(),
        };

        let mut conn = self.client.connect().await?;
        let result = conn.bulk_unload(&unload).await;
        let closed = conn.close().await;

        if let Err(e) = &result {
            let error = e.to_string();
            log_error!(
                "Unload to {path} failed: {error}",
                path: destination.path().as_str(),
                error: error.as_str(),
            );
        }
        result?;
        closed?;
        info!("Unloaded query into {path}", path: destination.path().as_str());
        Ok(())
    }

    /// Import every file under `source` into `table_name` (`schema.table`).
    pub async fn bulk_load(
        &self,
        table_name: &str,
        source: &DatasetPath,
        mode: &LoadMode,
    ) -> Result<()> {
        let load = BulkLoad {
            table: TableName::parse(table_name)?,
            source: source.as_str().to_string(),
            mode: mode.clone(),
            authorization: self.authorization().await?,
            region: self.config.region.clone(),
        };

        let mut conn = self.client.connect().await?;
        let result = conn.bulk_load(&load).await;
        let closed = conn.close().await;

        if let Err(e) = &result {
            let error = e.to_string();
            log_error!("Loading {table_name} from {source} failed: {error}", table_name: table_name, source: source.as_str(), error: error.as_str());
        }
        result?;
        closed?;
        info!("Loaded {source} into {table_name}", source: source.as_str(), table_name: table_name);
        Ok(())
    }

    /// Run a query and return its result set.
    pub async fn fetch(&self, sql: &str, strategy: &FetchStrategy) -> Result<Table> {
        match strategy {
            FetchStrategy::Direct => {
                let mut conn = self.client.connect().await?;
                let result = conn.query(sql).await;
                let closed = conn.close().await;
                let table = result?;
                closed?;
                Ok(table)
            }
            FetchStrategy::Unload { bucket } => {
                let dataset = self.scratch_dataset(bucket.as_deref())?;
                let result = match self.unload(sql, &dataset).await {
                    Ok(()) => dataset.to_table(ReadBackend::Columnar).await,
                    Err(e) => Err(e),
                };
                let cleanup = dataset.delete().await;

                match (result, cleanup) {
                    (Ok(table), Ok(())) => Ok(table),
                    (Ok(_), Err(e)) => Err(e),
                    (Err(e), cleanup) => {
                        if let Err(cleanup) = cleanup {
                            let cleanup = cleanup.to_string();
                            log_warn!(
                                "Could not delete {path}: {cleanup}",
                                path: dataset.path().as_str(),
                                cleanup: cleanup.as_str(),
                            );
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    pub async fn fetch_dataframe(&self, sql: &str, strategy: &FetchStrategy) -> Result<DataFrame> {
        self.fetch(sql, strategy).await?.to_dataframe()
    }

    /// Run `sql` in a transaction: committed on success, rolled back on error.
    pub async fn execute(&self, sql: &str) -> Result<()> {
        info!("Running warehouse statement");
        debug!("{sql}", sql: sql);

        let mut conn = self.client.connect().await?;
        let result = conn.execute_in_transaction(&[sql.to_string()]).await;
        let closed = conn.close().await;

        if let Err(e) = &result {
            let error = e.to_string();
            log_error!("Warehouse statement failed: {error}", error: error.as_str());
        }
        result?;
        closed
    }

    pub async fn execute_template(&self, template: &Template, vars: &TemplateVars) -> Result<()> {
        self.execute(&template.render(vars)?).await
    }

    /// Render a SQL script file accepting `keys`, then execute it.
    pub async fn execute_file<I, S>(
        &self,
        path: &Path,
        folder: Option<&TemplateFolder>,
        keys: I,
        vars: &TemplateVars,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let template = match folder {
            Some(folder) => folder.load(&path.to_string_lossy(), keys)?,
            None => Template::from_file(path)?.with_keys(keys),
        };
        self.execute_template(&template, vars).await
    }

    /// Stage `table` in a fresh dataset, load it, and delete the dataset.
    pub async fn table_to_warehouse(
        &self,
        table: &Table,
        table_name: &str,
        mode: &LoadMode,
        bucket: Option<&str>,
    ) -> Result<()> {
        let dataset = self.scratch_dataset(bucket)?;
        let result = match dataset.from_table(table, &self.staging_backend).await {
            Ok(()) => dataset.to_warehouse(self, table_name, mode).await,
            Err(e) => Err(e),
        };
        let cleanup = dataset.delete().await;
        result?;
        cleanup
    }
}
