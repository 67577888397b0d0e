// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Session: the configured collaborators, plus one-shot transfers

use crate::config::ArrowsConfig;
use crate::credentials::{CredentialProvider, FileCredentialProvider};
use crate::dataset::{Dataset, WriteBackend};
use crate::engine::QueryEngine;
use crate::mail::Email;
use crate::sheets::{RemoteTable, SheetService, Workbook, WriteOptions};
use crate::storage::{DatasetPath, ObjectStorage, StorageBackend};
use crate::table::Table;
use crate::warehouse::{Warehouse, WarehouseClient};
use crate::{Error, Result};
use diagnostics::*;
use polars::prelude::DataFrame;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_WORKBOOK_NAME: &str = "Untitled";

#[derive(Clone)]
pub struct Session {
    config: ArrowsConfig,
    credentials: Arc<dyn CredentialProvider>,
    storage: Arc<ObjectStorage>,
    engine: QueryEngine,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

/// Where [`Session::table_to_sheet`] writes.
#[derive(Debug, Clone)]
pub enum SheetTarget {
    Table(RemoteTable),
    /// A table by name; created if missing.
    Named { workbook: Workbook, name: String },
    /// A new table with the next free `Sheet{n}` name.
    NewTable { workbook: Workbook },
    /// A new workbook. Its first table is renamed to `table_name` if given.
    NewWorkbook {
        service: Arc<dyn SheetService>,
        workbook_name: Option<String>,
        parent_folder: Option<String>,
        table_name: Option<String>,
    },
}

impl Session {
    /// Validate `config` and open an in-memory engine. Datasets hand the
    /// engine fresh storage credentials on each use.
    pub async fn connect(
        config: ArrowsConfig,
        credentials: Arc<dyn CredentialProvider>,
        backend: StorageBackend,
    ) -> Result<Self> {
        config.validate()?;
        let engine = QueryEngine::open_in_memory()?;
        let storage = Arc::new(ObjectStorage::new(
            backend,
            &config.storage,
            credentials.clone(),
        ));
        info!(
            "Session ready in region {region}",
            region: config.storage.region.as_str(),
        );
        Ok(Self {
            config,
            credentials,
            storage,
            engine,
        })
    }

    /// Datasets live in directories under `root`.
    pub async fn new_local(
        config: ArrowsConfig,
        credentials: Arc<dyn CredentialProvider>,
        root: impl Into<PathBuf>,
    ) -> Result<Self> {
        Self::connect(config, credentials, StorageBackend::Local { root: root.into() }).await
    }

    /// S3 session with credentials from `~/.credentials`.
    pub async fn from_home(config: ArrowsConfig) -> Result<Self> {
        let credentials = Arc::new(FileCredentialProvider::from_home()?);
        Self::connect(config, credentials, StorageBackend::S3).await
    }

    #[must_use]
    pub fn config(&self) -> &ArrowsConfig {
        &self.config
    }

    #[must_use]
    pub fn credentials(&self) -> &Arc<dyn CredentialProvider> {
        &self.credentials
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<ObjectStorage> {
        &self.storage
    }

    #[must_use]
    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    /// Columnar writer with the configured file row limit.
    #[must_use]
    pub fn default_write_backend(&self) -> WriteBackend {
        WriteBackend::Columnar {
            max_rows_per_file: self.config.storage.max_rows_per_file,
        }
    }

    /// Query engine writer with the configured target file size.
    #[must_use]
    pub fn engine_write_backend(&self) -> WriteBackend {
        WriteBackend::QueryEngine {
            file_size: self.config.storage.engine_file_size.clone(),
        }
    }

    /// An empty email from the configured sender name.
    #[must_use]
    pub fn email(&self) -> Email {
        Email::new().with_sender_name(self.config.mail.sender_name.as_str())
    }

    /// A dataset at `path`, or at a fresh path under `bucket` (the configured
    /// default bucket when `None`).
    pub fn create_dataset(&self, path: Option<&str>, bucket: Option<&str>) -> Result<Dataset> {
        let bucket = bucket.or(self.config.storage.default_bucket.as_deref());
        if path.is_none() && bucket.is_none() {
            return Err(Error::Configuration(
                "no dataset path or bucket given and no default bucket configured".to_string(),
            ));
        }
        Dataset::create(path, bucket, self.storage.clone(), self.engine.clone())
    }

    pub fn get_dataset(&self, path: &str) -> Result<Dataset> {
        Ok(Dataset::new(
            DatasetPath::parse(path)?,
            self.storage.clone(),
            self.engine.clone(),
        ))
    }

    /// Write `table` to a dataset, which is returned.
    pub async fn table_to_dataset(
        &self,
        table: &Table,
        path: Option<&str>,
        bucket: Option<&str>,
        backend: &WriteBackend,
    ) -> Result<Dataset> {
        let dataset = self.create_dataset(path, bucket)?;
        dataset.from_table(table, backend).await?;
        Ok(dataset)
    }

    /// Write `frame` to a dataset, which is returned.
    pub async fn dataframe_to_dataset(
        &self,
        frame: &DataFrame,
        path: Option<&str>,
        bucket: Option<&str>,
    ) -> Result<Dataset> {
        let dataset = self.create_dataset(path, bucket)?;
        dataset.from_dataframe(frame).await?;
        Ok(dataset)
    }

    /// Warehouse bridge sharing this session's storage and engine.
    pub fn warehouse(&self, client: Arc<dyn WarehouseClient>) -> Warehouse {
        Warehouse::new(
            client,
            self.credentials.clone(),
            self.storage.clone(),
            self.engine.clone(),
            self.config.warehouse.clone(),
        )
        .with_default_bucket(self.config.storage.default_bucket.clone())
        .with_staging_backend(self.default_write_backend())
    }

    #[must_use]
    pub fn workbook(&self, service: Arc<dyn SheetService>, id: impl Into<String>) -> Workbook {
        Workbook::new(
            id,
            service,
            self.credentials.clone(),
            self.engine.clone(),
            self.config.sheets.clone(),
        )
    }

    pub async fn create_workbook(
        &self,
        service: Arc<dyn SheetService>,
        name: Option<&str>,
        parent_folder: Option<&str>,
    ) -> Result<Workbook> {
        let name = name.unwrap_or(DEFAULT_WORKBOOK_NAME);
        let parent = parent_folder.or(self.config.sheets.parent_folder_id.as_deref());
        let id = service.create_workbook(name, parent).await?;
        Ok(self.workbook(service, id))
    }

    /// The table a [`SheetTarget`] denotes. New workbooks and new tables are
    /// created here; named tables are not.
    pub async fn resolve_sheet_target(&self, target: SheetTarget) -> Result<RemoteTable> {
        match target {
            SheetTarget::Table(table) => Ok(table),
            SheetTarget::Named { workbook, name } => Ok(workbook.table(name)),
            SheetTarget::NewTable { workbook } => workbook.create_table(None).await,
            SheetTarget::NewWorkbook {
                service,
                workbook_name,
                parent_folder,
                table_name,
            } => {
                let workbook = self
                    .create_workbook(service, workbook_name.as_deref(), parent_folder.as_deref())
                    .await?;
                let first = workbook.tables().await?.into_iter().next();
                match (first, table_name) {
                    (Some(mut table), Some(name)) => {
                        table.rename(&name).await?;
                        Ok(table)
                    }
                    (Some(table), None) => Ok(table),
                    (None, name) => workbook.create_table(name.as_deref()).await,
                }
            }
        }
    }

    /// Write `table` to the sheet `target` denotes, returning it.
    pub async fn table_to_sheet(
        &self,
        table: &Table,
        target: SheetTarget,
        options: &WriteOptions,
    ) -> Result<RemoteTable> {
        let mut remote = self.resolve_sheet_target(target).await?;
        remote.from_table(table, options).await?;
        Ok(remote)
    }
}
