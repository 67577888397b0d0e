// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Move tables between object storage, a warehouse and spreadsheets
//!
//! An Arrow [`Table`] is the common form. Each store has a handle:
//!
//! - **Dataset**: Parquet files under one `s3://bucket/key/` prefix
//! - **Warehouse**: bulk `UNLOAD`/`COPY` through a dataset, or direct queries
//! - **Workbook / RemoteTable**: sheets in a Google spreadsheet
//!
//! Queries are SQL fragments that name their input `self`; the fragment is
//! rewritten to read from the handle's source and run in DuckDB.
//!
//! # Usage
//!
//! ```no_run
//! # async fn example() -> arrows::Result<()> {
//! use arrows::{ArrowsConfig, Session, StorageBackend};
//! use arrows::credentials::FileCredentialProvider;
//! use std::sync::Arc;
//!
//! let config = ArrowsConfig::default().with_default_bucket("scratch");
//! let credentials = Arc::new(FileCredentialProvider::from_home()?);
//! let session = Session::connect(config, credentials, StorageBackend::S3).await?;
//!
//! let dataset = session.get_dataset("s3://analytics/daily/")?;
//! let busy = dataset
//!     .query("SELECT user_id, count(*) AS n FROM self GROUP BY self.user_id")
//!     .await?
//!     .to_table()?;
//! println!("{busy}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod credentials;
pub mod dataset;
pub mod engine;
mod error;
pub mod mail;
pub mod rewrite;
pub mod session;
pub mod sheets;
pub mod storage;
pub mod table;
pub mod template;
pub mod testing;
pub mod warehouse;

pub use config::ArrowsConfig;
pub use dataset::{Dataset, ReadBackend, WriteBackend};
pub use engine::{QueryEngine, QueryResult};
pub use error::{Error, ErrorKind};
pub use mail::{Email, GmailClient, MailService};
pub use session::{Session, SheetTarget};
pub use sheets::{ReadOptions, RemoteTable, Workbook, WriteOptions};
pub use storage::{DatasetPath, ObjectStorage, StorageBackend};
pub use table::Table;
pub use warehouse::{FetchStrategy, LoadMode, Warehouse};

pub type Result<T> = std::result::Result<T, Error>;
