// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Configuration record, loadable from YAML
//!
//! ```yaml
//! storage:
//!   default_bucket: analytics-scratch
//!   region: eu-west-1
//! warehouse:
//!   iam_role: arn:aws:iam::123456789012:role/redshift-unload
//! sheets:
//!   parent_folder_id: 1AbCdEf
//! mail:
//!   sender_name: Reports
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrowsConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub warehouse: WarehouseConfig,

    #[serde(default)]
    pub sheets: SheetsConfig,

    #[serde(default)]
    pub mail: MailConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bucket used for datasets created without an explicit path
    #[serde(default)]
    pub default_bucket: Option<String>,

    #[serde(default = "default_region")]
    pub region: String,

    /// Custom S3 endpoint (for MinIO, R2, etc.)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// DuckDB `FILE_SIZE_BYTES` hint for the query-engine writer
    #[serde(default = "default_engine_file_size")]
    pub engine_file_size: String,

    /// Row limit per file for the direct Parquet writer
    #[serde(default = "default_max_rows_per_file")]
    pub max_rows_per_file: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseConfig {
    /// IAM role for UNLOAD/COPY; storage credentials are used when absent
    #[serde(default)]
    pub iam_role: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    /// Redshift `MAXFILESIZE` for UNLOAD, e.g. "256 MB"
    #[serde(default)]
    pub unload_max_file_size: Option<String>,

    #[serde(default = "default_true")]
    pub parallel_unload: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetsConfig {
    #[serde(default = "default_rows")]
    pub default_rows: u32,

    #[serde(default = "default_columns")]
    pub default_columns: u32,

    /// Drive folder for newly created workbooks
    #[serde(default)]
    pub parent_folder_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MailConfig {
    #[serde(default)]
    pub sender_name: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_engine_file_size() -> String {
    "1GB".to_string()
}

fn default_max_rows_per_file() -> usize {
    1_000_000
}

fn default_true() -> bool {
    true
}

fn default_rows() -> u32 {
    100
}

fn default_columns() -> u32 {
    20
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_bucket: None,
            region: default_region(),
            endpoint: None,
            engine_file_size: default_engine_file_size(),
            max_rows_per_file: default_max_rows_per_file(),
        }
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            iam_role: None,
            region: None,
            unload_max_file_size: None,
            parallel_unload: true,
        }
    }
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            default_rows: default_rows(),
            default_columns: default_columns(),
            parent_folder_id: None,
        }
    }
}

impl ArrowsConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: ArrowsConfig = serde_yaml_ng::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        Self::from_yaml_str(&text)
    }

    #[must_use]
    pub fn with_default_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.storage.default_bucket = Some(bucket.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.max_rows_per_file == 0 {
            return Err(Error::Configuration(
                "storage.max_rows_per_file must be positive".to_string(),
            ));
        }
        if let Some(bucket) = &self.storage.default_bucket
            && (bucket.is_empty() || bucket.contains('/'))
        {
            return Err(Error::Configuration(format!(
                "invalid default bucket name: {bucket:?}"
            )));
        }
        Ok(())
    }
}
