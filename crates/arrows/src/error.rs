// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Error types for arrows operations

use thiserror::Error;

/// Broad classes of failure, independent of which service produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid path, credentials or template keys.
    Configuration,
    /// A table, workbook or dataset is absent where presence is required.
    NotFound,
    /// The service denied access.
    Permission,
    /// Network or storage failure; callers may retry.
    TransientIo,
    /// Unexpected cardinality or malformed data.
    Integrity,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Service error (HTTP {status}): {message}")]
    Service { status: u16, message: String },

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("DataFrame error: {0}")]
    DataFrame(#[from] polars::error::PolarsError),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("Warehouse error: {0}")]
    Warehouse(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Template error: {0}")]
    Template(#[from] tera::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build the error for a non-success HTTP status from a Google API.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => Error::Permission(message),
            404 => Error::NotFound(message),
            _ => Error::Service { status, message },
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) | Error::Template(_) | Error::Yaml(_) => {
                ErrorKind::Configuration
            }
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Permission(_) => ErrorKind::Permission,
            Error::Integrity(_)
            | Error::Parquet(_)
            | Error::Arrow(_)
            | Error::Json(_)
            | Error::DataFrame(_)
            | Error::DuckDb(_) => ErrorKind::Integrity,
            Error::Service { status, .. } if *status == 429 || *status >= 500 => {
                ErrorKind::TransientIo
            }
            Error::Service { .. } => ErrorKind::Integrity,
            Error::ObjectStore(object_store::Error::NotFound { .. }) => ErrorKind::NotFound,
            Error::ObjectStore(_) | Error::Warehouse(_) | Error::Http(_) | Error::Io(_) => {
                ErrorKind::TransientIo
            }
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientIo
    }
}
