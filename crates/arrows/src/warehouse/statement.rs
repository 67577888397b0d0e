// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Bulk transfer statements: `UNLOAD` to object storage and `COPY` from it

use crate::credentials::StorageCredentials;
use crate::engine::quote_literal;
use crate::{Error, Result};
use std::fmt;

/// `schema.table`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().split('.').collect::<Vec<_>>().as_slice() {
            [schema, table] if is_identifier(schema) && is_identifier(table) => Ok(Self {
                schema: schema.to_string(),
                table: table.to_string(),
            }),
            _ => Err(Error::Configuration(format!(
                "warehouse table must be named schema.table: {name:?}"
            ))),
        }
    }

    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

fn is_identifier(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// How loaded rows combine with rows already in the target table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadMode {
    #[default]
    Append,
    /// Existing rows are deleted first, in the same transaction.
    Overwrite,
    /// Rows whose `keys` match an incoming row are replaced.
    Upsert { keys: Vec<String> },
}

/// How the warehouse authenticates to object storage.
#[derive(Clone, PartialEq, Eq)]
pub enum StorageAuthorization {
    IamRole(String),
    Keys(StorageCredentials),
}

impl fmt::Debug for StorageAuthorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageAuthorization::IamRole(role) => f.debug_tuple("IamRole").field(role).finish(),
            StorageAuthorization::Keys(keys) => f.debug_tuple("Keys").field(keys).finish(),
        }
    }
}

impl StorageAuthorization {
    fn render(&self, region: Option<&str>) -> String {
        let mut clause = match self {
            StorageAuthorization::IamRole(role) => format!("IAM_ROLE {}", quote_literal(role)),
            StorageAuthorization::Keys(keys) => {
                let mut clause = format!(
                    "ACCESS_KEY_ID {} SECRET_ACCESS_KEY {}",
                    quote_literal(&keys.access_key_id),
                    quote_literal(&keys.secret_access_key)
                );
                if let Some(token) = &keys.session_token {
                    clause.push_str(&format!(" SESSION_TOKEN {}", quote_literal(token)));
                }
                clause
            }
        };
        if let Some(region) = region {
            clause.push_str(&format!(" REGION {}", quote_literal(region)));
        }
        clause
    }
}

/// Export a query's result set as Parquet files under a prefix.
#[derive(Debug, Clone)]
pub struct Unload {
    pub sql: String,
    pub destination: String,
    pub authorization: StorageAuthorization,
    pub region: Option<String>,
    pub parallel: bool,
    pub max_file_size: Option<String>,
}

impl Unload {
    #[must_use]
    pub fn render(&self) -> String {
        let mut statement = format!(
            "UNLOAD ({}) TO {} {} FORMAT PARQUET",
            quote_literal(self.sql.trim().trim_end_matches(';')),
            quote_literal(&self.destination),
            self.authorization.render(self.region.as_deref()),
        );
        if !self.parallel {
            statement.push_str(" PARALLEL OFF");
        }
        if let Some(size) = &self.max_file_size {
            statement.push_str(&format!(" MAXFILESIZE {size}"));
        }
        statement
    }
}

/// Import every file under a prefix into a table.
#[derive(Debug, Clone)]
pub struct BulkLoad {
    pub table: TableName,
    pub source: String,
    pub mode: LoadMode,
    pub authorization: StorageAuthorization,
    pub region: Option<String>,
}

impl BulkLoad {
    fn copy_into(&self, target: &str) -> String {
        format!(
            "COPY {target} FROM {} {} FORMAT PARQUET",
            quote_literal(&self.source),
            self.authorization.render(self.region.as_deref()),
        )
    }

    /// Statements to run, in order, inside one transaction.
    pub fn statements(&self) -> Result<Vec<String>> {
        let target = self.table.to_string();
        match &self.mode {
            LoadMode::Append => Ok(vec![self.copy_into(&target)]),
            LoadMode::Overwrite => Ok(vec![
                format!("DELETE FROM {target}"),
                self.copy_into(&target),
            ]),
            LoadMode::Upsert { keys } => {
                if keys.is_empty() || !keys.iter().all(|k| is_identifier(k)) {
                    return Err(Error::Configuration(format!(
                        "upsert into {target} needs plain key columns: {keys:?}"
                    )));
                }
                let staging = format!("{}_staging", self.table.table());
                let matches = keys
                    .iter()
                    .map(|k| format!("{target}.{k} = {staging}.{k}"))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                Ok(vec![
                    format!("CREATE TEMP TABLE {staging} (LIKE {target})"),
                    self.copy_into(&staging),
                    format!("DELETE FROM {target} USING {staging} WHERE {matches}"),
                    format!("INSERT INTO {target} SELECT * FROM {staging}"),
                    format!("DROP TABLE {staging}"),
                ])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> StorageAuthorization {
        StorageAuthorization::Keys(StorageCredentials {
            access_key_id: "AKIA".to_string(),
            secret_access_key: "SECRET".to_string(),
            session_token: Some("TOKEN".to_string()),
        })
    }

    #[test]
    fn test_table_name() {
        let name = TableName::parse("analytics.orders").expect("parse");
        assert_eq!(name.schema(), "analytics");
        assert_eq!(name.table(), "orders");
        assert_eq!(name.to_string(), "analytics.orders");

        for bad in ["orders", "a.b.c", ".orders", "a.", "a.b; DROP"] {
            let err = TableName::parse(bad).expect_err(bad);
            assert_eq!(err.kind(), crate::ErrorKind::Configuration);
        }
    }

    #[test]
    fn test_unload_with_keys() {
        let unload = Unload {
            sql: "SELECT * FROM t WHERE name = 'x';".to_string(),
            destination: "s3://bucket/out/".to_string(),
            authorization: keys(),
            region: None,
            parallel: true,
            max_file_size: None,
        };
        assert_eq!(
            unload.render(),
            "UNLOAD ('SELECT * FROM t WHERE name = ''x''') TO 's3://bucket/out/' \
             ACCESS_KEY_ID 'AKIA' SECRET_ACCESS_KEY 'SECRET' SESSION_TOKEN 'TOKEN' FORMAT PARQUET"
        );
    }

    #[test]
    fn test_unload_with_role_and_options() {
        let unload = Unload {
            sql: "SELECT 1".to_string(),
            destination: "s3://bucket/out/".to_string(),
            authorization: StorageAuthorization::IamRole("arn:aws:iam::1:role/r".to_string()),
            region: Some("eu-west-1".to_string()),
            parallel: false,
            max_file_size: Some("256 MB".to_string()),
        };
        assert_eq!(
            unload.render(),
            "UNLOAD ('SELECT 1') TO 's3://bucket/out/' IAM_ROLE 'arn:aws:iam::1:role/r' \
             REGION 'eu-west-1' FORMAT PARQUET PARALLEL OFF MAXFILESIZE 256 MB"
        );
    }

    #[test]
    fn test_load_modes() {
        let mut load = BulkLoad {
            table: TableName::parse("s.t").expect("name"),
            source: "s3://bucket/in/".to_string(),
            mode: LoadMode::Append,
            authorization: StorageAuthorization::IamRole("role".to_string()),
            region: None,
        };
        assert_eq!(
            load.statements().expect("append"),
            vec!["COPY s.t FROM 's3://bucket/in/' IAM_ROLE 'role' FORMAT PARQUET"]
        );

        load.mode = LoadMode::Overwrite;
        let statements = load.statements().expect("overwrite");
        assert_eq!(statements[0], "DELETE FROM s.t");
        assert!(statements[1].starts_with("COPY s.t FROM"));

        load.mode = LoadMode::Upsert {
            keys: vec!["id".to_string(), "day".to_string()],
        };
        let statements = load.statements().expect("upsert");
        assert_eq!(statements.len(), 5);
        assert_eq!(statements[0], "CREATE TEMP TABLE t_staging (LIKE s.t)");
        assert_eq!(
            statements[2],
            "DELETE FROM s.t USING t_staging WHERE s.t.id = t_staging.id AND s.t.day = t_staging.day"
        );

        load.mode = LoadMode::Upsert { keys: vec![] };
        assert!(load.statements().is_err());
    }
}
