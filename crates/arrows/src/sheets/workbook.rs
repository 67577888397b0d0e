// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use super::client::{Grant, PrincipalType, RangeInfo, Role, SheetService};
use super::table::RemoteTable;
use crate::config::SheetsConfig;
use crate::credentials::CredentialProvider;
use crate::engine::QueryEngine;
use crate::{Error, ErrorKind, Result};
use diagnostics::*;
use std::fmt;
use std::sync::Arc;

/// A spreadsheet holding an ordered collection of remote tables.
#[derive(Clone)]
pub struct Workbook {
    id: String,
    pub(crate) service: Arc<dyn SheetService>,
    pub(crate) credentials: Arc<dyn CredentialProvider>,
    pub(crate) engine: QueryEngine,
    config: SheetsConfig,
}

impl fmt::Debug for Workbook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Workbook").field(&self.id).finish()
    }
}

impl PartialEq for Workbook {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Workbook {}

/// Lowest `Sheet{n}`, counting from 1, not already taken. Names are
/// compared case-insensitively.
#[must_use]
pub fn next_table_name<S: AsRef<str>>(existing: &[S]) -> String {
    let taken: Vec<String> = existing
        .iter()
        .map(|name| name.as_ref().to_lowercase())
        .collect();
    (1..)
        .map(|n| format!("Sheet{n}"))
        .find(|candidate| !taken.contains(&candidate.to_lowercase()))
        .unwrap_or_default()
}

impl Workbook {
    pub fn new(
        id: impl Into<String>,
        service: Arc<dyn SheetService>,
        credentials: Arc<dyn CredentialProvider>,
        engine: QueryEngine,
        config: SheetsConfig,
    ) -> Self {
        Self {
            id: id.into(),
            service,
            credentials,
            engine,
            config,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("https://docs.google.com/spreadsheets/d/{}", self.id)
    }

    /// False if the service reports the workbook missing. Access denied is
    /// an error, not absence.
    pub async fn exists(&self) -> Result<bool> {
        match self.service.list_ranges(&self.id).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn ranges(&self) -> Result<Vec<RangeInfo>> {
        self.service.list_ranges(&self.id).await
    }

    /// Tables in workbook order, with their range ids resolved.
    pub async fn tables(&self) -> Result<Vec<RemoteTable>> {
        Ok(self
            .ranges()
            .await?
            .into_iter()
            .map(|r| RemoteTable::resolved(self.clone(), r.name, r.range_id))
            .collect())
    }

    pub async fn table_names(&self) -> Result<Vec<String>> {
        Ok(self.ranges().await?.into_iter().map(|r| r.name).collect())
    }

    /// A reference to a table that may not exist yet.
    #[must_use]
    pub fn table(&self, name: impl Into<String>) -> RemoteTable {
        RemoteTable::new(self.clone(), name)
    }

    /// True if `table` belongs to this workbook and currently exists in it.
    pub async fn contains(&self, table: &RemoteTable) -> Result<bool> {
        if table.workbook_id() != self.id {
            return Ok(false);
        }
        Ok(self.table_names().await?.iter().any(|n| n == table.name()))
    }

    /// Add a table named `name`, or the next free `Sheet{n}`.
    pub async fn create_table(&self, name: Option<&str>) -> Result<RemoteTable> {
        let name = match name {
            Some(name) => name.to_string(),
            None => next_table_name(&self.table_names().await?),
        };
        let range_id = self
            .service
            .add_range(
                &self.id,
                &name,
                self.config.default_rows,
                self.config.default_columns,
            )
            .await?;
        info!("Created table {name} in workbook {id}", name: name.as_str(), id: self.id.as_str());
        Ok(RemoteTable::resolved(self.clone(), name, range_id))
    }

    /// The one table named exactly `name`.
    pub async fn get_table(&self, name: &str) -> Result<RemoteTable> {
        let mut matches: Vec<RangeInfo> = self
            .ranges()
            .await?
            .into_iter()
            .filter(|r| r.name == name)
            .collect();
        match (matches.pop(), matches.is_empty()) {
            (Some(range), true) => Ok(RemoteTable::resolved(
                self.clone(),
                range.name,
                range.range_id,
            )),
            (None, _) => Err(Error::Integrity(format!(
                "no table named {name:?} in workbook {}",
                self.id
            ))),
            (Some(_), false) => Err(Error::Integrity(format!(
                "several tables named {name:?} in workbook {}",
                self.id
            ))),
        }
    }

    pub async fn rename_table(&self, old_name: &str, new_name: &str) -> Result<RemoteTable> {
        let mut table = self.get_table(old_name).await?;
        table.rename(new_name).await?;
        Ok(table)
    }

    pub async fn delete_table(&self, name: &str) -> Result<()> {
        self.get_table(name).await?.delete().await
    }

    /// Grant `role` to each recipient, one request at a time.
    pub async fn share<S: AsRef<str>>(
        &self,
        recipients: &[S],
        role: Role,
        principal: PrincipalType,
        notify: bool,
    ) -> Result<()> {
        for recipient in recipients {
            let grant = Grant {
                recipient: recipient.as_ref().to_string(),
                role,
                principal,
            };
            self.service.grant(&self.id, &grant, notify).await?;
            debug!(
                "Shared workbook {id} with {recipient}",
                id: self.id.as_str(),
                recipient: recipient.as_ref(),
            );
        }
        Ok(())
    }

    pub async fn rename(&self, name: &str) -> Result<()> {
        self.service.rename_workbook(&self.id, name).await
    }

    pub async fn delete(self) -> Result<()> {
        self.service.delete_workbook(&self.id).await?;
        info!("Deleted workbook {id}", id: self.id.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_table_name() {
        let none: [&str; 0] = [];
        assert_eq!(next_table_name(&none), "Sheet1");
        assert_eq!(next_table_name(&["Sheet1", "Sheet2"]), "Sheet3");
        assert_eq!(next_table_name(&["Sheet2"]), "Sheet1");
        assert_eq!(
            next_table_name(&["Sheet1", "Sheet2", "Sheet3", "sheet4"]),
            "Sheet5"
        );
        assert_eq!(next_table_name(&["SHEET1", "Data"]), "Sheet2");
    }
}
