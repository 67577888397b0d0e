// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! In-memory services for tests
//!
//! [`MemorySheetService`] keeps workbooks in a map. [`RecordingWarehouse`]
//! records every statement it is sent and acts out `UNLOAD` and `COPY`
//! against object storage, so bulk transfers can be checked end to end.
//! [`MemoryMailService`] keeps sent messages.

use crate::mail::MailService;
use crate::sheets::{Grant, RangeInfo, SheetService};
use crate::storage::{DatasetPath, ObjectStorage};
use crate::table::Table;
use crate::warehouse::{WarehouseClient, WarehouseConnection};
use crate::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use bytes::Bytes;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

static UNLOAD_TARGET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^UNLOAD \(.*\) TO '([^']*)'").expect("unload regex"));

static COPY_SOURCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^COPY (\S+) FROM '([^']*)'").expect("copy regex"));

fn guard<T>(state: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    state
        .lock()
        .map_err(|_| Error::Integrity("test double state poisoned".to_string()))
}

#[derive(Debug, Default)]
struct SheetState {
    workbooks: BTreeMap<String, Vec<RangeInfo>>,
    names: BTreeMap<String, String>,
    forbidden: BTreeSet<String>,
    grants: Vec<(String, Grant, bool)>,
    next_id: i64,
}

impl SheetState {
    fn ranges(&mut self, workbook_id: &str) -> Result<&mut Vec<RangeInfo>> {
        if self.forbidden.contains(workbook_id) {
            return Err(Error::from_status(403, format!("no access to {workbook_id}")));
        }
        self.workbooks
            .get_mut(workbook_id)
            .ok_or_else(|| Error::from_status(404, format!("workbook {workbook_id} not found")))
    }

    fn range_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Spreadsheet service holding workbooks in memory. New workbooks start with
/// one table, `Sheet1`, as on the real service.
#[derive(Debug, Default)]
pub struct MemorySheetService {
    state: Mutex<SheetState>,
}

impl MemorySheetService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a workbook holding tables named `names`.
    #[must_use]
    pub fn with_workbook<S: AsRef<str>>(self, id: &str, names: &[S]) -> Self {
        if let Ok(mut state) = self.state.lock() {
            let ranges = names
                .iter()
                .map(|name| RangeInfo {
                    range_id: state.range_id(),
                    name: name.as_ref().to_string(),
                })
                .collect();
            state.workbooks.insert(id.to_string(), ranges);
        }
        self
    }

    /// Deny all access to `id`.
    #[must_use]
    pub fn forbid(self, id: &str) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.forbidden.insert(id.to_string());
        }
        self
    }

    /// Table names of a workbook, in order. `None` if it does not exist.
    pub fn table_names(&self, workbook_id: &str) -> Option<Vec<String>> {
        let state = self.state.lock().ok()?;
        state
            .workbooks
            .get(workbook_id)
            .map(|ranges| ranges.iter().map(|r| r.name.clone()).collect())
    }

    pub fn workbook_name(&self, workbook_id: &str) -> Option<String> {
        self.state.lock().ok()?.names.get(workbook_id).cloned()
    }

    /// Grants made so far with their notify flag.
    pub fn grants(&self) -> Vec<(String, Grant, bool)> {
        self.state
            .lock()
            .map(|state| state.grants.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SheetService for MemorySheetService {
    async fn list_ranges(&self, workbook_id: &str) -> Result<Vec<RangeInfo>> {
        Ok(guard(&self.state)?.ranges(workbook_id)?.clone())
    }

    async fn create_workbook(&self, name: &str, _parent_folder: Option<&str>) -> Result<String> {
        let mut state = guard(&self.state)?;
        let id = format!("wb-{}", state.workbooks.len() + 1);
        let first = RangeInfo {
            range_id: state.range_id(),
            name: "Sheet1".to_string(),
        };
        state.workbooks.insert(id.clone(), vec![first]);
        state.names.insert(id.clone(), name.to_string());
        Ok(id)
    }

    async fn rename_workbook(&self, workbook_id: &str, name: &str) -> Result<()> {
        let mut state = guard(&self.state)?;
        state.ranges(workbook_id)?;
        state.names.insert(workbook_id.to_string(), name.to_string());
        Ok(())
    }

    async fn delete_workbook(&self, workbook_id: &str) -> Result<()> {
        let mut state = guard(&self.state)?;
        state.ranges(workbook_id)?;
        state.workbooks.remove(workbook_id);
        state.names.remove(workbook_id);
        Ok(())
    }

    async fn add_range(
        &self,
        workbook_id: &str,
        name: &str,
        _rows: u32,
        _columns: u32,
    ) -> Result<i64> {
        let mut state = guard(&self.state)?;
        let range_id = state.range_id();
        let ranges = state.ranges(workbook_id)?;
        if ranges.iter().any(|r| r.name.eq_ignore_ascii_case(name)) {
            return Err(Error::Service {
                status: 400,
                message: format!("a sheet named {name} already exists"),
            });
        }
        ranges.push(RangeInfo {
            range_id,
            name: name.to_string(),
        });
        Ok(range_id)
    }

    async fn rename_range(&self, workbook_id: &str, range_id: i64, name: &str) -> Result<()> {
        let mut state = guard(&self.state)?;
        let range = state
            .ranges(workbook_id)?
            .iter_mut()
            .find(|r| r.range_id == range_id)
            .ok_or_else(|| Error::from_status(404, format!("range {range_id} not found")))?;
        range.name = name.to_string();
        Ok(())
    }

    async fn delete_range(&self, workbook_id: &str, range_id: i64) -> Result<()> {
        let mut state = guard(&self.state)?;
        let ranges = state.ranges(workbook_id)?;
        let before = ranges.len();
        ranges.retain(|r| r.range_id != range_id);
        if ranges.len() == before {
            return Err(Error::from_status(404, format!("range {range_id} not found")));
        }
        Ok(())
    }

    async fn grant(&self, workbook_id: &str, grant: &Grant, notify: bool) -> Result<()> {
        let mut state = guard(&self.state)?;
        state.ranges(workbook_id)?;
        state
            .grants
            .push((workbook_id.to_string(), grant.clone(), notify));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct WarehouseState {
    statements: Vec<String>,
    result: Option<Table>,
    failures: Vec<String>,
    loads: Vec<(String, Table)>,
    connects: usize,
    closes: usize,
    unreadable_unload: bool,
}

/// Warehouse client that records statements instead of running them.
///
/// `UNLOAD ... TO '<path>'` writes the canned result to `<path>`, and
/// `COPY <table> FROM '<path>'` reads `<path>` and records what was loaded.
/// Any statement containing a [`fail_on`](Self::fail_on) substring fails.
#[derive(Debug, Clone)]
pub struct RecordingWarehouse {
    storage: Arc<ObjectStorage>,
    state: Arc<Mutex<WarehouseState>>,
}

impl RecordingWarehouse {
    pub fn new(storage: Arc<ObjectStorage>) -> Self {
        Self {
            storage,
            state: Arc::new(Mutex::new(WarehouseState::default())),
        }
    }

    /// Result returned by queries and written by `UNLOAD`.
    #[must_use]
    pub fn with_result(self, table: Table) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.result = Some(table);
        }
        self
    }

    /// `UNLOAD` writes an object named like Parquet that is not Parquet.
    #[must_use]
    pub fn with_unreadable_unload(self) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.unreadable_unload = true;
        }
        self
    }

    #[must_use]
    pub fn fail_on(self, fragment: impl Into<String>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.failures.push(fragment.into());
        }
        self
    }

    pub fn statements(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.statements.clone())
            .unwrap_or_default()
    }

    /// Target table and loaded rows for each `COPY` run.
    pub fn loads(&self) -> Vec<(String, Table)> {
        self.state
            .lock()
            .map(|state| state.loads.clone())
            .unwrap_or_default()
    }

    /// Connections opened and closed so far.
    pub fn connection_counts(&self) -> (usize, usize) {
        self.state
            .lock()
            .map(|state| (state.connects, state.closes))
            .unwrap_or_default()
    }
}

#[async_trait]
impl WarehouseClient for RecordingWarehouse {
    async fn connect(&self) -> Result<Box<dyn WarehouseConnection>> {
        guard(&self.state)?.connects += 1;
        Ok(Box::new(RecordingConnection {
            warehouse: self.clone(),
        }))
    }
}

struct RecordingConnection {
    warehouse: RecordingWarehouse,
}

impl RecordingConnection {
    /// Record `sql` and return the canned result, or the injected failure.
    fn record(&self, sql: &str) -> Result<Option<Table>> {
        let mut state = guard(&self.warehouse.state)?;
        state.statements.push(sql.to_string());
        if let Some(fragment) = state.failures.iter().find(|f| sql.contains(f.as_str())) {
            return Err(Error::Service {
                status: 500,
                message: format!("statement failed on {fragment:?}"),
            });
        }
        Ok(state.result.clone())
    }
}

#[async_trait]
impl WarehouseConnection for RecordingConnection {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        let result = self.record(sql)?;

        if let Some(captures) = UNLOAD_TARGET.captures(sql) {
            let path = DatasetPath::parse(&captures[1])?;
            if guard(&self.warehouse.state)?.unreadable_unload {
                self.warehouse
                    .storage
                    .put_file(&path, "0000_part_00.parquet", Bytes::from_static(b"not parquet"))
                    .await?;
                return Ok(());
            }
            let table = result
                .ok_or_else(|| Error::Integrity("no result set to unload".to_string()))?;
            self.warehouse
                .storage
                .write_columnar(&table, &path, usize::MAX)
                .await?;
        } else if let Some(captures) = COPY_SOURCE.captures(sql) {
            let path = DatasetPath::parse(&captures[2])?;
            let table = self.warehouse.storage.read_columnar(&path).await?;
            guard(&self.warehouse.state)?
                .loads
                .push((captures[1].to_string(), table));
        }
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<Table> {
        self.record(sql)?
            .ok_or_else(|| Error::Integrity("no result set configured".to_string()))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        guard(&self.warehouse.state)?.closes += 1;
        Ok(())
    }
}

/// Mail service that keeps what it is asked to send.
#[derive(Debug)]
pub struct MemoryMailService {
    address: String,
    sent: Mutex<Vec<String>>,
}

impl MemoryMailService {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Sent messages, decoded to MIME text.
    pub fn sent(&self) -> Vec<String> {
        self.sent
            .lock()
            .map(|sent| {
                sent.iter()
                    .filter_map(|raw| URL_SAFE.decode(raw).ok())
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl MailService for MemoryMailService {
    async fn sender_address(&self) -> Result<String> {
        Ok(self.address.clone())
    }

    async fn send_raw(&self, raw: &str) -> Result<String> {
        let mut sent = guard(&self.sent)?;
        sent.push(raw.to_string());
        Ok(format!("msg-{}", sent.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[tokio::test]
    async fn test_sheet_service_access() {
        let service = MemorySheetService::new()
            .with_workbook("open", &["Sheet1"])
            .forbid("closed");
        assert_eq!(service.list_ranges("open").await.expect("list").len(), 1);
        assert_eq!(
            service.list_ranges("missing").await.expect_err("missing").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            service.list_ranges("closed").await.expect_err("closed").kind(),
            ErrorKind::Permission
        );
    }

    #[tokio::test]
    async fn test_mail_service_keeps_messages() {
        let service = MemoryMailService::new("me@example.com");
        let id = service
            .send_raw(&URL_SAFE.encode("Subject: hi\r\n"))
            .await
            .expect("send");
        assert_eq!(id, "msg-1");
        assert_eq!(service.sent(), vec!["Subject: hi\r\n".to_string()]);
    }

    #[test]
    fn test_statement_patterns() {
        let unload = "UNLOAD ('SELECT ''a''') TO 's3://b/k/' IAM_ROLE 'r' FORMAT PARQUET";
        assert_eq!(&UNLOAD_TARGET.captures(unload).expect("unload")[1], "s3://b/k/");
        let copy = "COPY s.t FROM 's3://b/k/' IAM_ROLE 'r' FORMAT PARQUET";
        let captures = COPY_SOURCE.captures(copy).expect("copy");
        assert_eq!(&captures[1], "s.t");
        assert_eq!(&captures[2], "s3://b/k/");
    }
}
