// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Spreadsheet service interface and the Google Sheets / Drive client

use crate::credentials::CredentialProvider;
use crate::{Error, Result};
use async_trait::async_trait;
use diagnostics::*;
use serde::Deserialize;
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const SHEETS_BASE: &str = "https://sheets.googleapis.com";
const DRIVE_BASE: &str = "https://www.googleapis.com";
const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";

/// One named range (a sheet) inside a workbook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeInfo {
    pub range_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Reader,
    Commenter,
    Writer,
    Owner,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Reader => "reader",
            Role::Commenter => "commenter",
            Role::Writer => "writer",
            Role::Owner => "owner",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrincipalType {
    #[default]
    User,
    Group,
    Domain,
    Anyone,
}

impl PrincipalType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PrincipalType::User => "user",
            PrincipalType::Group => "group",
            PrincipalType::Domain => "domain",
            PrincipalType::Anyone => "anyone",
        }
    }
}

/// Access granted to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub recipient: String,
    pub role: Role,
    pub principal: PrincipalType,
}

/// Spreadsheet service operations. Errors follow HTTP status semantics:
/// 404 is [`Error::NotFound`], 401 and 403 are [`Error::Permission`].
#[async_trait]
pub trait SheetService: Send + Sync + fmt::Debug {
    /// Ranges in workbook order.
    async fn list_ranges(&self, workbook_id: &str) -> Result<Vec<RangeInfo>>;

    /// Returns the new workbook's id.
    async fn create_workbook(&self, name: &str, parent_folder: Option<&str>) -> Result<String>;

    async fn rename_workbook(&self, workbook_id: &str, name: &str) -> Result<()>;

    async fn delete_workbook(&self, workbook_id: &str) -> Result<()>;

    /// Returns the new range's id.
    async fn add_range(&self, workbook_id: &str, name: &str, rows: u32, columns: u32)
    -> Result<i64>;

    async fn rename_range(&self, workbook_id: &str, range_id: i64, name: &str) -> Result<()>;

    async fn delete_range(&self, workbook_id: &str, range_id: i64) -> Result<()>;

    async fn grant(&self, workbook_id: &str, grant: &Grant, notify: bool) -> Result<()>;
}

/// Google Sheets v4 and Drive v3 over REST.
#[derive(Debug, Clone)]
pub struct GoogleSheetsClient {
    http: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    sheets_base: String,
    drive_base: String,
}

#[derive(Deserialize)]
struct SpreadsheetResponse {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
}

#[derive(Deserialize)]
struct CreatedFile {
    id: String,
}

impl GoogleSheetsClient {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        Self::with_base_urls(credentials, SHEETS_BASE, DRIVE_BASE)
    }

    /// Point the client at other endpoints, e.g. a local emulator.
    pub fn with_base_urls(
        credentials: Arc<dyn CredentialProvider>,
        sheets_base: &str,
        drive_base: &str,
    ) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()?,
            credentials,
            sheets_base: sheets_base.trim_end_matches('/').to_string(),
            drive_base: drive_base.trim_end_matches('/').to_string(),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let token = self.credentials.service_token().await?;
        let response = request.bearer_auth(&token.access_token).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(Error::from_status(status.as_u16(), message))
    }

    async fn batch_update(&self, workbook_id: &str, requests: Value) -> Result<Value> {
        let url = format!(
            "{}/v4/spreadsheets/{workbook_id}:batchUpdate",
            self.sheets_base
        );
        let response = self
            .send(self.http.post(url).json(&json!({ "requests": requests })))
            .await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl SheetService for GoogleSheetsClient {
    async fn list_ranges(&self, workbook_id: &str) -> Result<Vec<RangeInfo>> {
        let url = format!("{}/v4/spreadsheets/{workbook_id}", self.sheets_base);
        let response: SpreadsheetResponse = self
            .send(
                self.http
                    .get(url)
                    .query(&[("fields", "sheets.properties(sheetId,title)")]),
            )
            .await?
            .json()
            .await?;
        Ok(response
            .sheets
            .into_iter()
            .map(|s| RangeInfo {
                range_id: s.properties.sheet_id,
                name: s.properties.title,
            })
            .collect())
    }

    async fn create_workbook(&self, name: &str, parent_folder: Option<&str>) -> Result<String> {
        let mut metadata = json!({ "name": name, "mimeType": SPREADSHEET_MIME });
        if let Some(folder) = parent_folder {
            metadata["parents"] = json!([folder]);
        }
        let url = format!("{}/drive/v3/files", self.drive_base);
        let created: CreatedFile = self
            .send(self.http.post(url).query(&[("fields", "id")]).json(&metadata))
            .await?
            .json()
            .await?;
        info!("Created workbook {name} ({id})", name: name, id: created.id.as_str());
        Ok(created.id)
    }

    async fn rename_workbook(&self, workbook_id: &str, name: &str) -> Result<()> {
        let url = format!("{}/drive/v3/files/{workbook_id}", self.drive_base);
        let _ = self
            .send(
                self.http
                    .patch(url)
                    .query(&[("fields", "id,name")])
                    .json(&json!({ "name": name })),
            )
            .await?;
        Ok(())
    }

    async fn delete_workbook(&self, workbook_id: &str) -> Result<()> {
        let url = format!("{}/drive/v3/files/{workbook_id}", self.drive_base);
        let _ = self.send(self.http.delete(url)).await?;
        Ok(())
    }

    async fn add_range(
        &self,
        workbook_id: &str,
        name: &str,
        rows: u32,
        columns: u32,
    ) -> Result<i64> {
        let reply = self
            .batch_update(
                workbook_id,
                json!([{
                    "addSheet": {
                        "properties": {
                            "title": name,
                            "gridProperties": { "rowCount": rows, "columnCount": columns }
                        }
                    }
                }]),
            )
            .await?;
        reply["replies"][0]["addSheet"]["properties"]["sheetId"]
            .as_i64()
            .ok_or_else(|| Error::Integrity(format!("addSheet reply has no sheetId: {reply}")))
    }

    async fn rename_range(&self, workbook_id: &str, range_id: i64, name: &str) -> Result<()> {
        let _ = self
            .batch_update(
                workbook_id,
                json!([{
                    "updateSheetProperties": {
                        "properties": { "sheetId": range_id, "title": name },
                        "fields": "title"
                    }
                }]),
            )
            .await?;
        Ok(())
    }

    async fn delete_range(&self, workbook_id: &str, range_id: i64) -> Result<()> {
        let _ = self
            .batch_update(
                workbook_id,
                json!([{ "deleteSheet": { "sheetId": range_id } }]),
            )
            .await?;
        Ok(())
    }

    async fn grant(&self, workbook_id: &str, grant: &Grant, notify: bool) -> Result<()> {
        let url = format!(
            "{}/drive/v3/files/{workbook_id}/permissions",
            self.drive_base
        );
        let mut body = json!({
            "type": grant.principal.as_str(),
            "role": grant.role.as_str(),
        });
        match grant.principal {
            PrincipalType::Domain => body["domain"] = json!(grant.recipient),
            PrincipalType::Anyone => {}
            PrincipalType::User | PrincipalType::Group => {
                body["emailAddress"] = json!(grant.recipient)
            }
        }
        let _ = self
            .send(
                self.http
                    .post(url)
                    .query(&[("sendNotificationEmail", notify)])
                    .json(&body),
            )
            .await?;
        Ok(())
    }
}
