// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use super::workbook::Workbook;
use crate::engine::{QueryResult, StagedTable, quote_literal};
use crate::rewrite::wrap_in_cte;
use crate::table::Table;
use crate::template::{Template, TemplateVars};
use crate::{ErrorKind, Result};
use diagnostics::*;
use polars::prelude::DataFrame;
use std::fmt;

/// Name of the CTE that sheet queries see in place of `self`.
pub const SHEET_CTE: &str = "temp_google_sheet_table";

/// Template key under which a sheet query can reference the raw source.
pub const SHEET_KEY: &str = "google_sheet";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// A1-notation sub-range, e.g. `A1:D20`.
    pub range: Option<String>,
    /// Read every cell as text instead of inferring types.
    pub all_text: bool,
    /// Fragment run against the table, which it names `self`.
    pub sql: Option<String>,
    /// When set, `sql` is rendered as a template with these values plus
    /// [`SHEET_KEY`]. Otherwise it is used as written.
    pub vars: Option<TemplateVars>,
}

impl ReadOptions {
    #[must_use]
    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }

    #[must_use]
    pub fn all_text(mut self) -> Self {
        self.all_text = true;
        self
    }

    #[must_use]
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    #[must_use]
    pub fn with_vars(mut self, vars: TemplateVars) -> Self {
        self.vars = Some(vars);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOptions {
    pub range: Option<String>,
    /// Clear the whole table before writing.
    pub overwrite_table: bool,
    /// Clear only the target range before writing.
    pub overwrite_range: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            range: None,
            overwrite_table: true,
            overwrite_range: false,
        }
    }
}

/// `read_gsheet(...)` for a table, optionally restricted to a sub-range.
#[must_use]
pub fn gsheet_source(workbook_id: &str, name: &str, options: &ReadOptions) -> String {
    let sheet = match &options.range {
        Some(range) => format!("{name}!{range}"),
        None => name.to_string(),
    };
    let all_varchar = if options.all_text {
        ", all_varchar = true"
    } else {
        ""
    };
    format!(
        "read_gsheet({}, sheet = {}{all_varchar})",
        quote_literal(workbook_id),
        quote_literal(&sheet)
    )
}

/// Query reading a table: the fragment in `options.sql` over the sheet, or
/// every row. A templated fragment may use `{{ google_sheet }}` for the raw
/// source.
pub fn gsheet_read_sql(workbook_id: &str, name: &str, options: &ReadOptions) -> Result<String> {
    let source = gsheet_source(workbook_id, name, options);
    match &options.sql {
        Some(fragment) => {
            let fragment = match &options.vars {
                Some(vars) => {
                    let mut vars = vars.clone();
                    vars.insert(SHEET_KEY.to_string(), source.clone().into());
                    Template::new("sheet query", fragment.as_str())
                        .with_keys(vars.keys().cloned())
                        .render(&vars)?
                }
                None => fragment.clone(),
            };
            wrap_in_cte(&fragment, SHEET_CTE, &source)
        }
        None => Ok(format!("SELECT * FROM {source}")),
    }
}

/// `COPY` writing `source` (a table expression) into a sheet.
#[must_use]
pub fn gsheet_copy_statement(
    source: &str,
    workbook_id: &str,
    name: &str,
    options: &WriteOptions,
) -> String {
    let mut settings = vec![
        "FORMAT gsheet".to_string(),
        format!("SHEET {}", quote_literal(name)),
    ];
    if let Some(range) = &options.range {
        settings.push(format!("RANGE {}", quote_literal(range)));
    }
    if options.overwrite_range {
        settings.push("OVERWRITE_RANGE true".to_string());
    }
    if !options.overwrite_table {
        settings.push("OVERWRITE_SHEET false".to_string());
    }
    format!(
        "COPY (SELECT * FROM {source}) TO {} ({})",
        quote_literal(workbook_id),
        settings.join(", ")
    )
}

/// A named table inside a workbook. It may not exist yet; it is created on
/// first write. Equality ignores the cached range id.
#[derive(Clone)]
pub struct RemoteTable {
    workbook: Workbook,
    name: String,
    range_id: Option<i64>,
}

impl fmt::Debug for RemoteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTable")
            .field("workbook", &self.workbook.id())
            .field("name", &self.name)
            .field("range_id", &self.range_id)
            .finish()
    }
}

impl PartialEq for RemoteTable {
    fn eq(&self, other: &Self) -> bool {
        self.workbook.id() == other.workbook.id() && self.name == other.name
    }
}

impl Eq for RemoteTable {}

impl RemoteTable {
    pub fn new(workbook: Workbook, name: impl Into<String>) -> Self {
        Self {
            workbook,
            name: name.into(),
            range_id: None,
        }
    }

    pub(crate) fn resolved(workbook: Workbook, name: String, range_id: i64) -> Self {
        Self {
            workbook,
            name,
            range_id: Some(range_id),
        }
    }

    #[must_use]
    pub fn workbook(&self) -> &Workbook {
        &self.workbook
    }

    #[must_use]
    pub fn workbook_id(&self) -> &str {
        self.workbook.id()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cached range id, if resolved. Stale after renames made elsewhere.
    #[must_use]
    pub fn range_id(&self) -> Option<i64> {
        self.range_id
    }

    /// Look up and cache the range id.
    pub async fn resolve_range_id(&mut self) -> Result<i64> {
        if let Some(id) = self.range_id {
            return Ok(id);
        }
        let id = self.workbook.get_table(&self.name).await?.range_id;
        self.range_id = id;
        id.ok_or_else(|| crate::Error::Integrity(format!("table {} has no range id", self.name)))
    }

    pub async fn url(&mut self) -> Result<String> {
        let id = self.resolve_range_id().await?;
        Ok(format!("{}/edit?gid={id}#gid={id}", self.workbook.url()))
    }

    /// False if the table or its workbook is missing. Access denied is an
    /// error.
    pub async fn exists(&self) -> Result<bool> {
        match self.workbook.table_names().await {
            Ok(names) => Ok(names.iter().any(|n| *n == self.name)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create the table if it does not exist.
    pub async fn create(&mut self) -> Result<()> {
        if self.exists().await? {
            info!("Table {name} already exists", name: self.name.as_str());
            return Ok(());
        }
        let created = self.workbook.create_table(Some(&self.name)).await?;
        self.range_id = created.range_id;
        Ok(())
    }

    pub async fn rename(&mut self, new_name: &str) -> Result<()> {
        let id = self.resolve_range_id().await?;
        self.workbook
            .service
            .rename_range(self.workbook.id(), id, new_name)
            .await?;
        self.name = new_name.to_string();
        Ok(())
    }

    /// Remove the table from its workbook. A missing table is left alone.
    pub async fn delete(mut self) -> Result<()> {
        if !self.exists().await? {
            info!("Table {name} does not exist", name: self.name.as_str());
            return Ok(());
        }
        let id = self.resolve_range_id().await?;
        self.workbook
            .service
            .delete_range(self.workbook.id(), id)
            .await?;
        info!("Deleted table {name}", name: self.name.as_str());
        Ok(())
    }

    async fn prepare_engine(&self) -> Result<()> {
        let token = self.workbook.credentials.service_token().await?;
        self.workbook.engine.register_sheets_secret(&token)
    }

    /// Lazy query over the table; `options.sql` names it `self`.
    pub async fn query(&self, options: &ReadOptions) -> Result<QueryResult> {
        self.prepare_engine().await?;
        let sql = gsheet_read_sql(self.workbook.id(), &self.name, options)?;
        Ok(self.workbook.engine.query(sql))
    }

    pub async fn to_table(&self, options: &ReadOptions) -> Result<Table> {
        self.query(options).await?.to_table()
    }

    pub async fn to_dataframe(&self, options: &ReadOptions) -> Result<DataFrame> {
        self.query(options).await?.to_dataframe()
    }

    pub async fn from_dataframe(
        &mut self,
        frame: &DataFrame,
        options: &WriteOptions,
    ) -> Result<()> {
        self.from_table(&Table::from_dataframe(frame)?, options).await
    }

    /// Write `table` into the sheet, creating the sheet first if needed.
    pub async fn from_table(&mut self, table: &Table, options: &WriteOptions) -> Result<()> {
        if !self.exists().await? {
            self.create().await?;
        }
        self.prepare_engine().await?;

        let staged = StagedTable::new(table)?;
        self.workbook.engine.execute_batch(&gsheet_copy_statement(
            &staged.source(),
            self.workbook.id(),
            &self.name,
            options,
        ))?;
        info!(
            "Wrote {rows} rows to table {name}",
            rows: table.num_rows(),
            name: self.name.as_str(),
        );
        Ok(())
    }
}
