// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Spreadsheet workbooks and the tables (sheets) inside them
//!
//! Structure (creating, renaming, deleting and sharing) goes through a
//! [`SheetService`]. Data moves through the query engine's `gsheets`
//! extension, which reads and writes sheet ranges directly.

mod client;
mod table;
mod workbook;

pub use client::{GoogleSheetsClient, Grant, PrincipalType, RangeInfo, Role, SheetService};
pub use table::{
    ReadOptions, RemoteTable, SHEET_CTE, SHEET_KEY, WriteOptions, gsheet_copy_statement,
    gsheet_read_sql, gsheet_source,
};
pub use workbook::{Workbook, next_table_name};
