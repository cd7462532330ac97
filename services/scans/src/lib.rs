//! Barcode Scan Service
//!
//! Records barcode scan events in a single SQLite table and serves them back
//! filtered by date range and barcode substring, with an xlsx export of any
//! filtered set.
//!
//! ## Features
//!
//! - **Scan Recording**: `POST /scans/` stores a barcode stamped with server time
//! - **Filtered Listing**: `GET /scans/` with `[start_date, end_date)` window,
//!   case-sensitive barcode substring, and `skip`/`limit` paging, newest first
//! - **Spreadsheet Export**: `GET /scans/export/` renders the whole filtered set
//!   as `scans_export.xlsx`
//! - **Bulk Delete**: `DELETE /scans/` clears the table in one transaction
//!
//! ## Architecture
//!
//! ```text
//! HTTP request
//!      │
//!      ▼
//! ┌──────────────┐   session()   ┌──────────────┐        ┌──────────────┐
//! │ API Router   │──────────────▶│ Scan Store   │───────▶│ SQLite       │
//! └──────────────┘               │ (pool)       │        │ scans table  │
//!      │                         └──────────────┘        └──────────────┘
//!      │                                ▲
//!      ▼                                │ select(filter)
//! ┌──────────────┐               ┌──────────────┐
//! │ Query        │               │ Export       │──▶ xlsx bytes
//! │ (filters)    │               │ (workbook)   │
//! └──────────────┘               └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod export;
pub mod query;
pub mod schema;
pub mod store;

pub use api::{create_router, start_api_server, ApiError, AppState};
pub use config::Config;
pub use export::{export_scans, render_workbook, ExportError};
pub use query::{Page, ScanFilter};
pub use schema::{Scan, ScanCreate};
pub use store::{ScanSession, ScanStore};
