//! Spreadsheet export of filtered scans.

use crate::query::ScanFilter;
use crate::schema::Scan;
use crate::store::ScanSession;
use anyhow::Context;
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use thiserror::Error;
use tracing::{debug, instrument};

/// Download filename sent in `Content-Disposition`
pub const EXPORT_FILENAME: &str = "scans_export.xlsx";

/// MIME type of an xlsx workbook
pub const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Worksheet holding the exported rows
pub const SHEET_NAME: &str = "Scans";

/// Header row, in column order
pub const EXPORT_COLUMNS: [&str; 3] = ["id", "barcode", "scanned_at"];

const EXPORT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("No scans found for the given criteria.")]
    NoMatches,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Run `filter` without pagination and render the matches as an xlsx workbook
#[instrument(skip(session))]
pub async fn export_scans(
    session: &mut ScanSession,
    filter: &ScanFilter,
) -> Result<Vec<u8>, ExportError> {
    let scans = session.select(filter, None).await?;
    if scans.is_empty() {
        return Err(ExportError::NoMatches);
    }

    let rows = scans.len();
    let workbook = tokio::task::spawn_blocking(move || render_workbook(&scans))
        .await
        .context("Export render task failed")?
        .context("Failed to render export workbook")?;

    debug!(rows, bytes = workbook.len(), "Export workbook rendered");
    metrics::counter!("scans.exported").increment(rows as u64);

    Ok(workbook)
}

/// Render scans into an in-memory workbook with a single sheet
pub fn render_workbook(scans: &[Scan]) -> Result<Vec<u8>, XlsxError> {
    let mut workbook = Workbook::new();
    let header = Format::new().set_bold();

    let worksheet = workbook.add_worksheet();
    worksheet.set_name(SHEET_NAME)?;

    for (col, name) in EXPORT_COLUMNS.iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, *name, &header)?;
    }

    for (i, scan) in scans.iter().enumerate() {
        let row = i as u32 + 1;
        let scanned_at = scan.scanned_at.format(EXPORT_TIMESTAMP_FORMAT).to_string();
        worksheet.write_number(row, 0, scan.id as f64)?;
        worksheet.write_string(row, 1, &scan.barcode)?;
        worksheet.write_string(row, 2, scanned_at)?;
    }

    worksheet.set_column_width(1, 24)?;
    worksheet.set_column_width(2, 20)?;

    workbook.save_to_buffer()
}
