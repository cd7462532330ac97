use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// On-disk timestamp layout. Always six fractional digits so that string
/// comparison in SQLite orders the same way as time.
pub const STORAGE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// A persisted barcode scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scan {
    /// Storage-assigned identifier
    pub id: i64,
    /// Raw barcode content
    pub barcode: String,
    /// When the scan was recorded (server time)
    pub scanned_at: DateTime<Utc>,
}

/// Request body for recording a scan
///
/// Only `barcode` is accepted; any other field, including a client-side
/// `scanned_at`, is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanCreate {
    pub barcode: String,
}

/// Row as stored in the `scans` table
#[derive(Debug, FromRow)]
pub(crate) struct ScanRow {
    pub id: i64,
    pub barcode: String,
    pub scanned_at: String,
}

impl ScanRow {
    pub(crate) fn into_scan(self) -> Result<Scan> {
        let scanned_at = from_storage(&self.scanned_at)
            .with_context(|| format!("Invalid scanned_at on scan {}", self.id))?;
        Ok(Scan {
            id: self.id,
            barcode: self.barcode,
            scanned_at,
        })
    }
}

/// Current server time at the precision the table keeps
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub(crate) fn to_storage(ts: &DateTime<Utc>) -> String {
    ts.naive_utc().format(STORAGE_TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn from_storage(raw: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .with_context(|| format!("Unrecognized stored timestamp: {raw}"))?;
    Ok(naive.and_utc())
}
