//! Filtered scan queries.
//!
//! Filters are conjunctive: a date range over `scanned_at` (start inclusive,
//! end exclusive) and a case-sensitive substring match on `barcode`. Results
//! are always newest first.

use crate::schema::to_storage;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use serde::{de, Deserialize, Deserializer};
use sqlx::{QueryBuilder, Sqlite};

/// Page size used when the caller does not pass `limit`
pub const DEFAULT_LIMIT: u32 = 100;

const SELECT_SCANS: &str = "SELECT id, barcode, scanned_at FROM scans WHERE 1=1";

/// Predicates narrowing the scan set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Start time (inclusive)
    pub start_date: Option<DateTime<Utc>>,
    /// End time (exclusive)
    pub end_date: Option<DateTime<Utc>>,
    /// Substring the barcode must contain
    pub barcode: Option<String>,
}

/// Offset pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub skip: u32,
    pub limit: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl ScanFilter {
    /// Filter on barcode substring only
    pub fn barcode<S: Into<String>>(needle: S) -> Self {
        Self {
            barcode: Some(needle.into()),
            ..Default::default()
        }
    }

    /// Filter on a `[start, end)` time window
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start_date: Some(start),
            end_date: Some(end),
            ..Default::default()
        }
    }

    fn barcode_needle(&self) -> Option<&str> {
        self.barcode.as_deref().filter(|b| !b.is_empty())
    }

    fn push_predicates(&self, qb: &mut QueryBuilder<'static, Sqlite>) {
        if let Some(start) = self.start_date {
            qb.push(" AND scanned_at >= ").push_bind(to_storage(&ceil_micros(start)));
        }
        if let Some(end) = self.end_date {
            qb.push(" AND scanned_at < ").push_bind(to_storage(&ceil_micros(end)));
        }
        // instr is case-sensitive, LIKE is not
        if let Some(needle) = self.barcode_needle() {
            qb.push(" AND instr(barcode, ")
                .push_bind(needle.to_string())
                .push(") > 0");
        }
    }
}

/// Round a bound up to the microsecond precision of stored timestamps.
///
/// Stored values are whole microseconds, so `stored >= t` and `stored < t`
/// hold exactly when they hold against the rounded-up bound.
fn ceil_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    if ts.timestamp_subsec_nanos() % 1_000 == 0 {
        ts
    } else {
        ts.trunc_subsecs(6) + Duration::microseconds(1)
    }
}

/// Build the SELECT for a filter, newest first, optionally paginated
pub fn select_scans(filter: &ScanFilter, page: Option<Page>) -> QueryBuilder<'static, Sqlite> {
    let mut qb = QueryBuilder::new(SELECT_SCANS);
    filter.push_predicates(&mut qb);
    qb.push(" ORDER BY scanned_at DESC, id DESC");

    if let Some(page) = page {
        qb.push(" LIMIT ")
            .push_bind(i64::from(page.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(page.skip));
    }

    qb
}

/// Query parameters for the scan list
#[derive(Debug, Deserialize)]
pub struct ListScansParams {
    /// Rows to skip
    #[serde(default)]
    pub skip: u32,
    /// Maximum rows returned
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Start time (inclusive)
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    pub start_date: Option<DateTime<Utc>>,
    /// End time (exclusive)
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    pub end_date: Option<DateTime<Utc>>,
    /// Barcode substring
    pub barcode: Option<String>,
}

fn default_limit() -> u32 {
    DEFAULT_LIMIT
}

impl ListScansParams {
    pub fn into_parts(self) -> (ScanFilter, Page) {
        let filter = ScanFilter {
            start_date: self.start_date,
            end_date: self.end_date,
            barcode: self.barcode,
        };
        let page = Page {
            skip: self.skip,
            limit: self.limit,
        };
        (filter, page)
    }
}

/// Query parameters for the export (no pagination)
#[derive(Debug, Deserialize)]
pub struct ExportScansParams {
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    pub end_date: Option<DateTime<Utc>>,
    pub barcode: Option<String>,
}

impl From<ExportScansParams> for ScanFilter {
    fn from(p: ExportScansParams) -> Self {
        Self {
            start_date: p.start_date,
            end_date: p.end_date,
            barcode: p.barcode,
        }
    }
}

/// Parse a timestamp from a query string.
///
/// Accepts RFC 3339 with an offset, naive `YYYY-MM-DDTHH:MM:SS[.f]` (also with
/// a space separator) read as UTC, and a bare `YYYY-MM-DD` read as midnight UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(naive.and_utc());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }

    Err(format!(
        "invalid datetime `{raw}`, expected YYYY-MM-DDTHH:MM:SS or RFC 3339"
    ))
}

fn deserialize_optional_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => parse_timestamp(s).map(Some).map_err(de::Error::custom),
    }
}
