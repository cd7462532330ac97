use crate::config::DatabaseConfig;
use crate::query::{select_scans, Page, ScanFilter};
use crate::schema::{to_storage, Scan, ScanRow};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Connection, Sqlite};
use std::str::FromStr;
use tracing::{debug, info, instrument, warn};

const CREATE_SCANS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS scans (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        barcode VARCHAR NOT NULL,
        scanned_at DATETIME NOT NULL
    )
"#;

const CREATE_INDEXES: [&str; 2] = [
    "CREATE INDEX IF NOT EXISTS ix_scans_barcode ON scans (barcode)",
    "CREATE INDEX IF NOT EXISTS ix_scans_scanned_at ON scans (scanned_at)",
];

/// Scan store backed by a SQLite connection pool
pub struct ScanStore {
    pool: SqlitePool,
}

impl ScanStore {
    /// Open (and create if missing) the database behind `config.url`
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .with_context(|| format!("Invalid database URL: {}", config.url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect_with(options)
            .await
            .context("Failed to open SQLite database")?;

        info!(url = %config.url, "Connected to SQLite database");

        Ok(Self { pool })
    }

    /// Create the scans table and its indexes if absent
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_SCANS_TABLE)
            .execute(&self.pool)
            .await
            .context("Failed to create scans table")?;

        for ddl in CREATE_INDEXES {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .context("Failed to create scans index")?;
        }

        debug!("Scans schema ready");
        Ok(())
    }

    /// Acquire a session for one unit of work.
    ///
    /// The connection goes back to the pool when the session is dropped.
    pub async fn session(&self) -> Result<ScanSession> {
        let conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire database connection")?;
        Ok(ScanSession { conn })
    }

    /// Round-trip a trivial statement (for readiness checks)
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// One pooled connection held for the duration of a request
pub struct ScanSession {
    conn: PoolConnection<Sqlite>,
}

impl ScanSession {
    /// Insert a scan and return it with its assigned id
    #[instrument(skip(self))]
    pub async fn insert(&mut self, barcode: &str, scanned_at: DateTime<Utc>) -> Result<Scan> {
        let done = sqlx::query("INSERT INTO scans (barcode, scanned_at) VALUES (?1, ?2)")
            .bind(barcode)
            .bind(to_storage(&scanned_at))
            .execute(&mut *self.conn)
            .await
            .context("Failed to insert scan")?;

        let scan = Scan {
            id: done.last_insert_rowid(),
            barcode: barcode.to_string(),
            scanned_at,
        };

        debug!(id = scan.id, "Scan stored");
        Ok(scan)
    }

    /// Select scans matching `filter`, newest first
    #[instrument(skip(self))]
    pub async fn select(&mut self, filter: &ScanFilter, page: Option<Page>) -> Result<Vec<Scan>> {
        let mut qb = select_scans(filter, page);
        let rows = qb
            .build_query_as::<ScanRow>()
            .fetch_all(&mut *self.conn)
            .await
            .context("Failed to query scans")?;

        rows.into_iter().map(ScanRow::into_scan).collect()
    }

    /// Delete every scan in one transaction, returning how many were removed.
    ///
    /// A failure at any step, commit included, leaves the table untouched.
    #[instrument(skip(self))]
    pub async fn delete_all(&mut self) -> Result<u64> {
        let mut tx = self
            .conn
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let deleted = match sqlx::query("DELETE FROM scans").execute(&mut *tx).await {
            Ok(done) => done.rows_affected(),
            Err(e) => {
                // Report the DELETE error even if the rollback fails too
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Failed to roll back delete");
                }
                return Err(e).context("Failed to delete scans");
            }
        };

        // An uncommitted transaction rolls back when dropped
        tx.commit().await.context("Failed to commit delete")?;

        info!(deleted_count = deleted, "Deleted all scans");
        Ok(deleted)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::export::{export_scans, ExportError};
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    /// Store on a fresh database file; the directory lives as long as the guard
    pub(crate) async fn temp_store() -> (ScanStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("scans.db").display()),
            ..Default::default()
        };
        let store = ScanStore::connect(&config).await.unwrap();
        store.ensure_schema().await.unwrap();
        (store, dir)
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, minute, 0).unwrap()
    }

    fn barcodes(scans: &[Scan]) -> Vec<&str> {
        scans.iter().map(|s| s.barcode.as_str()).collect()
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let (store, _dir) = temp_store().await;
        let mut session = store.session().await.unwrap();

        let first = session.insert("A1", at(0)).await.unwrap();
        let second = session.insert("A2", at(1)).await.unwrap();

        assert!(second.id > first.id);
        assert_eq!(second.barcode, "A2");
        assert_eq!(second.scanned_at, at(1));
    }

    #[tokio::test]
    async fn test_ids_not_reused_after_delete() {
        let (store, _dir) = temp_store().await;
        let mut session = store.session().await.unwrap();

        let before = session.insert("X", at(0)).await.unwrap();
        session.delete_all().await.unwrap();
        let after = session.insert("Y", at(1)).await.unwrap();

        assert!(after.id > before.id);
    }

    #[tokio::test]
    async fn test_select_orders_newest_first() {
        let (store, _dir) = temp_store().await;
        let mut session = store.session().await.unwrap();
        session.insert("middle", at(5)).await.unwrap();
        session.insert("oldest", at(1)).await.unwrap();
        session.insert("newest", at(9)).await.unwrap();

        let scans = session.select(&ScanFilter::default(), None).await.unwrap();
        assert_eq!(barcodes(&scans), vec!["newest", "middle", "oldest"]);
    }

    #[tokio::test]
    async fn test_date_range_is_half_open() {
        let (store, _dir) = temp_store().await;
        let mut session = store.session().await.unwrap();
        session.insert("before", at(0)).await.unwrap();
        session.insert("at-start", at(10)).await.unwrap();
        session.insert("inside", at(15)).await.unwrap();
        session.insert("at-end", at(20)).await.unwrap();

        let scans = session
            .select(&ScanFilter::between(at(10), at(20)), None)
            .await
            .unwrap();
        assert_eq!(barcodes(&scans), vec!["inside", "at-start"]);
    }

    #[tokio::test]
    async fn test_range_respects_subsecond_bounds() {
        let (store, _dir) = temp_store().await;
        let mut session = store.session().await.unwrap();
        let end = at(10);
        session.insert("just-before", end - Duration::microseconds(1)).await.unwrap();
        session.insert("exactly-end", end).await.unwrap();

        let scans = session
            .select(&ScanFilter::between(at(0), end), None)
            .await
            .unwrap();
        assert_eq!(barcodes(&scans), vec!["just-before"]);
    }

    #[tokio::test]
    async fn test_range_bounds_finer_than_storage() {
        let (store, _dir) = temp_store().await;
        let mut session = store.session().await.unwrap();
        session.insert("on-the-second", at(0)).await.unwrap();

        let half_micro = Duration::nanoseconds(500);
        let ending_after = ScanFilter {
            end_date: Some(at(0) + half_micro),
            ..Default::default()
        };
        let scans = session.select(&ending_after, None).await.unwrap();
        assert_eq!(barcodes(&scans), vec!["on-the-second"]);

        let starting_after = ScanFilter {
            start_date: Some(at(0) + half_micro),
            ..Default::default()
        };
        assert!(session.select(&starting_after, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_barcode_substring_is_case_sensitive() {
        let (store, _dir) = temp_store().await;
        let mut session = store.session().await.unwrap();
        session.insert("xxabcxx", at(1)).await.unwrap();
        session.insert("ABC", at(2)).await.unwrap();
        session.insert("abc-prefix", at(3)).await.unwrap();
        session.insert("nothing", at(4)).await.unwrap();

        let scans = session.select(&ScanFilter::barcode("abc"), None).await.unwrap();
        assert_eq!(barcodes(&scans), vec!["abc-prefix", "xxabcxx"]);
    }

    #[tokio::test]
    async fn test_barcode_filter_treats_wildcards_literally() {
        let (store, _dir) = temp_store().await;
        let mut session = store.session().await.unwrap();
        session.insert("100%", at(1)).await.unwrap();
        session.insert("1000", at(2)).await.unwrap();

        let scans = session.select(&ScanFilter::barcode("0%"), None).await.unwrap();
        assert_eq!(barcodes(&scans), vec!["100%"]);
    }

    #[tokio::test]
    async fn test_pagination() {
        let (store, _dir) = temp_store().await;
        let mut session = store.session().await.unwrap();
        for minute in 0..5 {
            session.insert(&format!("S{minute}"), at(minute)).await.unwrap();
        }

        let page = session
            .select(&ScanFilter::default(), Some(Page { skip: 1, limit: 2 }))
            .await
            .unwrap();
        assert_eq!(barcodes(&page), vec!["S3", "S2"]);

        let past_end = session
            .select(&ScanFilter::default(), Some(Page { skip: 10, limit: 2 }))
            .await
            .unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn test_delete_all_reports_count() {
        let (store, _dir) = temp_store().await;
        let mut session = store.session().await.unwrap();
        for minute in 0..3 {
            session.insert("S", at(minute)).await.unwrap();
        }

        assert_eq!(session.delete_all().await.unwrap(), 3);
        assert!(session.select(&ScanFilter::default(), None).await.unwrap().is_empty());
        assert_eq!(session.delete_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_all_failure_is_reported() {
        let (store, _dir) = temp_store().await;
        sqlx::query("DROP TABLE scans").execute(store.pool()).await.unwrap();

        let mut session = store.session().await.unwrap();
        let err = session.delete_all().await.unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.starts_with("Failed to delete scans"));
        assert!(chain.contains("no such table"));
        assert!(!chain.contains("roll back"));
    }

    #[tokio::test]
    async fn test_sessions_are_released() {
        let (store, _dir) = temp_store().await;
        // More sessions than the pool holds, sequentially
        for _ in 0..20 {
            let mut session = store.session().await.unwrap();
            session.select(&ScanFilter::default(), None).await.unwrap();
        }
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_sessions_are_released_after_failures() {
        let dir = TempDir::new().unwrap();
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("scans.db").display()),
            max_connections: 2,
            // A leaked connection fails the next acquire instead of hanging
            connect_timeout_secs: 1,
            ..Default::default()
        };
        let store = ScanStore::connect(&config).await.unwrap();
        store.ensure_schema().await.unwrap();
        let rounds = config.max_connections * 3;

        for _ in 0..rounds {
            let mut session = store.session().await.unwrap();
            let err = export_scans(&mut session, &ScanFilter::default())
                .await
                .unwrap_err();
            assert!(matches!(err, ExportError::NoMatches));
        }

        sqlx::query("INSERT INTO scans (barcode, scanned_at) VALUES ('bad', 'yesterday')")
            .execute(store.pool())
            .await
            .unwrap();
        for _ in 0..rounds {
            let mut session = store.session().await.unwrap();
            let err = session.select(&ScanFilter::default(), None).await.unwrap_err();
            assert!(format!("{err:#}").contains("yesterday"));
        }

        sqlx::query("DROP TABLE scans").execute(store.pool()).await.unwrap();
        for _ in 0..rounds {
            let mut session = store.session().await.unwrap();
            assert!(session.delete_all().await.is_err());
        }

        store.session().await.unwrap();
        store.ping().await.unwrap();
    }
}
