use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task;
use crate::error::{Result, CallIndexError};

pub mod migrate;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection wrapper
///
/// Every call opens its own connection, so index writers and query readers
/// never share a transaction scope.
#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

/// Apply connection pragmas.
///
/// WAL lets readers see the last committed state while a batch is being
/// written; busy_timeout makes concurrent writers queue on the lock instead
/// of failing with SQLITE_BUSY.
fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL; \
         PRAGMA synchronous = NORMAL; \
         PRAGMA foreign_keys = ON; \
         PRAGMA temp_store = MEMORY; \
         PRAGMA cache_size = -65536; \
         PRAGMA mmap_size = 268435456; \
         PRAGMA wal_autocheckpoint = 1000;"
    )?;
    Ok(())
}

/// Column format for `recordings.recorded_at` (UTC, sortable as text)
pub const RECORDED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Canonical text form of store timestamps; fixed width so text order is time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CallIndexError::Parse(format!("invalid timestamp {:?}: {}", value, e)))
}

pub fn format_recorded_at(ts: &NaiveDateTime) -> String {
    ts.format(RECORDED_AT_FORMAT).to_string()
}

pub fn parse_recorded_at(value: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, RECORDED_AT_FORMAT)
        .map_err(|e| CallIndexError::Parse(format!("invalid recorded_at {:?}: {}", value, e)))
}

impl Db {
    /// Create a new database connection manager
    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        Self {
            path: db_path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a new database connection with optimized pragmas
    pub fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .map_err(CallIndexError::Database)?;
        configure(&conn)?;
        Ok(conn)
    }

    /// Execute a closure with a database connection in a blocking task
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        task::spawn_blocking(move || {
            let mut conn = db.open_connection()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| CallIndexError::Join(e.to_string()))?
    }

    /// Apply pending migrations from `migrations_dir`, returning how many ran
    pub async fn migrate(&self, migrations_dir: &Path) -> Result<usize> {
        let dir = migrations_dir.to_path_buf();
        self.with_connection(move |conn| migrate::run_migrations(conn, &dir)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_db_connection() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Db::new(&db_path);

        let result = db.with_connection(|conn| {
            conn.execute("CREATE TABLE test (id INTEGER PRIMARY KEY)", [])
                .map_err(CallIndexError::Database)?;
            Ok(())
        }).await;

        assert!(result.is_ok());
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_pragmas_set() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Db::new(&db_path);

        db.with_connection(|conn| {
            let journal_mode: String = conn.query_row(
                "PRAGMA journal_mode",
                [],
                |row| row.get(0)
            )?;
            assert_eq!(journal_mode.to_uppercase(), "WAL");

            let busy_timeout: i64 = conn.query_row(
                "PRAGMA busy_timeout",
                [],
                |row| row.get(0)
            )?;
            assert_eq!(busy_timeout, 5000);

            Ok::<(), CallIndexError>(())
        }).await.unwrap();
    }

    #[test]
    fn test_timestamp_text_order_matches_time_order() {
        let earlier = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let (a, b) = (format_timestamp(&earlier), format_timestamp(&later));
        assert!(a < b);
        assert_eq!(parse_timestamp(&a).unwrap(), earlier);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[tokio::test]
    async fn test_migrate_creates_tables() {
        let temp_dir = TempDir::new().unwrap();
        let db = Db::new(temp_dir.path().join("test.db"));
        let migrations_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        db.migrate(&migrations_dir).await.unwrap();

        let count: i64 = db.with_connection(|conn| {
            let c = conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='recordings'",
                [],
                |row| row.get(0),
            )?;
            Ok(c)
        }).await.unwrap();
        assert_eq!(count, 1);
    }
}
