use std::path::Path;

use chrono::{DateTime, Local, NaiveDate};
use thiserror::Error;
use tokio_rusqlite::Connection;

use crate::attendance::AttendanceLedger;

const DAY_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
}

/// SQLite-backed attendance log.
///
/// One row per user per calendar day; the `UNIQUE(user, day)` constraint
/// makes a second insert for the same day a no-op even when two streams
/// confirm at the same moment.
#[derive(Clone)]
pub struct AttendanceStore {
    conn: Connection,
    runtime: tokio::runtime::Handle,
}

impl AttendanceStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS attendance (
                     id TEXT PRIMARY KEY,
                     user TEXT NOT NULL,
                     day TEXT NOT NULL,
                     recorded_at TEXT NOT NULL,
                     UNIQUE(user, day)
                 );
                 CREATE INDEX IF NOT EXISTS idx_attendance_user
                     ON attendance(user, recorded_at);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            conn,
            runtime: tokio::runtime::Handle::current(),
        })
    }

    /// Whether `user` already has a record on `date`.
    pub async fn exists_on(&self, user: &str, date: NaiveDate) -> Result<bool, StoreError> {
        let user = user.to_string();
        let day = date.format(DAY_FORMAT).to_string();
        self.conn
            .call(move |conn| {
                let count: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM attendance WHERE user = ?1 AND day = ?2",
                    [&user, &day],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Insert a record stamped `at`. Returns `false` if the user already had
    /// one for that day.
    pub async fn insert(&self, user: &str, at: DateTime<Local>) -> Result<bool, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let user = user.to_string();
        let day = at.date_naive().format(DAY_FORMAT).to_string();
        let recorded_at = at.to_rfc3339();

        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "INSERT OR IGNORE INTO attendance (id, user, day, recorded_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, user, day, recorded_at],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Most recent records for a user, newest first.
    pub async fn recent_for_user(
        &self,
        user: &str,
        limit: usize,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let user = user.to_string();
        let limit = limit as i64;
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user, day, recorded_at
                     FROM attendance WHERE user = ?1
                     ORDER BY day DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![user, limit], |row| {
                    Ok(AttendanceRecord {
                        id: row.get(0)?,
                        user: row.get(1)?,
                        day: row.get(2)?,
                        recorded_at: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count records across all users.
    pub async fn count_all(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }
}

/// Stream drivers run on plain threads and reach the store through the
/// runtime handle captured at open. Must not be called from inside the
/// runtime itself.
impl AttendanceLedger for AttendanceStore {
    fn exists_for_date(&self, user: &str, date: NaiveDate) -> Result<bool, StoreError> {
        self.runtime.block_on(self.exists_on(user, date))
    }

    fn create(&self, user: &str, at: DateTime<Local>) -> Result<bool, StoreError> {
        self.runtime.block_on(self.insert(user, at))
    }
}

/// One day of attendance.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub user: String,
    /// Local calendar date, `YYYY-MM-DD`.
    pub day: String,
    /// RFC 3339 timestamp with the local offset.
    pub recorded_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_insert_then_exists() {
        let store = AttendanceStore::open(Path::new(":memory:")).await.unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();

        assert!(!store.exists_on("alice", day).await.unwrap());
        assert!(store.insert("alice", at(2024, 3, 4, 9)).await.unwrap());
        assert!(store.exists_on("alice", day).await.unwrap());
        assert!(!store.exists_on("bob", day).await.unwrap());
        assert!(!store
            .exists_on("alice", day.succ_opt().unwrap())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_second_insert_same_day_is_ignored() {
        let store = AttendanceStore::open(Path::new(":memory:")).await.unwrap();

        assert!(store.insert("alice", at(2024, 3, 4, 9)).await.unwrap());
        assert!(!store.insert("alice", at(2024, 3, 4, 17)).await.unwrap());
        assert!(store.insert("alice", at(2024, 3, 5, 9)).await.unwrap());
        assert_eq!(store.count_all().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_recent_for_user_newest_first() {
        let store = AttendanceStore::open(Path::new(":memory:")).await.unwrap();

        store.insert("alice", at(2024, 3, 1, 9)).await.unwrap();
        store.insert("alice", at(2024, 3, 3, 9)).await.unwrap();
        store.insert("alice", at(2024, 3, 2, 9)).await.unwrap();
        store.insert("bob", at(2024, 3, 2, 9)).await.unwrap();

        let records = store.recent_for_user("alice", 2).await.unwrap();
        let days: Vec<&str> = records.iter().map(|r| r.day.as_str()).collect();
        assert_eq!(days, ["2024-03-03", "2024-03-02"]);
        assert!(records.iter().all(|r| r.user == "alice"));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/attendance.db");

        let store = AttendanceStore::open(&path).await.unwrap();
        store.insert("alice", at(2024, 3, 4, 9)).await.unwrap();
        drop(store);

        let store = AttendanceStore::open(&path).await.unwrap();
        assert_eq!(store.count_all().await.unwrap(), 1);
    }

    #[test]
    fn test_ledger_from_plain_thread() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let store = rt
            .block_on(AttendanceStore::open(Path::new(":memory:")))
            .unwrap();
        let ledger: &dyn AttendanceLedger = &store;
        let now = at(2024, 3, 4, 9);

        assert!(!ledger.exists_for_date("alice", now.date_naive()).unwrap());
        assert!(ledger.create("alice", now).unwrap());
        assert!(ledger.exists_for_date("alice", now.date_naive()).unwrap());
        assert!(!ledger.create("alice", now).unwrap());
    }
}
