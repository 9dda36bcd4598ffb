//! Durable storage for meter rows: a single SQLite file (bundled, no
//! external server needed), schema per spec §6 with a unique index on
//! `(url, referrer)`. SQLite is this corpus's precedent for an embedded,
//! single-file durable store backing exactly this kind of counter table.

use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::core::error::ProxyError;

/// One row's current admission state, as read-modify-written atomically.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterRow {
    pub window_count: u32,
    pub window_start: f64,
    pub total: u64,
    pub rejected: u64,
}

#[async_trait]
pub trait MeterStorage: Send + Sync {
    /// Ensures a row exists for `(resource_url, referrer_key)`, returning
    /// its current state (a fresh row starts at all zeros).
    async fn ensure_row(&self, resource_url: &str, referrer_key: &str) -> Result<MeterRow, ProxyError>;

    /// Atomically applies the sliding-window admission algorithm (spec
    /// §4.6) to the row and returns whether the request was admitted.
    async fn admit(
        &self,
        resource_url: &str,
        referrer_key: &str,
        window_seconds: f64,
        rate_limit: u32,
        now: f64,
    ) -> Result<bool, ProxyError>;

    /// Drops all rows (used on resource-table refresh, spec §4.6).
    async fn reset(&self) -> Result<(), ProxyError>;

    /// Returns every row, for the status page's meter dump.
    async fn dump(&self) -> Result<Vec<(String, String, MeterRow)>, ProxyError>;
}

pub struct SqliteMeterStorage {
    conn: Mutex<Connection>,
}

impl SqliteMeterStorage {
    pub fn open(path: &str) -> Result<Self, ProxyError> {
        let conn = Connection::open(path)
            .map_err(|e| ProxyError::LimiterUnavailable(format!("failed to open meter store: {e}")))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, ProxyError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ProxyError::LimiterUnavailable(format!("failed to open meter store: {e}")))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), ProxyError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meter_rows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL,
                referrer TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                rate REAL NOT NULL DEFAULT 0,
                time REAL NOT NULL DEFAULT 0,
                total INTEGER NOT NULL DEFAULT 0,
                rejected INTEGER NOT NULL DEFAULT 0,
                UNIQUE(url, referrer)
            );",
        )
        .map_err(|e| ProxyError::LimiterUnavailable(format!("failed to initialize schema: {e}")))
    }
}

#[async_trait]
impl MeterStorage for SqliteMeterStorage {
    async fn ensure_row(&self, resource_url: &str, referrer_key: &str) -> Result<MeterRow, ProxyError> {
        let conn = self.conn.lock().expect("meter store lock poisoned");

        conn.execute(
            "INSERT OR IGNORE INTO meter_rows (url, referrer) VALUES (?1, ?2)",
            params![resource_url, referrer_key],
        )
        .map_err(|e| ProxyError::LimiterUnavailable(format!("insert failed: {e}")))?;

        read_row(&conn, resource_url, referrer_key)?
            .ok_or_else(|| ProxyError::LimiterUnavailable("row vanished after insert".to_string()))
    }

    async fn admit(
        &self,
        resource_url: &str,
        referrer_key: &str,
        window_seconds: f64,
        rate_limit: u32,
        now: f64,
    ) -> Result<bool, ProxyError> {
        let conn = self.conn.lock().expect("meter store lock poisoned");

        conn.execute(
            "INSERT OR IGNORE INTO meter_rows (url, referrer) VALUES (?1, ?2)",
            params![resource_url, referrer_key],
        )
        .map_err(|e| ProxyError::LimiterUnavailable(format!("insert failed: {e}")))?;

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| ProxyError::LimiterUnavailable(format!("failed to start transaction: {e}")))?;

        let row = read_row(&tx, resource_url, referrer_key)?
            .ok_or_else(|| ProxyError::LimiterUnavailable("row missing".to_string()))?;

        let (new_count, new_start, admitted, new_total, new_rejected) =
            if row.window_count == 0 || row.window_start + window_seconds <= now {
                (1, now, true, row.total + 1, row.rejected)
            } else if row.window_count < rate_limit {
                (row.window_count + 1, row.window_start, true, row.total + 1, row.rejected)
            } else {
                (row.window_count, row.window_start, false, row.total, row.rejected + 1)
            };

        tx.execute(
            "UPDATE meter_rows SET count = ?1, time = ?2, total = ?3, rejected = ?4
             WHERE url = ?5 AND referrer = ?6",
            params![new_count, new_start, new_total, new_rejected, resource_url, referrer_key],
        )
        .map_err(|e| ProxyError::LimiterUnavailable(format!("update failed: {e}")))?;

        tx.commit()
            .map_err(|e| ProxyError::LimiterUnavailable(format!("commit failed: {e}")))?;

        Ok(admitted)
    }

    async fn reset(&self) -> Result<(), ProxyError> {
        let conn = self.conn.lock().expect("meter store lock poisoned");
        conn.execute("DELETE FROM meter_rows", [])
            .map_err(|e| ProxyError::LimiterUnavailable(format!("reset failed: {e}")))?;
        Ok(())
    }

    async fn dump(&self) -> Result<Vec<(String, String, MeterRow)>, ProxyError> {
        let conn = self.conn.lock().expect("meter store lock poisoned");
        let mut stmt = conn
            .prepare("SELECT url, referrer, count, time, total, rejected FROM meter_rows ORDER BY url, referrer")
            .map_err(|e| ProxyError::LimiterUnavailable(format!("prepare failed: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    MeterRow {
                        window_count: row.get(2)?,
                        window_start: row.get(3)?,
                        total: row.get(4)?,
                        rejected: row.get(5)?,
                    },
                ))
            })
            .map_err(|e| ProxyError::LimiterUnavailable(format!("query failed: {e}")))?;

        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ProxyError::LimiterUnavailable(format!("row decode failed: {e}")))
    }
}

fn read_row(conn: &Connection, resource_url: &str, referrer_key: &str) -> Result<Option<MeterRow>, ProxyError> {
    conn.query_row(
        "SELECT count, time, total, rejected FROM meter_rows WHERE url = ?1 AND referrer = ?2",
        params![resource_url, referrer_key],
        |row| {
            Ok(MeterRow {
                window_count: row.get(0)?,
                window_start: row.get(1)?,
                total: row.get(2)?,
                rejected: row.get(3)?,
            })
        },
    )
    .optional()
    .map_err(|e| ProxyError::LimiterUnavailable(format!("select failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn row_is_preallocated_at_zero() {
        let store = SqliteMeterStorage::open_in_memory().unwrap();
        let row = store.ensure_row("http://host/a", "*").await.unwrap();
        assert_eq!(row.window_count, 0);
        assert_eq!(row.total, 0);
    }

    #[tokio::test]
    async fn admits_up_to_cap_then_denies() {
        let store = SqliteMeterStorage::open_in_memory().unwrap();
        let window = 60.0;
        let cap = 3;

        for i in 0..cap {
            let admitted = store.admit("http://host/a", "*", window, cap, i as f64).await.unwrap();
            assert!(admitted, "request {i} should be admitted");
        }

        let denied = store.admit("http://host/a", "*", window, cap, 3.0).await.unwrap();
        assert!(!denied);
    }

    #[tokio::test]
    async fn new_window_resets_count_after_expiry() {
        let store = SqliteMeterStorage::open_in_memory().unwrap();
        let window = 10.0;
        let cap = 1;

        assert!(store.admit("http://host/a", "*", window, cap, 0.0).await.unwrap());
        assert!(!store.admit("http://host/a", "*", window, cap, 5.0).await.unwrap());
        assert!(store.admit("http://host/a", "*", window, cap, 11.0).await.unwrap());
    }

    #[tokio::test]
    async fn reset_clears_all_rows() {
        let store = SqliteMeterStorage::open_in_memory().unwrap();
        store.ensure_row("http://host/a", "*").await.unwrap();
        store.reset().await.unwrap();
        let row = store.ensure_row("http://host/a", "*").await.unwrap();
        assert_eq!(row.window_count, 0);
    }

    #[tokio::test]
    async fn dump_reflects_admitted_rows() {
        let store = SqliteMeterStorage::open_in_memory().unwrap();
        store.admit("http://host/a", "*", 60.0, 3, 0.0).await.unwrap();
        let rows = store.dump().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "http://host/a");
        assert_eq!(rows[0].2.total, 1);
    }

    /// Spec §6: the meter store is a single file in the working directory.
    /// Exercises the real file-backed path rather than `open_in_memory`,
    /// including that a second `open` against the same file sees rows
    /// written by the first (durability across connections).
    #[tokio::test]
    async fn admissions_persist_across_reopening_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meter.sqlite3");
        let path_str = path.to_str().unwrap();

        {
            let store = SqliteMeterStorage::open(path_str).unwrap();
            assert!(store.admit("http://host/a", "*", 60.0, 3, 0.0).await.unwrap());
            assert!(store.admit("http://host/a", "*", 60.0, 3, 1.0).await.unwrap());
        }

        let reopened = SqliteMeterStorage::open(path_str).unwrap();
        let row = reopened.ensure_row("http://host/a", "*").await.unwrap();
        assert_eq!(row.window_count, 2);
        assert_eq!(row.total, 2);
    }
}
