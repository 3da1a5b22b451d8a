use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Duration;
use rusqlite::{params, Connection, OptionalExtension};

use super::KeyValueStore;
use crate::clock::{Clock, SystemClock};
use crate::error::StorageError;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};

/// Persistent store for cookie-lifetime values (user id, assignments, UTMs).
pub struct SqliteStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open(path)?),
            clock,
        };
        store.init()?;
        let purged = store.purge_expired()?;
        if purged > 0 {
            log(
                Level::Info,
                Domain::Storage,
                "expired_rows_purged",
                obj(&[("path", v_str(path)), ("rows", v_num(purged as f64))]),
            );
        }
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Delete rows whose TTL has passed. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, StorageError> {
        let now = self.clock.now().timestamp_millis();
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        Ok(n)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Unavailable("sqlite connection lock poisoned".to_string()))
    }
}

impl KeyValueStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn try_get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = self.clock.now().timestamp_millis();
        let conn = self.lock()?;
        let row: Option<(String, Option<i64>)> = conn
            .query_row(
                "SELECT value, expires_at FROM kv WHERE key = ?1",
                params![key],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        match row {
            Some((_, Some(expires_at))) if expires_at <= now => {
                conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    fn try_set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let expires_at = ttl.map(|t| (self.clock.now() + t).timestamp_millis());
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    fn try_remove(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.sqlite");
        let path = path.to_str().unwrap();
        {
            let store = SqliteStore::open(path).unwrap();
            assert!(store.set("sb_user_id", "u_abc", Some(Duration::days(90))));
        }
        let store = SqliteStore::open(path).unwrap();
        assert_eq!(store.get("sb_user_id").as_deref(), Some("u_abc"));
    }

    #[test]
    fn test_expired_rows_are_hidden_and_purged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.sqlite");
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()));
        let store = SqliteStore::open_with_clock(path.to_str().unwrap(), clock.clone()).unwrap();
        store.set("sb_exp_hero", "a", Some(Duration::days(90)));
        store.set("sb_utm", "x", Some(Duration::days(7)));
        store.set("pinned", "y", None);
        clock.advance(Duration::days(8));
        assert_eq!(store.get("sb_utm"), None);
        assert_eq!(store.get("sb_exp_hero").as_deref(), Some("a"));
        clock.advance(Duration::days(90));
        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.get("pinned").as_deref(), Some("y"));
    }

    fn row_count(store: &SqliteStore) -> i64 {
        store
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM kv", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_reopen_purges_expired_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.sqlite");
        let path = path.to_str().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()));
        {
            let store = SqliteStore::open_with_clock(path, clock.clone()).unwrap();
            store.set("sb_utm", "x", Some(Duration::days(7)));
            store.set("sb_user_id", "u_abc", Some(Duration::days(365)));
            assert_eq!(row_count(&store), 2);
        }
        clock.advance(Duration::days(30));
        let store = SqliteStore::open_with_clock(path, clock).unwrap();
        assert_eq!(row_count(&store), 1);
        assert_eq!(store.get("sb_user_id").as_deref(), Some("u_abc"));
    }

    #[test]
    fn test_overwrite_replaces_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.sqlite");
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
        store.set("k", "1", None);
        store.set("k", "2", None);
        assert_eq!(store.get("k").as_deref(), Some("2"));
        store.remove("k");
        assert_eq!(store.get("k"), None);
    }
}
