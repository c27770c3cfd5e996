//! SQLite-backed checkpoint store.
//!
//! One row per (south, scan mode, item). Writes are serialized through a single
//! connection; an upsert never moves `max_instant` backwards.
//!
//! `south_files` records the modification time of every file a South has already read
//! while leaving it in place.

use crate::error::CheckpointError;
use crate::model::{format_instant, parse_instant, Instant};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub type Result<T> = std::result::Result<T, CheckpointError>;

const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS south_cache (
    south_id TEXT NOT NULL,
    scan_mode_id TEXT NOT NULL,
    item_id TEXT NOT NULL,
    max_instant TEXT NOT NULL,
    PRIMARY KEY (south_id, scan_mode_id, item_id)
);
CREATE TABLE IF NOT EXISTS south_files (
    south_id TEXT NOT NULL,
    filename TEXT NOT NULL,
    modified_at TEXT NOT NULL,
    PRIMARY KEY (south_id, filename)
);
";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointKey {
    pub south_id: String,
    pub scan_mode_id: String,
    pub item_id: String,
}

impl CheckpointKey {
    pub fn new(
        south_id: impl Into<String>,
        scan_mode_id: impl Into<String>,
        item_id: impl Into<String>,
    ) -> Self {
        Self {
            south_id: south_id.into(),
            scan_mode_id: scan_mode_id.into(),
            item_id: item_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub key: CheckpointKey,
    pub max_instant: Instant,
}

pub struct CheckpointStore {
    conn: Mutex<Connection>,
}

impl CheckpointStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CheckpointError::LockPoisoned)
    }

    pub fn get(&self, key: &CheckpointKey) -> Result<Option<Instant>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT max_instant FROM south_cache WHERE south_id = ?1 AND scan_mode_id = ?2 AND item_id = ?3",
                params![key.south_id, key.scan_mode_id, key.item_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|value| parse_instant(&value).ok_or(CheckpointError::InvalidInstant(value)))
            .transpose()
    }

    /// Moves the checkpoint forward to `instant` and returns the stored value.
    ///
    /// An `instant` older than the stored one leaves the row untouched.
    pub fn advance(&self, key: &CheckpointKey, instant: &Instant) -> Result<Instant> {
        let formatted = format_instant(instant);
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO south_cache (south_id, scan_mode_id, item_id, max_instant)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (south_id, scan_mode_id, item_id)
             DO UPDATE SET max_instant = excluded.max_instant
             WHERE excluded.max_instant > south_cache.max_instant",
            params![key.south_id, key.scan_mode_id, key.item_id, formatted],
        )?;
        let stored: String = conn.query_row(
            "SELECT max_instant FROM south_cache WHERE south_id = ?1 AND scan_mode_id = ?2 AND item_id = ?3",
            params![key.south_id, key.scan_mode_id, key.item_id],
            |row| row.get(0),
        )?;
        parse_instant(&stored).ok_or(CheckpointError::InvalidInstant(stored))
    }

    pub fn list_for_south(&self, south_id: &str) -> Result<Vec<Checkpoint>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT scan_mode_id, item_id, max_instant FROM south_cache WHERE south_id = ?1 ORDER BY item_id, scan_mode_id",
        )?;
        let rows = stmt.query_map(params![south_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (scan_mode_id, item_id, raw) = row?;
            let max_instant = parse_instant(&raw).ok_or(CheckpointError::InvalidInstant(raw))?;
            out.push(Checkpoint {
                key: CheckpointKey::new(south_id, scan_mode_id, item_id),
                max_instant,
            });
        }
        Ok(out)
    }

    /// Drops every checkpoint and seen-file record of `south_id`; returns the checkpoint count.
    pub fn delete_for_south(&self, south_id: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM south_files WHERE south_id = ?1", params![south_id])?;
        Ok(conn.execute("DELETE FROM south_cache WHERE south_id = ?1", params![south_id])?)
    }

    /// Files already read by `south_id`, with the modification time they had then.
    pub fn seen_files(&self, south_id: &str) -> Result<HashMap<String, Instant>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT filename, modified_at FROM south_files WHERE south_id = ?1")?;
        let rows = stmt.query_map(params![south_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (filename, raw) = row?;
            let modified_at = parse_instant(&raw).ok_or(CheckpointError::InvalidInstant(raw))?;
            out.insert(filename, modified_at);
        }
        Ok(out)
    }

    pub fn record_seen_file(&self, south_id: &str, filename: &str, modified_at: &Instant) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO south_files (south_id, filename, modified_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (south_id, filename) DO UPDATE SET modified_at = excluded.modified_at",
            params![south_id, filename, format_instant(modified_at)],
        )?;
        Ok(())
    }

    pub fn delete_for_item(&self, south_id: &str, item_id: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        Ok(conn.execute(
            "DELETE FROM south_cache WHERE south_id = ?1 AND item_id = ?2",
            params![south_id, item_id],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn at(secs: u32) -> Instant {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap()
    }

    #[test]
    fn missing_checkpoint_is_none() {
        let store = CheckpointStore::open_in_memory().unwrap();
        let key = CheckpointKey::new("s", "m", "i");
        assert_eq!(store.get(&key).unwrap(), None);
    }

    #[test]
    fn advance_is_monotonic() {
        let store = CheckpointStore::open_in_memory().unwrap();
        let key = CheckpointKey::new("s", "m", "i");
        assert_eq!(store.advance(&key, &at(10)).unwrap(), at(10));
        assert_eq!(store.advance(&key, &at(5)).unwrap(), at(10));
        assert_eq!(store.advance(&key, &at(10)).unwrap(), at(10));
        assert_eq!(store.advance(&key, &at(30)).unwrap(), at(30));
        assert_eq!(store.get(&key).unwrap(), Some(at(30)));
        assert_eq!(store.list_for_south("s").unwrap().len(), 1);
    }

    #[test]
    fn triples_are_independent() {
        let store = CheckpointStore::open_in_memory().unwrap();
        let a = CheckpointKey::new("s", "fast", "i");
        let b = CheckpointKey::new("s", "slow", "i");
        store.advance(&a, &at(20)).unwrap();
        store.advance(&b, &at(3)).unwrap();
        assert_eq!(store.get(&a).unwrap(), Some(at(20)));
        assert_eq!(store.get(&b).unwrap(), Some(at(3)));
        assert_eq!(store.delete_for_item("s", "i").unwrap(), 2);
        assert_eq!(store.get(&a).unwrap(), None);
    }

    #[test]
    fn seen_files_are_upserted_and_purged_with_the_south() {
        let store = CheckpointStore::open_in_memory().unwrap();
        store.record_seen_file("s", "a.csv", &at(1)).unwrap();
        store.record_seen_file("s", "a.csv", &at(7)).unwrap();
        store.record_seen_file("other", "a.csv", &at(2)).unwrap();
        store.advance(&CheckpointKey::new("s", "m", "i"), &at(9)).unwrap();

        let seen = store.seen_files("s").unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen["a.csv"], at(7));

        assert_eq!(store.delete_for_south("s").unwrap(), 1);
        assert!(store.seen_files("s").unwrap().is_empty());
        assert_eq!(store.seen_files("other").unwrap().len(), 1);
    }

    #[test]
    fn checkpoints_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("checkpoints.db");
        let key = CheckpointKey::new("s", "m", "i");
        {
            let store = CheckpointStore::open(&path).unwrap();
            store.advance(&key, &at(42)).unwrap();
        }
        let store = CheckpointStore::open(&path).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(at(42)));
        assert_eq!(store.delete_for_south("s").unwrap(), 1);
        assert!(store.list_for_south("s").unwrap().is_empty());
    }
}
