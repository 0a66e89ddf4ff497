//! Ordered key-value persistence on SQLite.
//!
//! All gateway state (messages, sessions, dedup pointers, balances, receipt
//! markers) lives in one `kv` table keyed by colon-separated string keys.
//! Lexicographic key order is the storage contract: timestamps inside keys
//! are zero-padded so a prefix range scan returns records in time order.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000.
//! PRAGMA integrity_check runs at open; returns error if it fails.
//!
//! Shared as `SharedKv` (`Arc<tokio::sync::Mutex<Kv>>`); holding the lock
//! across a read-modify-write gives single-writer atomicity per key.

use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

pub mod conversation;
pub mod ledger;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Exclusive upper bound for a prefix range scan.
///
/// U+10FFFF sorts after every other scalar in UTF-8 byte order, so
/// `prefix <= key < prefix + U+10FFFF` covers exactly the keys under prefix.
fn prefix_upper_bound(prefix: &str) -> String {
    format!("{prefix}\u{10FFFF}")
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity: {0}")]
    IntegrityCheckFailed(String),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
}

pub type KvResult<T> = Result<T, KvError>;

pub type SharedKv = Arc<Mutex<Kv>>;

pub struct Kv {
    conn: Connection,
}

impl Kv {
    pub fn open(path: &Path) -> KvResult<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        let kv = Self { conn };
        kv.apply_pragmas()?;
        kv.integrity_check()?;
        kv.apply_schema()?;
        Ok(kv)
    }

    pub fn open_in_memory() -> KvResult<Self> {
        let conn = Connection::open_in_memory()?;
        let kv = Self { conn };
        kv.apply_schema()?;
        Ok(kv)
    }

    pub fn into_shared(self) -> SharedKv {
        Arc::new(Mutex::new(self))
    }

    pub fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut stmt = self.conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |r| r.get::<_, String>(0))?;
        Ok(rows.next().transpose()?)
    }

    pub fn put(&self, key: &str, value: &str) -> KvResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> KvResult<()> {
        self.conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn exists(&self, key: &str) -> KvResult<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM kv WHERE key = ?1",
            params![key],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// All `(key, value)` pairs under `prefix`, in key order
    /// (or reverse key order), up to `limit` when given.
    pub fn scan_prefix(
        &self,
        prefix: &str,
        limit: Option<usize>,
        reverse: bool,
    ) -> KvResult<Vec<(String, String)>> {
        let sql = if reverse {
            "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key DESC LIMIT ?3"
        } else {
            "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key ASC LIMIT ?3"
        };
        let upper = prefix_upper_bound(prefix);
        let limit = limit.map_or(-1, |l| l as i64);
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![prefix, upper, limit], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -- internal --

    fn apply_pragmas(&self) -> KvResult<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA wal_autocheckpoint=1000;",
        )?;
        Ok(())
    }

    fn integrity_check(&self) -> KvResult<()> {
        let result: String = self
            .conn
            .pragma_query_value(None, "integrity_check", |row| row.get(0))?;
        if result != "ok" {
            return Err(KvError::IntegrityCheckFailed(result));
        }
        Ok(())
    }

    fn apply_schema(&self) -> KvResult<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_round_trip() {
        let kv = Kv::open_in_memory().unwrap();
        assert_eq!(kv.get("a").unwrap(), None);
        kv.put("a", "1").unwrap();
        assert_eq!(kv.get("a").unwrap(), Some("1".to_owned()));
        assert!(kv.exists("a").unwrap());
        kv.put("a", "2").unwrap();
        assert_eq!(kv.get("a").unwrap(), Some("2".to_owned()));
        kv.delete("a").unwrap();
        assert!(!kv.exists("a").unwrap());
    }

    #[test]
    fn scan_prefix_is_ordered_and_bounded() {
        let kv = Kv::open_in_memory().unwrap();
        kv.put("m:u1:001", "a").unwrap();
        kv.put("m:u1:003", "c").unwrap();
        kv.put("m:u1:002", "b").unwrap();
        kv.put("m:u2:001", "x").unwrap();
        kv.put("n:u1:001", "y").unwrap();

        let forward = kv.scan_prefix("m:u1:", None, false).unwrap();
        let keys: Vec<_> = forward.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["m:u1:001", "m:u1:002", "m:u1:003"]);

        let reversed = kv.scan_prefix("m:u1:", Some(2), true).unwrap();
        let keys: Vec<_> = reversed.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["m:u1:003", "m:u1:002"]);
    }

    #[test]
    fn scan_prefix_does_not_leak_sibling_prefixes() {
        let kv = Kv::open_in_memory().unwrap();
        kv.put("hash:event:abc", "1").unwrap();
        kv.put("hash:u1:s1:0:user", "2").unwrap();
        let events = kv.scan_prefix("hash:event:", None, false).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "hash:event:abc");
    }

    #[test]
    fn open_on_disk_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/db.sqlite3");
        let kv = Kv::open(&path).unwrap();
        kv.put("k", "v").unwrap();
        drop(kv);
        let reopened = Kv::open(&path).unwrap();
        assert_eq!(reopened.get("k").unwrap(), Some("v".to_owned()));
    }
}
