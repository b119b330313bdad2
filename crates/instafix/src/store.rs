//! Persistent post cache backed by SQLite.
//!
//! Two tables move together inside one transaction:
//!
//! - `posts` maps a post id to its encoded record and expiry instant.
//! - `expiry_index` is ordered by `(expires_at, post_id)` so the sweeper can
//!   walk entries oldest-first and stop at the first one still alive.
//!
//! Every `posts` row has exactly one `expiry_index` row; replacing a record
//! moves its index entry instead of leaving a stale one behind.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::codec::{self, CodecError};
use crate::types::PostRecord;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS posts (
    post_id TEXT PRIMARY KEY,
    record BLOB NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS expiry_index (
    expires_at INTEGER NOT NULL,
    post_id TEXT NOT NULL,
    PRIMARY KEY (expires_at, post_id)
) WITHOUT ROWID;
";

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Corrupt record for {post_id}: {source}")]
    Corrupt {
        post_id: String,
        #[source]
        source: CodecError,
    },

    #[error("Encoding failed: {0}")]
    Encode(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timestamp out of range: {0}")]
    Timestamp(i64),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// A record read back from the store along with its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPost {
    pub record: PostRecord,
    pub expires_at: DateTime<Utc>,
}

impl CachedPost {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One row of the time index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryEntry {
    pub expires_at: DateTime<Utc>,
    pub post_id: String,
}

/// Embedded key-value cache of post records with a secondary time index.
pub struct CacheStore {
    db: Mutex<Connection>,
}

impl CacheStore {
    /// Open or create the cache database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(path)?;
        db.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::init(db)
    }

    /// Open a throwaway database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> Result<Self, StoreError> {
        db.busy_timeout(BUSY_TIMEOUT)?;
        db.execute_batch(SCHEMA)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.db.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Look up a record. Expired records are returned as-is; callers decide.
    pub fn get(&self, post_id: &str) -> Result<Option<CachedPost>, StoreError> {
        let db = self.conn()?;
        let row = db
            .query_row(
                "SELECT record, expires_at FROM posts WHERE post_id = ?1",
                params![post_id],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        drop(db);

        let Some((blob, expires_ms)) = row else {
            return Ok(None);
        };
        let record = codec::decode(&blob).map_err(|source| StoreError::Corrupt {
            post_id: post_id.to_string(),
            source,
        })?;
        Ok(Some(CachedPost {
            record,
            expires_at: from_millis(expires_ms)?,
        }))
    }

    /// Store a record that expires `ttl` from now. Returns the expiry instant.
    pub fn put(
        &self,
        post_id: &str,
        record: &PostRecord,
        ttl: Duration,
    ) -> Result<DateTime<Utc>, StoreError> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.put_until(post_id, record, expires_at)?;
        Ok(expires_at)
    }

    /// Store a record with an explicit expiry instant.
    pub fn put_until(
        &self,
        post_id: &str,
        record: &PostRecord,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let blob = codec::encode(record)?;
        let expires_ms = expires_at.timestamp_millis();

        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let previous: Option<i64> = tx
            .query_row(
                "SELECT expires_at FROM posts WHERE post_id = ?1",
                params![post_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(previous) = previous {
            tx.execute(
                "DELETE FROM expiry_index WHERE expires_at = ?1 AND post_id = ?2",
                params![previous, post_id],
            )?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO posts (post_id, record, expires_at) VALUES (?1, ?2, ?3)",
            params![post_id, blob, expires_ms],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO expiry_index (expires_at, post_id) VALUES (?1, ?2)",
            params![expires_ms, post_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Drop a record and its index entry. Returns whether anything was removed.
    pub fn remove(&self, post_id: &str) -> Result<bool, StoreError> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "DELETE FROM expiry_index WHERE post_id = ?1",
            params![post_id],
        )?;
        let removed = tx.execute("DELETE FROM posts WHERE post_id = ?1", params![post_id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Index entries with `expires_at <= until`, oldest first.
    pub fn expiring_before(&self, until: DateTime<Utc>) -> Result<Vec<ExpiryEntry>, StoreError> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT expires_at, post_id FROM expiry_index
             WHERE expires_at <= ?1 ORDER BY expires_at, post_id",
        )?;
        let rows = stmt
            .query_map(params![until.timestamp_millis()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(ms, post_id)| {
                Ok(ExpiryEntry {
                    expires_at: from_millis(ms)?,
                    post_id,
                })
            })
            .collect()
    }

    /// Delete every record whose expiry is at or before `now`.
    ///
    /// Each index entry and its record go in the same transaction, so an
    /// interrupted sweep leaves no orphans. Running it twice is harmless.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let now_ms = now.timestamp_millis();
        let mut db = self.conn()?;
        let tx = db.transaction()?;

        let expired: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT expires_at, post_id FROM expiry_index
                 WHERE expires_at <= ?1 ORDER BY expires_at",
            )?;
            let rows = stmt.query_map(params![now_ms], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<_, _>>()?
        };

        for (expires_ms, post_id) in &expired {
            tx.execute(
                "DELETE FROM expiry_index WHERE expires_at = ?1 AND post_id = ?2",
                params![expires_ms, post_id],
            )?;
            // Only drop the record if it still carries this expiry.
            tx.execute(
                "DELETE FROM posts WHERE post_id = ?1 AND expires_at = ?2",
                params![post_id, expires_ms],
            )?;
        }
        tx.commit()?;
        Ok(expired.len())
    }

    /// Number of stored records.
    pub fn len(&self) -> Result<usize, StoreError> {
        let db = self.conn()?;
        let n: i64 = db.query_row("SELECT COUNT(*) FROM posts", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Number of time index entries. Equal to [`len`](Self::len) unless the
    /// database was modified outside this type.
    pub fn index_len(&self) -> Result<usize, StoreError> {
        let db = self.conn()?;
        let n: i64 = db.query_row("SELECT COUNT(*) FROM expiry_index", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or(StoreError::Timestamp(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaItem;

    fn record(post_id: &str, username: &str) -> PostRecord {
        PostRecord {
            post_id: post_id.to_string(),
            username: username.to_string(),
            caption: String::new(),
            media: vec![MediaItem::new("GraphImage", "https://scontent.cdninstagram.com/x.jpg")],
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_put_then_get() {
        let store = CacheStore::open_in_memory().unwrap();
        let expires = store
            .put("Cabc123", &record("Cabc123", "alice"), Duration::from_secs(60))
            .unwrap();

        let cached = store.get("Cabc123").unwrap().unwrap();
        assert_eq!(cached.record.username, "alice");
        assert_eq!(cached.expires_at.timestamp_millis(), expires.timestamp_millis());
        assert!(!cached.is_expired(Utc::now()));
        assert!(store.get("Cmissing").unwrap().is_none());
    }

    #[test]
    fn test_replace_moves_index_entry() {
        let store = CacheStore::open_in_memory().unwrap();
        store.put_until("Cabc", &record("Cabc", "alice"), at(100)).unwrap();
        store.put_until("Cabc", &record("Cabc", "bob"), at(200)).unwrap();

        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.index_len().unwrap(), 1);
        let entries = store.expiring_before(at(1000)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].expires_at, at(200));
        assert_eq!(store.get("Cabc").unwrap().unwrap().record.username, "bob");
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let store = CacheStore::open_in_memory().unwrap();
        store.put_until("Cold", &record("Cold", "a"), at(10)).unwrap();
        store.put_until("Cedge", &record("Cedge", "b"), at(20)).unwrap();
        store.put_until("Cnew", &record("Cnew", "c"), at(30)).unwrap();

        assert_eq!(store.sweep(at(20)).unwrap(), 2);
        assert!(store.get("Cold").unwrap().is_none());
        assert!(store.get("Cedge").unwrap().is_none());
        assert!(store.get("Cnew").unwrap().is_some());
        assert_eq!(store.index_len().unwrap(), 1);
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let store = CacheStore::open_in_memory().unwrap();
        store.put_until("Cold", &record("Cold", "a"), at(10)).unwrap();
        store.put_until("Cnew", &record("Cnew", "b"), at(99)).unwrap();

        assert_eq!(store.sweep(at(50)).unwrap(), 1);
        assert_eq!(store.sweep(at(50)).unwrap(), 0);
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.index_len().unwrap(), 1);
    }

    #[test]
    fn test_expiring_before_is_ordered() {
        let store = CacheStore::open_in_memory().unwrap();
        store.put_until("Cc", &record("Cc", "c"), at(30)).unwrap();
        store.put_until("Ca", &record("Ca", "a"), at(10)).unwrap();
        store.put_until("Cb", &record("Cb", "b"), at(20)).unwrap();

        let ids: Vec<String> = store
            .expiring_before(at(25))
            .unwrap()
            .into_iter()
            .map(|e| e.post_id)
            .collect();
        assert_eq!(ids, vec!["Ca", "Cb"]);
    }

    #[test]
    fn test_remove() {
        let store = CacheStore::open_in_memory().unwrap();
        store.put_until("Ca", &record("Ca", "a"), at(10)).unwrap();
        assert!(store.remove("Ca").unwrap());
        assert!(!store.remove("Ca").unwrap());
        assert!(store.is_empty().unwrap());
        assert_eq!(store.index_len().unwrap(), 0);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let store = CacheStore::open(&path).unwrap();
            store.put_until("Ca", &record("Ca", "alice"), at(4_000_000_000)).unwrap();
        }
        let store = CacheStore::open(&path).unwrap();
        assert_eq!(store.get("Ca").unwrap().unwrap().record.username, "alice");
    }
}
