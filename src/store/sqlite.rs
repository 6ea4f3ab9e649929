//! Relational backing: one `entry` row per live key.

use std::path::{Path, PathBuf};

use lru::LruCache;
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::store::{validate_key, MetadataStore, StoreRecord};

/// Database file name inside the cache directory.
pub const DATABASE_FILE: &str = "entries.db";

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS entry (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT,
    file_name TEXT,
    length INTEGER
)";
const CREATE_INDEX: &str = "CREATE INDEX IF NOT EXISTS entry_key ON entry(key)";

pub struct SqliteStore {
    path: PathBuf,
    conn: Option<Connection>,
}

impl SqliteStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let conn = Connection::open(&path)?;
        conn.execute(CREATE_TABLE, [])?;
        conn.execute(CREATE_INDEX, [])?;
        debug!(path = %path.display(), "Opened entry database");
        Ok(Self {
            path,
            conn: Some(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&mut self) -> Result<&mut Connection> {
        self.conn.as_mut().ok_or(CacheError::Closed)
    }
}

impl MetadataStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn load_all(&mut self) -> Result<Vec<StoreRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, file_name, length FROM entry ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        // A crash between delete and insert can leave duplicates; last row wins.
        let mut folded: LruCache<String, StoreRecord> = LruCache::unbounded();
        for row in rows {
            let (key, file_name, length) = match row {
                Ok(row) => row,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable entry row");
                    continue;
                }
            };
            let Ok(length) = u64::try_from(length) else {
                warn!(key = %key, length, "Skipping entry row with negative length");
                continue;
            };
            folded.push(key.clone(), StoreRecord::new(key, file_name, length));
        }

        Ok(folded.iter().rev().map(|(_, r)| r.clone()).collect())
    }

    fn record_put(&mut self, key: &str, path: &Path, length: u64) -> Result<()> {
        validate_key(key)?;
        let file_name = path.to_string_lossy().into_owned();
        let length = i64::try_from(length).map_err(|_| {
            CacheError::InvalidConfiguration(format!("blob length {length} exceeds i64"))
        })?;

        let tx = self.conn()?.transaction()?;
        tx.execute("DELETE FROM entry WHERE key = ?1", params![key])?;
        tx.execute(
            "INSERT INTO entry (key, file_name, length) VALUES (?1, ?2, ?3)",
            params![key, file_name, length],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn record_remove(&mut self, key: &str) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM entry WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| CacheError::Database(e))?;
            debug!(path = %self.path.display(), "Closed entry database");
        }
        Ok(())
    }
}
