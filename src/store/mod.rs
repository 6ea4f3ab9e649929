//! Durable key → blob metadata.
//!
//! The store is the crash-recoverable record of which blob file belongs to
//! which key. It is independent of the in-memory eviction index and is
//! replayed into it once at startup.
//!
//! - [`journal`]: append-only operation log with replay and compaction
//! - [`sqlite`]: one relational row per live key

pub mod journal;
pub mod sqlite;

use std::path::{Path, PathBuf};

use crate::config::StoreBacking;
use crate::error::{CacheError, Result};

pub use journal::JournalStore;
pub use sqlite::SqliteStore;

/// One persisted `(key, path, length)` tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRecord {
    pub key: String,
    pub path: PathBuf,
    pub length: u64,
}

impl StoreRecord {
    pub fn new(key: impl Into<String>, path: impl Into<PathBuf>, length: u64) -> Self {
        Self {
            key: key.into(),
            path: path.into(),
            length,
        }
    }
}

/// Reject keys that cannot be written as a single journal field.
pub fn validate_key(key: &str) -> Result<()> {
    let reason = if key.is_empty() {
        "key is empty"
    } else if key.contains('|') {
        "key contains the '|' field delimiter"
    } else if key.contains(['\n', '\r']) {
        "key contains a line break"
    } else {
        return Ok(());
    };
    Err(CacheError::InvalidKey {
        key: key.to_string(),
        reason,
    })
}

/// Persistence capability shared by all backings.
///
/// Every mutation must be durable (to the degree the backing provides) before
/// it returns.
pub trait MetadataStore: Send {
    /// Short backing name for logs.
    fn name(&self) -> &'static str;

    /// The live record set, least recently written first.
    fn load_all(&mut self) -> Result<Vec<StoreRecord>>;

    fn record_put(&mut self, key: &str, path: &Path, length: u64) -> Result<()>;

    fn record_remove(&mut self, key: &str) -> Result<()>;

    /// Rewrite durable state to hold exactly `live`, in order.
    fn compact(&mut self, _live: &[StoreRecord]) -> Result<()> {
        Ok(())
    }

    /// Whether enough superseded history has built up to warrant [`compact`].
    ///
    /// [`compact`]: MetadataStore::compact
    fn needs_compaction(&self) -> bool {
        false
    }

    fn close(&mut self) -> Result<()>;
}

/// Tuning shared by store backings.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Superseded records tolerated before a journal rebuild.
    pub compaction_threshold: usize,
    /// fsync after every mutation.
    pub sync_writes: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            compaction_threshold: 2000,
            sync_writes: true,
        }
    }
}

/// Open the configured backing inside `directory`.
pub fn open(
    backing: StoreBacking,
    directory: &Path,
    options: StoreOptions,
) -> Result<Box<dyn MetadataStore>> {
    let store: Box<dyn MetadataStore> = match backing {
        StoreBacking::Journal => Box::new(JournalStore::open(
            directory.join(journal::JOURNAL_FILE),
            options,
        )?),
        StoreBacking::Sqlite => Box::new(SqliteStore::open(directory.join(sqlite::DATABASE_FILE))?),
    };
    Ok(store)
}
