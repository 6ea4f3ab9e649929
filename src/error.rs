//! Error types shared by the eviction engine, metadata stores and the cache.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Weight bookkeeping no longer adds up. Indicates a bug in a weigher or
    /// in the engine itself and is never corrected silently.
    #[error("Internal consistency violation: {0}")]
    InternalConsistency(String),

    #[error("Cache initialization failed: {0}")]
    Initialization(String),

    #[error("Cache is closed")]
    Closed,
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

impl From<CacheError> for std::io::Error {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Io(e) => e,
            other => std::io::Error::other(other),
        }
    }
}
