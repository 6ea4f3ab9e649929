//! disk-lru-cache: a size-bounded, crash-recoverable LRU cache of byte blobs
//! kept as files in one directory.
//!
//! Writers stream a blob into a fresh file and commit it atomically under a
//! key. Readers hold a handle that keeps the file alive even after the key
//! is overwritten or evicted. The key → file mapping survives restarts
//! through an append-only journal or a SQLite table.

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod server;
pub mod store;

pub use cache::{DiskLruCache, ReadHandle, WriteHandle};
pub use config::{CacheConfig, StoreBacking};
pub use error::{CacheError, Result};
