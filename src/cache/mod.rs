//! Disk-backed LRU blob cache.
//!
//! - [`lru`]: generic weighted LRU engine with removal hooks
//! - [`entry`]: per-blob reader count and deferred delete
//! - [`disk`]: the cache itself, binding engine, blob files and metadata store

pub mod disk;
pub mod entry;
pub mod lru;

pub use disk::{BlobReader, BlobWriter, DiskLruCache, ReadHandle, WriteHandle};
pub use lru::{LruEngine, LruPolicy, LruStats, RemovalCause};
