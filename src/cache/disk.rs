//! Disk LRU cache: the orchestrator tying the eviction engine, blob files and
//! the metadata store together.
//!
//! - Initialization runs once on a background thread; every call blocks until
//!   it has finished.
//! - A write becomes visible only when its [`BlobWriter`] is flushed. Dropping
//!   the [`WriteHandle`] earlier discards the blob.
//! - Every replacement and eviction side effect (store removal, then file
//!   deletion) goes through [`DiskPolicy`] under the engine lock.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::entry::{remove_blob, Entry};
use crate::cache::lru::{LruEngine, LruPolicy, LruStats, RemovalCause};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::store::{self, validate_key, MetadataStore, StoreRecord};

/// Extension of blob files in the working directory.
pub const BLOB_EXTENSION: &str = "blob";

type Index = LruEngine<String, Arc<Entry>, DiskPolicy>;

/// Weighs entries by blob length and applies removal side effects.
struct DiskPolicy {
    store: Box<dyn MetadataStore>,
    /// While replaying the store, superseded records are not side effects.
    loading: bool,
}

impl LruPolicy<String, Arc<Entry>> for DiskPolicy {
    fn weigh(&self, _key: &String, entry: &Arc<Entry>) -> u64 {
        entry.len()
    }

    fn on_removed(
        &mut self,
        cause: RemovalCause,
        key: &String,
        old: &Arc<Entry>,
        _new: Option<&Arc<Entry>>,
    ) -> Result<()> {
        if self.loading && !cause.evicted() {
            return Ok(());
        }
        self.store.record_remove(key)?;
        old.request_delete()?;
        debug!(
            key = %key,
            cause = ?cause,
            path = %old.path().display(),
            length = old.len(),
            "Removed cache entry"
        );
        Ok(())
    }
}

enum Lifecycle {
    Initializing,
    Ready(Index),
    Failed(String),
    Closed,
}

impl Lifecycle {
    fn index_mut(&mut self) -> Option<&mut Index> {
        match self {
            Lifecycle::Ready(index) => Some(index),
            _ => None,
        }
    }

    fn unavailable(&self) -> CacheError {
        match self {
            Lifecycle::Failed(msg) => CacheError::Initialization(msg.clone()),
            Lifecycle::Initializing => CacheError::Initialization("not ready".to_string()),
            Lifecycle::Ready(_) | Lifecycle::Closed => CacheError::Closed,
        }
    }
}

struct Shared {
    directory: PathBuf,
    sync_writes: bool,
    state: Mutex<Lifecycle>,
    ready: Condvar,
}

impl Shared {
    /// Block until initialization has finished, then lock the index.
    fn lock_ready(&self) -> Result<MappedMutexGuard<'_, Index>> {
        let mut state = self.state.lock();
        while matches!(*state, Lifecycle::Initializing) {
            self.ready.wait(&mut state);
        }
        MutexGuard::try_map(state, Lifecycle::index_mut).map_err(|state| state.unavailable())
    }

    fn initialize(
        &self,
        config: &CacheConfig,
        store: Option<Box<dyn MetadataStore>>,
    ) -> Result<Index> {
        fs::create_dir_all(&self.directory)?;

        let store = match store {
            Some(store) => store,
            None => store::open(config.store, &self.directory, config.store_options())?,
        };
        let policy = DiskPolicy {
            store,
            loading: true,
        };
        let mut index = LruEngine::new(config.capacity_bytes, policy)?;
        if let Some(max_entries) = config.max_entries {
            index = index.with_max_entries(max_entries)?;
        }

        let records = index.policy_mut().store.load_all()?;
        let mut missing = 0usize;
        for record in records {
            if !record.path.is_file() {
                debug!(key = %record.key, path = %record.path.display(), "Dropping record without blob");
                index.policy_mut().store.record_remove(&record.key)?;
                missing += 1;
                continue;
            }
            let entry = Arc::new(Entry::new(record.path, record.length));
            index.put(record.key, entry)?;
        }
        index.policy_mut().loading = false;

        let live = live_records(&index);
        index.policy_mut().store.compact(&live)?;

        let swept = if config.sweep_orphans {
            self.sweep_orphans(&index)?
        } else {
            0
        };

        info!(
            store = index.policy().store.name(),
            entries = index.len(),
            weight = index.weight(),
            evicted = index.stats().evictions,
            missing,
            swept,
            "Loaded cache index"
        );
        Ok(index)
    }

    /// Delete blob files no live entry refers to.
    fn sweep_orphans(&self, index: &Index) -> Result<usize> {
        let live: HashSet<&Path> = index.iter_lru().map(|(_, e)| e.path()).collect();
        let mut swept = 0;
        for dir_entry in fs::read_dir(&self.directory)? {
            let path = dir_entry?.path();
            let is_blob = path.extension().is_some_and(|ext| ext == BLOB_EXTENSION);
            if !is_blob || !path.is_file() || live.contains(path.as_path()) {
                continue;
            }
            if remove_blob(&path).is_ok() {
                debug!(path = %path.display(), "Removed orphan blob");
                swept += 1;
            }
        }
        Ok(swept)
    }

    /// Make a fully written blob visible under `key`.
    ///
    /// `committed` flips as soon as the store has recorded the blob, since
    /// from then on the index owns the file even if a later step fails.
    fn commit(&self, key: &str, path: &Path, length: u64, committed: &mut bool) -> Result<()> {
        let entry = Arc::new(Entry::new(path.to_path_buf(), length));
        let mut index = self.lock_ready()?;

        index.remove(key)?;
        index.policy_mut().store.record_put(key, path, length)?;
        *committed = true;
        index.put(key.to_string(), entry)?;

        if index.policy().store.needs_compaction() {
            let live = live_records(&index);
            index.policy_mut().store.compact(&live)?;
        }

        debug!(key, length, weight = index.weight(), "Committed blob");
        Ok(())
    }

    /// Drop `key` if it still maps to `stale`.
    fn prune_stale(&self, key: &str, stale: &Arc<Entry>) -> Result<()> {
        let mut index = self.lock_ready()?;
        let unchanged = index
            .peek(key)
            .is_some_and(|current| Arc::ptr_eq(current, stale));
        if unchanged {
            index.remove(key)?;
            debug!(key, path = %stale.path().display(), "Pruned entry whose blob disappeared");
        }
        Ok(())
    }
}

fn live_records(index: &Index) -> Vec<StoreRecord> {
    index
        .iter_lru()
        .map(|(key, entry)| StoreRecord::new(key.clone(), entry.path(), entry.len()))
        .collect()
}

/// Handle to a disk LRU cache. Cheap to clone; clones share one cache.
#[derive(Clone)]
pub struct DiskLruCache {
    shared: Arc<Shared>,
}

impl DiskLruCache {
    /// Validate `config` and start initializing in the background.
    pub fn open(config: CacheConfig) -> Result<Self> {
        Self::start(config, None)
    }

    /// Like [`open`](Self::open), with a caller-supplied metadata store.
    pub fn open_with_store(config: CacheConfig, store: Box<dyn MetadataStore>) -> Result<Self> {
        Self::start(config, Some(store))
    }

    fn start(config: CacheConfig, store: Option<Box<dyn MetadataStore>>) -> Result<Self> {
        config.validate()?;
        let directory = std::path::absolute(&config.directory)?;

        let shared = Arc::new(Shared {
            directory,
            sync_writes: config.sync_writes,
            state: Mutex::new(Lifecycle::Initializing),
            ready: Condvar::new(),
        });

        let worker = shared.clone();
        thread::Builder::new()
            .name("disk-lru-init".to_string())
            .spawn(move || {
                let started = Instant::now();
                let next = match worker.initialize(&config, store) {
                    Ok(index) => {
                        info!(
                            directory = %worker.directory.display(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Cache ready"
                        );
                        Lifecycle::Ready(index)
                    }
                    Err(e) => {
                        warn!(
                            directory = %worker.directory.display(),
                            error = %e,
                            "Cache initialization failed"
                        );
                        Lifecycle::Failed(e.to_string())
                    }
                };
                *worker.state.lock() = next;
                worker.ready.notify_all();
            })?;

        Ok(Self { shared })
    }

    /// Working directory (absolute).
    pub fn directory(&self) -> &Path {
        &self.shared.directory
    }

    /// Open `key` for reading. `None` if absent or its blob has disappeared.
    pub fn read(&self, key: &str) -> Result<Option<ReadHandle>> {
        let handle = {
            let mut index = self.shared.lock_ready()?;
            match index.get(key) {
                Some(entry) => ReadHandle::new(entry.clone()),
                None => return Ok(None),
            }
        };

        match fs::metadata(handle.path()) {
            Ok(_) => Ok(Some(handle)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let stale = handle.entry.clone();
                drop(handle);
                self.shared.prune_stale(key, &stale)?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Start a write transaction for `key`.
    pub fn write(&self, key: &str) -> Result<WriteHandle> {
        validate_key(key)?;
        drop(self.shared.lock_ready()?);

        let path = self
            .shared
            .directory
            .join(format!("{}.{BLOB_EXTENSION}", Uuid::new_v4()));
        Ok(WriteHandle {
            shared: self.shared.clone(),
            key: key.to_string(),
            path,
            opened: false,
            committed: false,
        })
    }

    /// Store `data` under `key` in one transaction.
    pub fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut handle = self.write(key)?;
        let mut writer = handle.open()?;
        writer.write_all(data)?;
        writer.commit()
    }

    /// Read the whole blob for `key`.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.read(key)? {
            Some(handle) => self.read_whole(key, handle),
            None => Ok(None),
        }
    }

    /// Read all of `handle`, pruning `key` if its blob vanished after lookup.
    fn read_whole(&self, key: &str, handle: ReadHandle) -> Result<Option<Vec<u8>>> {
        match handle.read_to_vec() {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let stale = handle.entry.clone();
                drop(handle);
                self.shared.prune_stale(key, &stale)?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove `key`. Returns whether it was present.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut index = self.shared.lock_ready()?;
        Ok(index.remove(key)?.is_some())
    }

    /// Whether `key` is live, without affecting recency.
    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.shared.lock_ready()?.contains(key))
    }

    /// Change the byte budget, evicting immediately if over it.
    pub fn resize(&self, capacity_bytes: u64) -> Result<()> {
        let mut index = self.shared.lock_ready()?;
        index.resize(capacity_bytes)?;
        info!(capacity_bytes, weight = index.weight(), "Resized cache");
        Ok(())
    }

    pub fn stats(&self) -> Result<LruStats> {
        Ok(self.shared.lock_ready()?.stats())
    }

    /// Rewrite the store to hold only the live entries.
    pub fn compact(&self) -> Result<()> {
        let mut index = self.shared.lock_ready()?;
        let live = live_records(&index);
        index.policy_mut().store.compact(&live)
    }

    /// Close the metadata store. Later calls fail with [`CacheError::Closed`];
    /// outstanding read handles stay usable.
    pub fn close(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        while matches!(*state, Lifecycle::Initializing) {
            self.shared.ready.wait(&mut state);
        }
        let previous = std::mem::replace(&mut *state, Lifecycle::Closed);
        drop(state);

        if let Lifecycle::Ready(mut index) = previous {
            index.policy_mut().store.close()?;
            info!(directory = %self.shared.directory.display(), "Cache closed");
        }
        Ok(())
    }
}

/// A live blob held open for reading. The blob file is not deleted while
/// this handle exists, even if its key is evicted or overwritten.
#[derive(Debug)]
pub struct ReadHandle {
    entry: Arc<Entry>,
}

impl ReadHandle {
    fn new(entry: Arc<Entry>) -> Self {
        entry.start_reading();
        Self { entry }
    }

    pub fn path(&self) -> &Path {
        self.entry.path()
    }

    pub fn len(&self) -> u64 {
        self.entry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_empty()
    }

    /// Open the blob as a byte stream.
    pub fn open(&self) -> io::Result<BlobReader<'_>> {
        let file = File::open(self.entry.path())?;
        Ok(BlobReader {
            file,
            _handle: PhantomData,
        })
    }

    pub fn read_to_vec(&self) -> io::Result<Vec<u8>> {
        let mut data = Vec::with_capacity(usize::try_from(self.entry.len()).unwrap_or(0));
        self.open()?.read_to_end(&mut data)?;
        Ok(data)
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        if let Err(e) = self.entry.stop_reading() {
            warn!(path = %self.entry.path().display(), error = %e, "Deferred blob delete failed");
        }
    }
}

/// Byte stream over a blob; borrows its [`ReadHandle`].
#[derive(Debug)]
pub struct BlobReader<'a> {
    file: File,
    _handle: PhantomData<&'a ReadHandle>,
}

impl Read for BlobReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// A pending write transaction. Dropping it without a successful commit
/// deletes the partial blob.
pub struct WriteHandle {
    shared: Arc<Shared>,
    key: String,
    path: PathBuf,
    opened: bool,
    committed: bool,
}

impl WriteHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Blob file this transaction writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Create the blob file and return a sink for it.
    pub fn open(&mut self) -> io::Result<BlobWriter<'_>> {
        if self.opened {
            return Err(io::Error::other("write handle already opened"));
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        self.opened = true;
        Ok(BlobWriter {
            handle: self,
            file,
            written: 0,
            failed: false,
        })
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if self.opened && !self.committed && remove_blob(&self.path).is_ok() {
            debug!(key = %self.key, path = %self.path.display(), "Discarded uncommitted blob");
        }
    }
}

/// Byte sink for a blob. `flush` commits the transaction.
pub struct BlobWriter<'a> {
    handle: &'a mut WriteHandle,
    file: File,
    written: u64,
    failed: bool,
}

impl BlobWriter<'_> {
    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Make the blob durable and visible under its key.
    ///
    /// A second commit is a no-op. After a failed write the blob can no
    /// longer be committed.
    pub fn commit(&mut self) -> Result<()> {
        if self.handle.committed {
            return Ok(());
        }
        if self.failed {
            return Err(io::Error::other("an earlier write failed, blob discarded").into());
        }

        self.file.flush()?;
        if self.handle.shared.sync_writes {
            self.file.sync_data()?;
        }

        let handle = &mut *self.handle;
        handle
            .shared
            .commit(&handle.key, &handle.path, self.written, &mut handle.committed)
    }
}

impl Write for BlobWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.handle.committed {
            return Err(io::Error::other("blob already committed"));
        }
        match self.file.write(buf) {
            Ok(n) => {
                self.written += n as u64;
                Ok(n)
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::Interrupted {
                    self.failed = true;
                }
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.commit().map_err(io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreBacking;
    use tempfile::TempDir;

    fn open(tmp: &TempDir, capacity: u64) -> DiskLruCache {
        DiskLruCache::open(CacheConfig::new(tmp.path().join("cache"), capacity)).unwrap()
    }

    fn blob_files(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|ext| ext == BLOB_EXTENSION))
            .collect()
    }

    #[test]
    fn test_read_missing_key() {
        let tmp = TempDir::new().unwrap();
        let cache = open(&tmp, 10);

        assert!(cache.read("A").unwrap().is_none());
        assert_eq!(cache.stats().unwrap().misses, 1);
    }

    #[test]
    fn test_write_then_read() {
        let tmp = TempDir::new().unwrap();
        let cache = open(&tmp, 30);
        let sample: Vec<u8> = (0..20).map(|n| (n * 2) as u8).collect();

        let mut handle = cache.write("A").unwrap();
        {
            let mut writer = handle.open().unwrap();
            writer.write_all(&sample).unwrap();
            writer.flush().unwrap();
        }
        assert!(handle.is_committed());
        drop(handle);

        let reader = cache.read("A").unwrap().unwrap();
        assert_eq!(reader.len(), 20);
        assert_eq!(reader.read_to_vec().unwrap(), sample);
    }

    #[test]
    fn test_abandoned_write_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let cache = open(&tmp, 100);

        let mut handle = cache.write("A").unwrap();
        let path = handle.path().to_path_buf();
        handle.open().unwrap().write_all(b"partial").unwrap();
        assert!(path.exists());
        drop(handle);

        assert!(!path.exists());
        assert!(cache.read("A").unwrap().is_none());
        assert!(blob_files(cache.directory()).is_empty());
    }

    #[test]
    fn test_oversized_write_is_evicted() {
        let tmp = TempDir::new().unwrap();
        let cache = open(&tmp, 19);

        cache.put("A", &[0u8; 20]).unwrap();

        assert!(cache.read("A").unwrap().is_none());
        assert!(blob_files(cache.directory()).is_empty());
    }

    #[test]
    fn test_write_after_commit_rejected() {
        let tmp = TempDir::new().unwrap();
        let cache = open(&tmp, 100);

        let mut handle = cache.write("A").unwrap();
        let mut writer = handle.open().unwrap();
        writer.write_all(b"one").unwrap();
        writer.flush().unwrap();
        writer.flush().unwrap();
        assert!(writer.write_all(b"two").is_err());
        drop(writer);
        drop(handle);

        assert_eq!(cache.get("A").unwrap().unwrap(), b"one");
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let tmp = TempDir::new().unwrap();
        let cache = open(&tmp, 100);

        assert!(matches!(cache.write(""), Err(CacheError::InvalidKey { .. })));
        assert!(matches!(cache.write("a|b"), Err(CacheError::InvalidKey { .. })));
    }

    #[test]
    fn test_externally_deleted_blob_is_pruned() {
        let tmp = TempDir::new().unwrap();
        let cache = open(&tmp, 100);
        cache.put("A", b"hello").unwrap();

        let path = cache.read("A").unwrap().unwrap().path().to_path_buf();
        fs::remove_file(&path).unwrap();

        assert!(cache.read("A").unwrap().is_none());
        assert!(!cache.contains("A").unwrap());
        assert_eq!(cache.stats().unwrap().weight, 0);
    }

    #[test]
    fn test_blob_vanishing_after_lookup_is_pruned() {
        let tmp = TempDir::new().unwrap();
        let cache = open(&tmp, 100);
        cache.put("A", b"hello").unwrap();

        let handle = cache.read("A").unwrap().unwrap();
        fs::remove_file(handle.path()).unwrap();

        assert!(cache.read_whole("A", handle).unwrap().is_none());
        assert!(!cache.contains("A").unwrap());
        assert_eq!(cache.stats().unwrap().weight, 0);
    }

    #[test]
    fn test_orphans_swept_on_open() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("cache");
        {
            let cache = open(&tmp, 100);
            cache.put("A", b"kept").unwrap();
            cache.close().unwrap();
        }
        let orphan = dir.join(format!("{}.{BLOB_EXTENSION}", Uuid::new_v4()));
        fs::write(&orphan, b"crashed mid-write").unwrap();

        let cache = open(&tmp, 100);
        assert_eq!(cache.get("A").unwrap().unwrap(), b"kept");
        assert!(!orphan.exists());
    }

    #[test]
    fn test_closed_cache_rejects_calls() {
        let tmp = TempDir::new().unwrap();
        let cache = open(&tmp, 100);
        cache.put("A", b"x").unwrap();
        let reader = cache.read("A").unwrap().unwrap();

        cache.close().unwrap();
        cache.close().unwrap();

        assert!(matches!(cache.read("A"), Err(CacheError::Closed)));
        assert!(matches!(cache.write("B"), Err(CacheError::Closed)));
        assert_eq!(reader.read_to_vec().unwrap(), b"x");
    }

    #[test]
    fn test_pending_write_fails_after_close() {
        let tmp = TempDir::new().unwrap();
        let cache = open(&tmp, 100);

        let mut handle = cache.write("A").unwrap();
        let path = handle.path().to_path_buf();
        let mut writer = handle.open().unwrap();
        writer.write_all(b"late").unwrap();
        cache.close().unwrap();

        assert!(matches!(writer.commit(), Err(CacheError::Closed)));
        drop(writer);
        drop(handle);
        assert!(!path.exists());
    }

    #[test]
    fn test_initialization_failure_reported() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("not-a-directory");
        fs::write(&file, b"").unwrap();

        let cache = DiskLruCache::open(CacheConfig::new(&file, 100)).unwrap();
        assert!(matches!(
            cache.read("A"),
            Err(CacheError::Initialization(_))
        ));
    }

    #[test]
    fn test_invalid_configuration_is_immediate() {
        let tmp = TempDir::new().unwrap();
        let result = DiskLruCache::open(CacheConfig::new(tmp.path(), 0));
        assert!(matches!(result, Err(CacheError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_remove_and_resize() {
        let tmp = TempDir::new().unwrap();
        let config = CacheConfig::new(tmp.path().join("cache"), 100).with_store(StoreBacking::Sqlite);
        let cache = DiskLruCache::open(config).unwrap();
        cache.put("A", &[1u8; 40]).unwrap();
        cache.put("B", &[2u8; 40]).unwrap();

        assert!(cache.remove("A").unwrap());
        assert!(!cache.remove("A").unwrap());

        cache.put("C", &[3u8; 40]).unwrap();
        cache.resize(50).unwrap();
        assert!(!cache.contains("B").unwrap());
        assert!(cache.contains("C").unwrap());
        assert_eq!(blob_files(cache.directory()).len(), 1);
        assert!(matches!(
            cache.resize(0),
            Err(CacheError::InvalidConfiguration(_))
        ));
    }
}
