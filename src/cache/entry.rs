//! A cached blob on disk and its safe-deletion state.
//!
//! An entry may be evicted while readers still hold its file open. Deletion
//! is then deferred: the entry is marked and the last reader to release it
//! removes the file.

use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct ReaderState {
    readers: u32,
    pending_delete: bool,
}

/// One blob file owned by a single cache slot.
#[derive(Debug)]
pub struct Entry {
    path: PathBuf,
    length: u64,
    state: Mutex<ReaderState>,
}

impl Entry {
    pub fn new(path: PathBuf, length: u64) -> Self {
        Self {
            path,
            length,
            state: Mutex::new(ReaderState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blob size in bytes.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn readers(&self) -> u32 {
        self.state.lock().readers
    }

    pub fn is_pending_delete(&self) -> bool {
        self.state.lock().pending_delete
    }

    pub fn start_reading(&self) {
        self.state.lock().readers += 1;
    }

    /// Release one reader. Returns `true` if this release deleted the file.
    pub fn stop_reading(&self) -> io::Result<bool> {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0, "stop_reading without start_reading");
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 && state.pending_delete {
            state.pending_delete = false;
            remove_blob(&self.path)?;
            debug!(path = %self.path.display(), "Deleted blob after last reader released it");
            return Ok(true);
        }
        Ok(false)
    }

    /// Delete the file now, or once the last reader releases it.
    ///
    /// Returns `true` if the file was deleted immediately.
    pub fn request_delete(&self) -> io::Result<bool> {
        let mut state = self.state.lock();
        if state.readers > 0 {
            state.pending_delete = true;
            debug!(
                path = %self.path.display(),
                readers = state.readers,
                "Deferring blob delete until readers release it"
            );
            return Ok(false);
        }
        remove_blob(&self.path)?;
        Ok(true)
    }
}

/// Remove a blob file, treating an already-missing file as success.
pub(crate) fn remove_blob(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to delete blob file");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn blob(dir: &TempDir, name: &str) -> Entry {
        let path = dir.path().join(name);
        std::fs::write(&path, b"payload").unwrap();
        Entry::new(path, 7)
    }

    #[test]
    fn test_delete_without_readers_is_immediate() {
        let tmp = TempDir::new().unwrap();
        let entry = blob(&tmp, "a.blob");

        assert!(entry.request_delete().unwrap());
        assert!(!entry.path().exists());
        assert!(!entry.is_pending_delete());
    }

    #[test]
    fn test_delete_deferred_until_last_reader() {
        let tmp = TempDir::new().unwrap();
        let entry = blob(&tmp, "b.blob");

        entry.start_reading();
        entry.start_reading();
        assert!(!entry.request_delete().unwrap());
        assert!(entry.is_pending_delete());
        assert!(entry.path().exists());

        assert!(!entry.stop_reading().unwrap());
        assert!(entry.path().exists());

        assert!(entry.stop_reading().unwrap());
        assert!(!entry.path().exists());
        assert_eq!(entry.readers(), 0);
    }

    #[test]
    fn test_release_without_delete_keeps_file() {
        let tmp = TempDir::new().unwrap();
        let entry = blob(&tmp, "c.blob");

        entry.start_reading();
        assert!(!entry.stop_reading().unwrap());
        assert!(entry.path().exists());
    }

    #[test]
    fn test_missing_file_delete_is_ok() {
        let tmp = TempDir::new().unwrap();
        let entry = Entry::new(tmp.path().join("never-written.blob"), 0);

        assert!(entry.request_delete().unwrap());
        assert!(entry.is_empty());
    }
}
