//! Append-only journal backing.
//!
//! One record per line, fields separated by `|`:
//!
//! ```text
//! PUT|<key>|<absolute path>|<length>
//! REMOVE|<key>
//! ```
//!
//! The logical state is the in-order fold of all records; a later record for
//! a key supersedes every earlier one. Replay skips malformed lines instead of
//! refusing to start. Compaction rewrites the file to one `PUT` per live key.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use lru::LruCache;
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};
use crate::store::{validate_key, MetadataStore, StoreOptions, StoreRecord};

/// Journal file name inside the cache directory.
pub const JOURNAL_FILE: &str = "journal.log";

const DELIMITER: char = '|';
const OP_PUT: &str = "PUT";
const OP_REMOVE: &str = "REMOVE";

/// A single journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalOp {
    Put(StoreRecord),
    Remove(String),
}

impl JournalOp {
    /// Parse one line (without its trailing newline). `None` if malformed.
    pub fn parse(line: &str) -> Option<Self> {
        let (op, rest) = line.split_once(DELIMITER)?;
        match op {
            OP_PUT => {
                // Keys never contain the delimiter, paths may.
                let (key, rest) = rest.split_once(DELIMITER)?;
                let (path, length) = rest.rsplit_once(DELIMITER)?;
                if key.is_empty() || path.is_empty() {
                    return None;
                }
                let length = length.parse::<u64>().ok()?;
                Some(JournalOp::Put(StoreRecord::new(key, path, length)))
            }
            OP_REMOVE => {
                if rest.is_empty() || rest.contains(DELIMITER) {
                    return None;
                }
                Some(JournalOp::Remove(rest.to_string()))
            }
            _ => None,
        }
    }

    fn encode(&self) -> Result<String> {
        match self {
            JournalOp::Put(record) => {
                let path = record.path.to_str().ok_or_else(|| {
                    invalid_path(&record.path, "path is not valid UTF-8")
                })?;
                if path.contains(['\n', '\r']) {
                    return Err(invalid_path(&record.path, "path contains a line break"));
                }
                Ok(format!(
                    "{OP_PUT}{DELIMITER}{}{DELIMITER}{path}{DELIMITER}{}",
                    record.key, record.length
                ))
            }
            JournalOp::Remove(key) => Ok(format!("{OP_REMOVE}{DELIMITER}{key}")),
        }
    }
}

fn invalid_path(path: &Path, reason: &str) -> CacheError {
    CacheError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{}: {reason}", path.display()),
    ))
}

/// Persist a rename by syncing the directory holding `path`.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => File::open(parent)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Append-only journal store.
pub struct JournalStore {
    path: PathBuf,
    /// Append handle; reopened lazily after a failed compaction drops it.
    writer: Option<BufWriter<File>>,
    closed: bool,
    options: StoreOptions,
    /// Keys live in the journal as of the last replay or mutation.
    live: HashSet<String>,
    /// Records compaction would drop: superseded puts and all removes.
    redundant: usize,
}

impl JournalStore {
    /// Open the journal at `path`, creating an empty one if absent.
    pub fn open(path: PathBuf, options: StoreOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let writer = Self::open_writer(&path)?;
        debug!(path = %path.display(), "Opened journal");

        Ok(Self {
            path,
            writer: Some(writer),
            closed: false,
            options,
            live: HashSet::new(),
            redundant: 0,
        })
    }

    fn open_writer(path: &Path) -> io::Result<BufWriter<File>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(BufWriter::new(file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records compaction would currently discard.
    pub fn redundant_records(&self) -> usize {
        self.redundant
    }

    /// Read and fold the whole journal.
    fn replay(&mut self) -> Result<Vec<StoreRecord>> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut folded: LruCache<String, StoreRecord> = LruCache::unbounded();
        let mut records = 0usize;
        let mut skipped = 0usize;
        let mut torn_tail = false;
        let mut complete_len = 0u64;
        let mut line_no = 0usize;
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf)?;
            if read == 0 {
                break;
            }
            line_no += 1;

            // A final line without a newline is an interrupted append.
            if buf.last() != Some(&b'\n') {
                warn!(line = line_no, "Skipping torn journal tail");
                torn_tail = true;
                skipped += 1;
                continue;
            }
            complete_len += read as u64;
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            if buf.is_empty() {
                continue;
            }

            let op = std::str::from_utf8(&buf).ok().and_then(JournalOp::parse);
            match op {
                Some(JournalOp::Put(record)) => {
                    records += 1;
                    folded.push(record.key.clone(), record);
                }
                Some(JournalOp::Remove(key)) => {
                    records += 1;
                    folded.pop(&key);
                }
                None => {
                    warn!(
                        line = line_no,
                        content = %String::from_utf8_lossy(&buf),
                        "Skipping malformed journal record"
                    );
                    skipped += 1;
                }
            }
        }

        if torn_tail {
            // Cut the torn line off so the next append starts cleanly.
            let writer = self.writer()?;
            writer.flush()?;
            writer.get_ref().set_len(complete_len)?;
        }

        let live: Vec<StoreRecord> = folded.iter().rev().map(|(_, r)| r.clone()).collect();
        self.live = live.iter().map(|r| r.key.clone()).collect();
        self.redundant = records - live.len();

        debug!(
            records,
            live = live.len(),
            skipped,
            "Replayed journal"
        );
        Ok(live)
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        if self.closed {
            return Err(CacheError::Closed);
        }
        if self.writer.is_none() {
            self.writer = Some(Self::open_writer(&self.path)?);
            debug!(path = %self.path.display(), "Reopened journal append handle");
        }
        self.writer.as_mut().ok_or(CacheError::Closed)
    }

    fn append(&mut self, op: &JournalOp) -> Result<()> {
        let line = op.encode()?;
        let sync = self.options.sync_writes;
        let writer = self.writer()?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        if sync {
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }
}

impl MetadataStore for JournalStore {
    fn name(&self) -> &'static str {
        "journal"
    }

    fn load_all(&mut self) -> Result<Vec<StoreRecord>> {
        self.replay()
    }

    fn record_put(&mut self, key: &str, path: &Path, length: u64) -> Result<()> {
        validate_key(key)?;
        self.append(&JournalOp::Put(StoreRecord::new(key, path, length)))?;
        if !self.live.insert(key.to_string()) {
            self.redundant += 1;
        }
        Ok(())
    }

    fn record_remove(&mut self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.append(&JournalOp::Remove(key.to_string()))?;
        // The remove line itself, plus the put it cancels.
        self.redundant += if self.live.remove(key) { 2 } else { 1 };
        Ok(())
    }

    fn compact(&mut self, live: &[StoreRecord]) -> Result<()> {
        if self.closed {
            return Err(CacheError::Closed);
        }
        let tmp_path = self.path.with_extension("log.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for record in live {
                let line = JournalOp::Put(record.clone()).encode()?;
                tmp.write_all(line.as_bytes())?;
                tmp.write_all(b"\n")?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }

        // The old handle must not outlive the file it appends to. Whatever
        // happens below, the next append reopens the journal by path.
        if let Some(mut old) = self.writer.take() {
            old.flush()?;
        }
        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            if let Err(cleanup) = fs::remove_file(&tmp_path) {
                warn!(path = %tmp_path.display(), error = %cleanup, "Failed to remove compaction file");
            }
            return Err(e.into());
        }

        let dropped = self.redundant;
        self.live = live.iter().map(|r| r.key.clone()).collect();
        self.redundant = 0;

        sync_parent_dir(&self.path)?;
        self.writer = Some(Self::open_writer(&self.path)?);

        info!(
            path = %self.path.display(),
            live = live.len(),
            dropped,
            "Compacted journal"
        );
        Ok(())
    }

    fn needs_compaction(&self) -> bool {
        self.redundant >= self.options.compaction_threshold && self.redundant >= self.live.len()
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
            debug!(path = %self.path.display(), "Closed journal");
        }
        Ok(())
    }
}
