//! Runtime configuration for disk-lru-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Cache knobs (directory, byte budget, store backing) and the HTTP listen
//! address live here.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::store::StoreOptions;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "disk-lru-cache", about = "Disk-backed LRU blob cache server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Cache working directory (overrides the config file).
    #[arg(long)]
    pub directory: Option<PathBuf>,

    /// Cache capacity in bytes (overrides the config file).
    #[arg(long)]
    pub capacity: Option<u64>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Largest accepted upload body.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024 // 64 MB
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Which durable metadata backing to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBacking {
    /// Append-only journal with replay and compaction.
    #[default]
    Journal,
    /// SQLite table.
    Sqlite,
}

/// Cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Working directory holding blob files and the store.
    pub directory: PathBuf,

    /// Total byte budget across all blobs.
    pub capacity_bytes: u64,

    /// Optional cap on the number of live keys.
    pub max_entries: Option<usize>,

    /// Metadata store backing.
    pub store: StoreBacking,

    /// Superseded journal records tolerated before a rebuild.
    pub compaction_threshold: usize,

    /// fsync blob files and store mutations before a commit returns.
    pub sync_writes: bool,

    /// Delete unreferenced blob files at startup.
    pub sweep_orphans: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/tmp/disk-lru-cache"),
            capacity_bytes: 256 * 1024 * 1024, // 256 MB
            max_entries: None,
            store: StoreBacking::Journal,
            compaction_threshold: 2000,
            sync_writes: true,
            sweep_orphans: true,
        }
    }
}

impl CacheConfig {
    /// Minimal configuration for `directory` with a byte budget.
    pub fn new(directory: impl Into<PathBuf>, capacity_bytes: u64) -> Self {
        Self {
            directory: directory.into(),
            capacity_bytes,
            ..Default::default()
        }
    }

    pub fn with_store(mut self, store: StoreBacking) -> Self {
        self.store = store;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    /// Reject values the cache cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.capacity_bytes == 0 {
            return Err(CacheError::InvalidConfiguration(
                "capacity_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_entries == Some(0) {
            return Err(CacheError::InvalidConfiguration(
                "max_entries must be greater than zero".to_string(),
            ));
        }
        if self.compaction_threshold == 0 {
            return Err(CacheError::InvalidConfiguration(
                "compaction_threshold must be greater than zero".to_string(),
            ));
        }
        if self.directory.as_os_str().is_empty() {
            return Err(CacheError::InvalidConfiguration(
                "directory must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            compaction_threshold: self.compaction_threshold,
            sync_writes: self.sync_writes,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides on top of the loaded file.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(directory) = &cli.directory {
            self.cache.directory = directory.clone();
        }
        if let Some(capacity) = cli.capacity {
            self.cache.capacity_bytes = capacity;
        }
    }
}
