//! WolfPage Configuration
//!
//! This module provides configuration structures for the page store,
//! its write-ahead log and the checkpointer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::tuning;

/// Main WolfPage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfPageConfig {
    /// Page storage configuration
    pub storage: StorageConfig,

    /// Write-Ahead Log configuration
    #[serde(default)]
    pub wal: WalConfig,

    /// Checkpoint configuration
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Page storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory for WAL segments, page files and metadata
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Page size in bytes
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

/// Write-Ahead Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Number of records to batch before flushing
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush interval in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Enable LZ4 compression for record bodies
    #[serde(default = "default_compression")]
    pub compression: bool,

    /// Maximum segment size in megabytes
    #[serde(default = "default_segment_size_mb")]
    pub segment_size_mb: u64,

    /// Use fsync for durability (slower but safer)
    #[serde(default = "default_fsync")]
    pub fsync: bool,

    /// Move sealed segments into the archive directory
    #[serde(default = "default_true")]
    pub archive: bool,

    /// Archived segments kept from before the last completed checkpoint
    #[serde(default = "default_keep_archived_segments")]
    pub keep_archived_segments: u64,
}

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Page write worker threads (0 = auto-tune)
    #[serde(default)]
    pub threads: usize,

    /// Threads of the page sort pool (0 = auto-tune)
    #[serde(default)]
    pub sort_threads: usize,

    /// Maximum number of pages in one write batch
    #[serde(default = "default_batch_pages")]
    pub batch_pages: usize,

    /// Interval between periodic checkpoints in milliseconds (0 = disabled)
    #[serde(default = "default_checkpoint_frequency_ms")]
    pub frequency_ms: u64,

    /// How long shutdown waits for in-flight page writes
    #[serde(default = "default_worker_shutdown_timeout_secs")]
    pub worker_shutdown_timeout_secs: u64,

    /// How long shutdown waits for the sort pool
    #[serde(default = "default_sort_shutdown_timeout_secs")]
    pub sort_shutdown_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfpage")
}

fn default_page_size() -> usize {
    4096
}

fn default_batch_size() -> usize {
    256
}

fn default_flush_interval_ms() -> u64 {
    10
}

fn default_compression() -> bool {
    false
}

fn default_segment_size_mb() -> u64 {
    64
}

fn default_fsync() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_keep_archived_segments() -> u64 {
    8
}

fn default_batch_pages() -> usize {
    512
}

fn default_checkpoint_frequency_ms() -> u64 {
    180_000
}

fn default_worker_shutdown_timeout_secs() -> u64 {
    120
}

fn default_sort_shutdown_timeout_secs() -> u64 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            page_size: default_page_size(),
        }
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            compression: default_compression(),
            segment_size_mb: default_segment_size_mb(),
            fsync: default_fsync(),
            archive: true,
            keep_archived_segments: default_keep_archived_segments(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            sort_threads: 0,
            batch_pages: default_batch_pages(),
            frequency_ms: default_checkpoint_frequency_ms(),
            worker_shutdown_timeout_secs: default_worker_shutdown_timeout_secs(),
            sort_shutdown_timeout_secs: default_sort_shutdown_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl CheckpointConfig {
    /// Page write worker count, auto-tuned when unset
    pub fn worker_threads(&self) -> usize {
        if self.threads > 0 {
            self.threads
        } else {
            tuning::auto_tune().checkpoint_threads
        }
    }

    /// Sort pool size, auto-tuned when unset
    pub fn sort_pool_threads(&self) -> usize {
        if self.sort_threads > 0 {
            self.sort_threads
        } else {
            tuning::auto_tune().sort_threads
        }
    }

    /// Worker shutdown timeout as Duration
    pub fn worker_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_shutdown_timeout_secs)
    }

    /// Sort pool shutdown timeout as Duration
    pub fn sort_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.sort_shutdown_timeout_secs)
    }

    /// Checkpoint frequency as Duration, `None` when periodic checkpoints are off
    pub fn frequency(&self) -> Option<Duration> {
        (self.frequency_ms > 0).then(|| Duration::from_millis(self.frequency_ms))
    }
}

impl WalConfig {
    /// Maximum segment size in bytes
    pub fn segment_size_bytes(&self) -> u64 {
        self.segment_size_mb * 1024 * 1024
    }

    /// Get flush interval as Duration
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl WolfPageConfig {
    /// Configuration rooted at `data_dir` with every other value defaulted
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            storage: StorageConfig {
                data_dir,
                page_size: default_page_size(),
            },
            wal: WalConfig::default(),
            checkpoint: CheckpointConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfPageConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfPageConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.storage.data_dir.as_os_str().is_empty() {
            return Err(crate::Error::Config("storage.data_dir cannot be empty".into()));
        }

        let page_size = self.storage.page_size;
        if page_size < 512 || !page_size.is_power_of_two() {
            return Err(crate::Error::Config(format!(
                "storage.page_size must be a power of two >= 512, got {}",
                page_size
            )));
        }

        if self.wal.segment_size_mb == 0 {
            return Err(crate::Error::Config("wal.segment_size_mb must be positive".into()));
        }

        if self.wal.batch_size == 0 {
            return Err(crate::Error::Config("wal.batch_size must be positive".into()));
        }

        if self.checkpoint.batch_pages == 0 {
            return Err(crate::Error::Config("checkpoint.batch_pages must be positive".into()));
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.storage.data_dir
    }

    /// Get the WAL work directory path
    pub fn wal_dir(&self) -> PathBuf {
        self.storage.data_dir.join("wal")
    }

    /// Get the WAL archive directory path
    pub fn archive_dir(&self) -> PathBuf {
        self.wal_dir().join("archive")
    }

    /// Get the page file directory path
    pub fn pages_dir(&self) -> PathBuf {
        self.storage.data_dir.join("pages")
    }

    /// Get the type metadata directory path
    pub fn meta_dir(&self) -> PathBuf {
        self.storage.data_dir.join("meta")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[storage]
data_dir = "/var/lib/wolfpage"
page_size = 8192

[wal]
batch_size = 64
compression = true

[checkpoint]
threads = 4
batch_pages = 1024
"#;

        let config = WolfPageConfig::from_str(toml).unwrap();
        assert_eq!(config.storage.page_size, 8192);
        assert_eq!(config.wal.batch_size, 64);
        assert!(config.wal.compression);
        assert!(config.wal.archive);
        assert_eq!(config.checkpoint.worker_threads(), 4);
        assert_eq!(config.checkpoint.batch_pages, 1024);
        assert_eq!(config.checkpoint.worker_shutdown_timeout(), Duration::from_secs(120));
        assert_eq!(config.checkpoint.sort_shutdown_timeout(), Duration::from_secs(2));
        assert_eq!(config.archive_dir(), PathBuf::from("/var/lib/wolfpage/wal/archive"));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = WolfPageConfig::from_str("[storage]\n").unwrap();
        assert_eq!(config.storage.page_size, 4096);
        assert_eq!(config.wal.segment_size_mb, 64);
        assert_eq!(config.logging.level, "info");
        assert!(config.checkpoint.frequency().is_some());
    }

    #[test]
    fn test_rejects_bad_page_size() {
        let err = WolfPageConfig::from_str("[storage]\npage_size = 1000\n").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}
