use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::pager::{CacheConfig, Synchronous};
use crate::types::page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

/// Whether page flushes go through the double-write log.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoubleWriteMode {
    /// Every batch is logged and fsynced before the data files are written.
    #[default]
    Enabled,
    /// Pages are written in place only; a crash mid-write can tear them.
    Disabled,
}

/// Options supplied when opening a [`super::Storage`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageOptions {
    /// Page size in bytes; a power of two between 4 KiB and 32 KiB.
    pub page_size: u32,
    /// Pages kept resident in the cache.
    pub cache_pages: usize,
    /// Torn-page protection.
    pub double_write: DoubleWriteMode,
    /// Size past which the double-write log starts a new segment file.
    pub dwl_max_segment_bytes: u64,
    /// Logged bytes that trigger an automatic checkpoint.
    pub dwl_checkpoint_bytes: u64,
    /// How long a commit waits for its pages to reach disk.
    pub synchronous: Synchronous,
    /// Pages the flush worker coalesces into one write batch.
    pub flush_batch_pages: usize,
    /// Retries for a failing flush before the storage fails closed.
    pub flush_retries: u32,
    /// Base delay between flush retries in milliseconds.
    pub flush_retry_backoff_ms: u64,
    /// Verify page checksums whenever a page is read from disk.
    pub verify_checksums: bool,
    /// Checkpoint automatically once the double-write log outgrows
    /// `dwl_checkpoint_bytes`; polled at this interval in milliseconds.
    pub auto_checkpoint_ms: Option<u64>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: 1024,
            double_write: DoubleWriteMode::Enabled,
            dwl_max_segment_bytes: 16 * 1024 * 1024,
            dwl_checkpoint_bytes: 64 * 1024 * 1024,
            synchronous: Synchronous::Full,
            flush_batch_pages: 256,
            flush_retries: 3,
            flush_retry_backoff_ms: 10,
            verify_checksums: true,
            auto_checkpoint_ms: Some(1_000),
        }
    }
}

impl StorageOptions {
    /// Parses options from TOML; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let options: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: None,
            source,
        })?;
        options.validate()?;
        Ok(options)
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let options: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        options.validate()?;
        Ok(options)
    }

    /// Renders the options as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Checks every field for a usable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return Err(ConfigError::Invalid {
                field: "page_size",
                reason: "must be a power of two between 4096 and 32768",
            });
        }
        if self.cache_pages == 0 {
            return Err(ConfigError::Invalid {
                field: "cache_pages",
                reason: "must be non-zero",
            });
        }
        if self.flush_batch_pages == 0 {
            return Err(ConfigError::Invalid {
                field: "flush_batch_pages",
                reason: "must be non-zero",
            });
        }
        if self.dwl_max_segment_bytes < u64::from(self.page_size) {
            return Err(ConfigError::Invalid {
                field: "dwl_max_segment_bytes",
                reason: "must hold at least one page",
            });
        }
        if self.auto_checkpoint_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "auto_checkpoint_ms",
                reason: "must be non-zero when set",
            });
        }
        Ok(())
    }

    pub(crate) fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            page_size: self.page_size as usize,
            capacity: self.cache_pages,
            verify_checksums: self.verify_checksums,
            flush_batch_pages: self.flush_batch_pages,
            flush_retries: self.flush_retries,
            flush_retry_backoff: Duration::from_millis(self.flush_retry_backoff_ms),
            synchronous: self.synchronous,
        }
    }
}

/// Tuning of one cell B-tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BTreeOptions {
    /// Buckets below this share of usable space are rebalanced after a removal.
    pub min_fill_percent: u8,
    /// Largest accepted serialized key; capped so four entries fit one bucket.
    pub max_key_size: usize,
    /// Entries fetched per leaf visit by range iterators.
    pub prefetch_entries: usize,
    /// Page encryption scheme. Only `None` is accepted; trees are stored in clear.
    pub encryption: Option<String>,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        Self {
            min_fill_percent: 35,
            max_key_size: 1024,
            prefetch_entries: 64,
            encryption: None,
        }
    }
}

/// Errors raised while reading or checking options.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The TOML did not parse into options.
    #[error("failed to parse config{}: {source}", path.as_ref().map(|p| format!(" {}", p.display())).unwrap_or_default())]
    Parse {
        /// File that failed, if any.
        path: Option<PathBuf>,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// The options could not be rendered.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// Underlying error.
        source: toml::ser::Error,
    },
    /// A field holds an unusable value.
    #[error("option `{field}` {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}
