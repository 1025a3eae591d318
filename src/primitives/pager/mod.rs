#![forbid(unsafe_code)]
//! Paged files and the write-back cache in front of them.

mod cache;
mod flush;
mod frame;
mod registry;
mod segment;

use serde::{Deserialize, Serialize};

pub use cache::{CacheConfig, CacheStats, PageCache, PageRef, StorageExceptionListener};
pub use flush::FlushTicket;
pub use registry::FileRegistry;
pub use segment::FileSegment;

/// How long a commit waits for its pages to reach disk.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    /// Commit returns after the double-write log and the data files took the batch.
    /// Without a double-write log the touched data files are fsynced as well.
    #[default]
    Full,
    /// Commit returns once the batch is queued.
    Normal,
    /// Like `Normal`, and data files written without double-write protection are
    /// left to the next checkpoint to fsync.
    Off,
}

impl Synchronous {
    /// Returns the lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Normal => "normal",
            Synchronous::Off => "off",
        }
    }
}
