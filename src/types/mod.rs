#![forbid(unsafe_code)]
//! Identifiers, the crate error type and the on-disk page header shared by every layer.

use std::fmt;
use std::io;
use std::time::Duration;

/// Page checksum helpers.
pub mod checksum;
/// Fixed page header layout.
pub mod page;

pub use checksum::{page_crc32, Checksum, Crc32Fast};

/// Identifier of a paged file registered with a storage.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FileId(pub u32);

/// Monotonic identifier of an atomic operation.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct OperationId(pub u64);

/// Identifier of a durable component within one storage.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ComponentId(pub u64);

/// Address of a page: the owning file plus the page index inside it.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageKey {
    /// File holding the page.
    pub file: FileId,
    /// Zero-based page index within the file.
    pub index: u64,
}

impl PageKey {
    /// Creates a page address.
    pub const fn new(file: FileId, index: u64) -> Self {
        Self { file, index }
    }
}

/// Record identifier stored as the value of index entries.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Rid {
    /// Cluster holding the record.
    pub cluster_id: i32,
    /// Position of the record inside its cluster.
    pub cluster_position: i64,
}

impl Rid {
    /// Number of bytes a record id occupies on a page.
    pub const ENCODED_LEN: usize = 12;

    /// Creates a record id.
    pub const fn new(cluster_id: i32, cluster_position: i64) -> Self {
        Self {
            cluster_id,
            cluster_position,
        }
    }

    /// Writes the big-endian form into the first [`Rid::ENCODED_LEN`] bytes of `dst`.
    pub fn encode_into(&self, dst: &mut [u8]) {
        dst[..4].copy_from_slice(&self.cluster_id.to_be_bytes());
        dst[4..12].copy_from_slice(&self.cluster_position.to_be_bytes());
    }

    /// Reads a record id previously written by [`Rid::encode_into`].
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < Self::ENCODED_LEN {
            return Err(StoreError::Corruption("record id truncated"));
        }
        let mut cluster = [0u8; 4];
        cluster.copy_from_slice(&src[..4]);
        let mut position = [0u8; 8];
        position.copy_from_slice(&src[4..12]);
        Ok(Self {
            cluster_id: i32::from_be_bytes(cluster),
            cluster_position: i64::from_be_bytes(position),
        })
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file.0, self.index)
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster_id, self.cluster_position)
    }
}

/// Why a parked thread stopped waiting.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptCause {
    /// Another thread asked the waiters to give up.
    #[error("interrupted by request")]
    Requested,
    /// The caller's deadline passed first.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

/// Errors raised by the storage core.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Reading or writing a file failed.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// A low-level on-disk format check failed.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The caller passed an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// New atomic operations are refused while a freeze is in effect; retry later.
    #[error("modification requests are prohibited while atomic operations are frozen")]
    OperationsFrozen,
    /// A thread parked on the freezer gave up before being released.
    #[error("thread interrupted while parked: {0}")]
    Interrupted(#[source] InterruptCause),
    /// A durable component found a page in a state it can never legally be in.
    #[error("durable structure `{component}` is corrupted at page {page} of file {file}: {reason}")]
    Structure {
        /// Name of the component that detected the problem.
        component: String,
        /// File holding the bad page.
        file: FileId,
        /// Index of the bad page.
        page: u64,
        /// What was wrong.
        reason: &'static str,
    },
    /// The serialized key does not fit the tree's key size limit.
    #[error("key of {size} bytes exceeds the maximum of {max} bytes")]
    KeyTooLarge {
        /// Encoded key size.
        size: usize,
        /// Configured limit.
        max: usize,
    },
    /// Storage options were rejected.
    #[error("configuration: {0}")]
    Config(String),
    /// Background flushing failed permanently; the storage refuses further writes.
    #[error("storage failed: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Returns true for failures a caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::OperationsFrozen)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Produces an equivalent error for fan-out to several waiters.
pub(crate) fn clone_error(err: &StoreError) -> StoreError {
    match err {
        StoreError::Io(io_err) => StoreError::Io(io::Error::new(io_err.kind(), io_err.to_string())),
        StoreError::Corruption(msg) => StoreError::Corruption(*msg),
        StoreError::Invalid(msg) => StoreError::Invalid(*msg),
        StoreError::OperationsFrozen => StoreError::OperationsFrozen,
        StoreError::Interrupted(cause) => StoreError::Interrupted(*cause),
        StoreError::Structure {
            component,
            file,
            page,
            reason,
        } => StoreError::Structure {
            component: component.clone(),
            file: *file,
            page: *page,
            reason: *reason,
        },
        StoreError::KeyTooLarge { size, max } => StoreError::KeyTooLarge {
            size: *size,
            max: *max,
        },
        StoreError::Config(msg) => StoreError::Config(msg.clone()),
        StoreError::Fatal(msg) => StoreError::Fatal(msg.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rid_roundtrip_preserves_sign() {
        let rid = Rid::new(-3, -42);
        let mut buf = [0u8; Rid::ENCODED_LEN];
        rid.encode_into(&mut buf);
        assert_eq!(Rid::decode(&buf).unwrap(), rid);
        assert_eq!(rid.to_string(), "#-3:-42");
    }

    #[test]
    fn rid_decode_rejects_short_input() {
        assert!(matches!(
            Rid::decode(&[0u8; 5]),
            Err(StoreError::Corruption(_))
        ));
    }

    #[test]
    fn cloned_errors_keep_their_kind() {
        let err = StoreError::Io(io::Error::new(io::ErrorKind::WriteZero, "disk full"));
        match clone_error(&err) {
            StoreError::Io(inner) => assert_eq!(inner.kind(), io::ErrorKind::WriteZero),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(StoreError::OperationsFrozen.is_retryable());
        assert!(!StoreError::Fatal("gone".into()).is_retryable());
    }

    #[test]
    fn structure_error_names_component_and_page() {
        let err = StoreError::Structure {
            component: "users_by_name".into(),
            file: FileId(7),
            page: 12,
            reason: "bucket keys out of order",
        };
        let text = err.to_string();
        assert!(text.contains("users_by_name"));
        assert!(text.contains("page 12"));
    }
}
