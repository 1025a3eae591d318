//! Page-based durable storage with crash-safe atomic operations and cell B-tree
//! indexes.
//!
//! The layers, bottom-up:
//!
//! * [`primitives`]: file IO, the double-write log and the page cache with its
//!   flush worker.
//! * [`storage::atomic`]: atomic operations, the freezer and per-component locks.
//! * [`storage::btree`]: single-value, multi-value and normalized-key trees.
//! * [`storage::Storage`]: the facade that opens, recovers, checkpoints and closes
//!   a storage directory.

#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::{Storage, StorageOptions};
pub use types::{Result, Rid, StoreError};
