//! Low-level primitives for building the storage engine.
//!
//! Includes byte utilities, positioned I/O, lock-free concurrency building blocks,
//! the double-write log, and the page cache.

/// Byte-level utilities and encoding/decoding.
pub mod bytes;

/// Lock-free queue and wait list.
pub mod concurrency;

/// Torn-page protection for data file writes.
pub mod dwl;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Paged files, the file registry and the write-back page cache.
pub mod pager;
