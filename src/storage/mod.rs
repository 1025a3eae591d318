//! Durable storage: atomic operations, durable components and the cell B-trees
//! built on them.

/// Atomic operations and the freezer.
pub mod atomic;

/// Cell B-tree indexes.
pub mod btree;

mod component;
mod engine;
mod options;

pub use atomic::{
    AtomicOperation, AtomicOperationsManager, ComponentLocks, FreezeGuard, FreezeMode,
    FreezerState,
};
pub use btree::{
    MultiValueTree, NormalizedKeyTree, NormalizedMultiKeyTree, PutOutcome, SingleValueTree,
    Validation,
};
pub use component::DurableComponent;
pub use engine::{CheckpointReport, Storage, StorageStats};
pub use options::{BTreeOptions, ConfigError, DoubleWriteMode, StorageOptions};
