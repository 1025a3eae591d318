use std::marker::PhantomData;
use std::ops::Bound;

use super::codecs::{encode, KeySerializer};
use super::cursor::{EntryStream, KeyStream, ValueStream};
use super::engine::{signed_size, ScanRange, TreeEngine, TreeKind};
use super::single::bound;
use super::stats::{BTreeStats, TreeShape};
use crate::storage::atomic::{AtomicOperation, AtomicOperationsManager};
use crate::storage::options::BTreeOptions;
use crate::types::{Result, Rid};

/// Ordered index mapping each key to a set of record ids.
///
/// Values of one key come back in insertion order, in both scan directions
/// reversed exactly. Adding a `(key, rid)` pair that is already present is a
/// no-op.
pub struct MultiValueTree<K: KeySerializer> {
    engine: TreeEngine,
    prefetch: usize,
    _key: PhantomData<fn() -> K>,
}

impl<K: KeySerializer> MultiValueTree<K> {
    fn kind() -> TreeKind {
        TreeKind {
            multi: true,
            key_type: K::TYPE_ID,
            compare: K::compare_serialized,
        }
    }

    fn wrap(engine: TreeEngine, options: &BTreeOptions) -> Self {
        Self {
            engine,
            prefetch: options.prefetch_entries,
            _key: PhantomData,
        }
    }

    /// Creates the tree files inside `op`.
    ///
    /// Key types and size limit are taken as in `SingleValueTree::create`.
    pub fn create(op: &mut AtomicOperation<'_>, name: &str, options: BTreeOptions) -> Result<Self> {
        let engine = TreeEngine::create(op, name, &options, Self::kind())?;
        Ok(Self::wrap(engine, &options))
    }

    /// Opens a multi-value tree created earlier with the same key type.
    pub fn load(manager: &AtomicOperationsManager, name: &str, options: BTreeOptions) -> Result<Self> {
        let engine = TreeEngine::load(manager, name, &options, Self::kind())?;
        Ok(Self::wrap(engine, &options))
    }

    /// Tree name.
    pub fn name(&self) -> &str {
        self.engine.name()
    }

    /// Lazy stream of the committed record ids stored under `key`.
    pub fn get(&self, key: &K) -> Result<ValueStream<'_, K>> {
        let bytes = encode(key)?;
        Ok(ValueStream::new(EntryStream::new(
            &self.engine,
            ScanRange {
                lower: Bound::Included(bytes.clone()),
                upper: Bound::Included(bytes),
                ascending: true,
            },
            self.prefetch,
        )))
    }

    /// Adds `rid` under `key`; false when the pair was already stored.
    pub fn put(&self, op: &mut AtomicOperation<'_>, key: &K, rid: Rid) -> Result<bool> {
        self.engine.insert_multi(op, &encode(key)?, rid)
    }

    /// Removes the `(key, rid)` pair; false when it was not stored.
    pub fn remove(&self, op: &mut AtomicOperation<'_>, key: &K, rid: Rid) -> Result<bool> {
        self.engine.remove_multi(op, &encode(key)?, rid)
    }

    /// Adds `rid` under the null key.
    pub fn put_null(&self, op: &mut AtomicOperation<'_>, rid: Rid) -> Result<bool> {
        self.engine.insert_null_multi(op, rid)
    }

    /// Committed record ids stored under the null key, oldest first.
    pub fn get_null(&self) -> Result<Vec<Rid>> {
        self.engine.null_values(None)
    }

    /// Removes `rid` from the null key.
    pub fn remove_null(&self, op: &mut AtomicOperation<'_>, rid: Rid) -> Result<bool> {
        Ok(!self.engine.remove_null(op, Some(rid))?.is_empty())
    }

    /// Removes every value stored under the null key and returns them, oldest first.
    pub fn clear_null(&self, op: &mut AtomicOperation<'_>) -> Result<Vec<Rid>> {
        self.engine.remove_null(op, None)
    }

    /// Stored pairs, null-key values included.
    pub fn size(&self) -> Result<i64> {
        signed_size(self.engine.size(None)?)
    }

    /// Size as seen by `op`.
    pub fn size_in(&self, op: &AtomicOperation<'_>) -> Result<i64> {
        signed_size(self.engine.size(Some(op))?)
    }

    /// Smallest key.
    pub fn first_key(&self) -> Result<Option<K>> {
        self.edge_key(true)
    }

    /// Largest key.
    pub fn last_key(&self) -> Result<Option<K>> {
        self.edge_key(false)
    }

    fn edge_key(&self, ascending: bool) -> Result<Option<K>> {
        EntryStream::<K>::new(&self.engine, ScanRange::all(ascending), 1)
            .next()
            .transpose()
            .map(|entry| entry.map(|(key, _)| key))
    }

    /// Distinct keys in ascending order.
    pub fn key_stream(&self) -> KeyStream<'_, K> {
        KeyStream::new(EntryStream::new(
            &self.engine,
            ScanRange::all(true),
            self.prefetch,
        ))
    }

    /// Entries with keys below `key` (or equal when `inclusive`).
    pub fn iterate_entries_minor(
        &self,
        key: &K,
        inclusive: bool,
        ascending: bool,
    ) -> Result<EntryStream<'_, K>> {
        let upper = bound(key, inclusive)?;
        Ok(self.stream(Bound::Unbounded, upper, ascending))
    }

    /// Entries with keys above `key` (or equal when `inclusive`).
    pub fn iterate_entries_major(
        &self,
        key: &K,
        inclusive: bool,
        ascending: bool,
    ) -> Result<EntryStream<'_, K>> {
        let lower = bound(key, inclusive)?;
        Ok(self.stream(lower, Bound::Unbounded, ascending))
    }

    /// Entries with keys between `from` and `to`.
    pub fn iterate_entries_between(
        &self,
        from: &K,
        from_inclusive: bool,
        to: &K,
        to_inclusive: bool,
        ascending: bool,
    ) -> Result<EntryStream<'_, K>> {
        let lower = bound(from, from_inclusive)?;
        let upper = bound(to, to_inclusive)?;
        Ok(self.stream(lower, upper, ascending))
    }

    fn stream(&self, lower: Bound<Vec<u8>>, upper: Bound<Vec<u8>>, ascending: bool) -> EntryStream<'_, K> {
        EntryStream::new(
            &self.engine,
            ScanRange {
                lower,
                upper,
                ascending,
            },
            self.prefetch,
        )
    }

    /// Locks the tree for `op` so several calls are observed together.
    pub fn acquire_atomic_exclusive_lock(&self, op: &mut AtomicOperation<'_>) {
        self.engine.lock(op);
    }

    /// Deletes the tree files when `op` commits.
    pub fn delete(self, op: &mut AtomicOperation<'_>) -> Result<()> {
        self.engine.delete(op)
    }

    /// Verifies the whole tree structure.
    pub fn check(&self) -> Result<TreeShape> {
        self.engine.check()
    }

    /// Counters of this handle.
    pub fn stats(&self) -> BTreeStats {
        self.engine.stats()
    }
}

impl<K: KeySerializer> std::fmt::Debug for MultiValueTree<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiValueTree")
            .field("name", &self.engine.name())
            .field("component", self.engine.component())
            .finish()
    }
}
