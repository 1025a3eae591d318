use std::marker::PhantomData;
use std::ops::Bound;

use super::codecs::{encode, KeySerializer};
use super::cursor::{EntryStream, KeyStream};
use super::engine::{signed_size, ScanRange, TreeEngine, TreeKind};
use super::stats::{BTreeStats, TreeShape};
use super::{PutOutcome, Validation};
use crate::storage::atomic::{AtomicOperation, AtomicOperationsManager};
use crate::storage::options::BTreeOptions;
use crate::types::{Result, Rid};

/// Ordered index mapping each key to at most one record id.
///
/// Reads without an operation see committed state. Writes take the
/// [`AtomicOperation`] explicitly and lock the tree for it until it ends.
pub struct SingleValueTree<K: KeySerializer> {
    engine: TreeEngine,
    prefetch: usize,
    _key: PhantomData<fn() -> K>,
}

impl<K: KeySerializer> SingleValueTree<K> {
    fn kind() -> TreeKind {
        TreeKind {
            multi: false,
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

    /// Creates the tree files inside `op`; they disappear again if `op` rolls back.
    ///
    /// The key serializer is `K`: its [`KeySerializer::TYPE_ID`] is persisted and
    /// checked by [`Self::load`]. The key size limit is
    /// [`BTreeOptions::max_key_size`], and [`BTreeOptions::encryption`] must be unset.
    pub fn create(op: &mut AtomicOperation<'_>, name: &str, options: BTreeOptions) -> Result<Self> {
        let engine = TreeEngine::create(op, name, &options, Self::kind())?;
        Ok(Self::wrap(engine, &options))
    }

    /// Opens a tree created earlier with the same key type.
    pub fn load(manager: &AtomicOperationsManager, name: &str, options: BTreeOptions) -> Result<Self> {
        let engine = TreeEngine::load(manager, name, &options, Self::kind())?;
        Ok(Self::wrap(engine, &options))
    }

    /// Tree name.
    pub fn name(&self) -> &str {
        self.engine.name()
    }

    /// Largest serialized key the tree accepts.
    pub fn max_key_size(&self) -> usize {
        self.engine.max_key_size()
    }

    /// Committed record id of `key`.
    pub fn get(&self, key: &K) -> Result<Option<Rid>> {
        self.engine.get(None, &encode(key)?)
    }

    /// Record id of `key` as `op` sees it, including its own uncommitted writes.
    pub fn get_in(&self, op: &AtomicOperation<'_>, key: &K) -> Result<Option<Rid>> {
        self.engine.get(Some(op), &encode(key)?)
    }

    /// Inserts `key` or replaces its record id.
    pub fn put(&self, op: &mut AtomicOperation<'_>, key: &K, rid: Rid) -> Result<()> {
        self.validated_put(op, key, rid, |_, _| Validation::Accept)
            .map(|_| ())
    }

    /// Inserts or updates `key` once `validator` approves.
    ///
    /// The validator sees the current record id (if any) and the proposed one. On
    /// [`Validation::Ignore`] nothing is written and [`PutOutcome::Rejected`] is
    /// returned.
    pub fn validated_put(
        &self,
        op: &mut AtomicOperation<'_>,
        key: &K,
        rid: Rid,
        validator: impl FnOnce(Option<Rid>, Rid) -> Validation,
    ) -> Result<PutOutcome> {
        self.engine.put_single(op, &encode(key)?, rid, validator)
    }

    /// Removes `key`, returning its record id.
    pub fn remove(&self, op: &mut AtomicOperation<'_>, key: &K) -> Result<Option<Rid>> {
        self.engine.remove_single(op, &encode(key)?)
    }

    /// Stores `rid` under the null key.
    pub fn put_null(&self, op: &mut AtomicOperation<'_>, rid: Rid) -> Result<()> {
        self.validated_put_null(op, rid, |_, _| Validation::Accept)
            .map(|_| ())
    }

    /// Null-key counterpart of [`Self::validated_put`].
    pub fn validated_put_null(
        &self,
        op: &mut AtomicOperation<'_>,
        rid: Rid,
        validator: impl FnOnce(Option<Rid>, Rid) -> Validation,
    ) -> Result<PutOutcome> {
        self.engine.put_null_single(op, rid, validator)
    }

    /// Committed record id stored under the null key.
    pub fn get_null(&self) -> Result<Option<Rid>> {
        self.engine.null_value(None)
    }

    /// Clears the null key, returning its record id.
    pub fn remove_null(&self, op: &mut AtomicOperation<'_>) -> Result<Option<Rid>> {
        Ok(self.engine.remove_null(op, None)?.first().copied())
    }

    /// Entries in the tree, the null key included.
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

    /// Every key in ascending order.
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

pub(crate) fn bound<K: KeySerializer>(key: &K, inclusive: bool) -> Result<Bound<Vec<u8>>> {
    let bytes = encode(key)?;
    Ok(if inclusive {
        Bound::Included(bytes)
    } else {
        Bound::Excluded(bytes)
    })
}

impl<K: KeySerializer> std::fmt::Debug for SingleValueTree<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleValueTree")
            .field("name", &self.engine.name())
            .field("component", self.engine.component())
            .finish()
    }
}
