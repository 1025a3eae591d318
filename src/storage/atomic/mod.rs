#![forbid(unsafe_code)]
//! Atomic operations: the unit of crash-consistent page mutation.
//!
//! An [`AtomicOperation`] collects private copies of every page it touches. Nothing
//! is visible to other threads until [`AtomicOperation::commit`] seals the copies and
//! hands them to the page cache in one batch, which the flush worker logs to the
//! double-write log as a single record. Rolling back simply drops the copies.
//!
//! The [`AtomicOperationsManager`] admits operations and can freeze admission to
//! reach a quiescent point for checkpoints and backups.

mod freezer;

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock, RwLockWriteGuard};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::primitives::pager::{FlushTicket, PageCache, Synchronous};
use crate::types::page;
use crate::types::{ComponentId, FileId, OperationId, PageKey, Result, StoreError};

pub use freezer::{FreezeMode, FreezerState};
use freezer::Freezer;

/// Locks shared by every handle on one named durable component.
///
/// The mutation lock serializes writers and stays held until the owning operation
/// ends. The visibility lock is taken shared by readers and exclusively by a commit
/// while it publishes pages.
pub struct ComponentLocks {
    id: ComponentId,
    name: String,
    mutation: Arc<Mutex<()>>,
    visibility: RwLock<()>,
}

impl ComponentLocks {
    /// Identifier of the component.
    pub fn id(&self) -> ComponentId {
        self.id
    }

    /// Name of the component.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks commits of this component while held.
    pub fn read_visible(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.visibility.read()
    }
}

impl fmt::Debug for ComponentLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentLocks")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Admits atomic operations and coordinates freezes.
pub struct AtomicOperationsManager {
    cache: Arc<PageCache>,
    freezer: Freezer,
    next_operation: AtomicU64,
    next_component: AtomicU64,
    components: Mutex<FxHashMap<String, Arc<ComponentLocks>>>,
    admission_timeout: Option<Duration>,
}

impl AtomicOperationsManager {
    /// Creates a manager publishing through `cache`.
    pub fn new(cache: Arc<PageCache>) -> Self {
        Self {
            cache,
            freezer: Freezer::new(),
            next_operation: AtomicU64::new(1),
            next_component: AtomicU64::new(1),
            components: Mutex::new(FxHashMap::default()),
            admission_timeout: None,
        }
    }

    /// Bounds how long a new operation stays parked behind a [`FreezeMode::Park`] freeze.
    pub fn with_admission_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.admission_timeout = timeout;
        self
    }

    /// Page cache that receives committed pages.
    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    /// Starts a new operation.
    ///
    /// Fails with [`StoreError::OperationsFrozen`] under a [`FreezeMode::Reject`]
    /// freeze, and with [`StoreError::Fatal`] once the storage failed closed.
    pub fn start_atomic_operation(&self) -> Result<AtomicOperation<'_>> {
        self.cache.health()?;
        self.freezer.enter(self.admission_timeout)?;
        let id = OperationId(self.next_operation.fetch_add(1, Ordering::Relaxed));
        debug!(op = id.0, "atomic.start");
        Ok(AtomicOperation {
            manager: self,
            id,
            pages: BTreeMap::new(),
            allocated: Vec::new(),
            added_files: Vec::new(),
            deleted_files: Vec::new(),
            locks: SmallVec::new(),
            rollback_only: false,
            finished: false,
        })
    }

    /// Ends `op`, committing it when `commit` is true and rolling it back otherwise.
    pub fn end_atomic_operation(&self, op: AtomicOperation<'_>, commit: bool) -> Result<()> {
        if !std::ptr::eq(op.manager, self) {
            return Err(StoreError::Invalid("operation belongs to another manager"));
        }
        if commit {
            op.commit()
        } else {
            op.rollback();
            Ok(())
        }
    }

    /// Stops admission and blocks until every running operation ended.
    ///
    /// Calling this from a thread that holds an open operation deadlocks.
    pub fn freeze(&self, mode: FreezeMode) -> Result<FreezeGuard<'_>> {
        self.freeze_inner(mode, None)
    }

    /// Like [`Self::freeze`] but gives up after `timeout`.
    pub fn freeze_timeout(&self, mode: FreezeMode, timeout: Duration) -> Result<FreezeGuard<'_>> {
        self.freeze_inner(mode, Some(timeout))
    }

    fn freeze_inner(&self, mode: FreezeMode, timeout: Option<Duration>) -> Result<FreezeGuard<'_>> {
        info!(?mode, active = self.freezer.active(), "atomic.freeze.start");
        self.freezer.freeze(mode, timeout)?;
        info!(?mode, "atomic.freeze.done");
        Ok(FreezeGuard {
            manager: self,
            mode,
            released: false,
        })
    }

    /// Lifts the freeze held by `guard`. Same as dropping it.
    pub fn unfreeze(&self, guard: FreezeGuard<'_>) {
        drop(guard);
    }

    /// Current admission state.
    pub fn state(&self) -> FreezerState {
        self.freezer.state()
    }

    /// Number of running operations.
    pub fn active_operations(&self) -> usize {
        self.freezer.active()
    }

    /// Makes every thread parked on a freeze fail with [`StoreError::Interrupted`].
    pub fn interrupt_waiters(&self) -> usize {
        let woken = self.freezer.interrupt();
        if woken > 0 {
            warn!(woken, "atomic.waiters.interrupted");
        }
        woken
    }

    /// Locks shared by every handle on the component called `name`.
    pub fn component_locks(&self, name: &str) -> Arc<ComponentLocks> {
        let mut components = self.components.lock();
        Arc::clone(components.entry(name.to_owned()).or_insert_with(|| {
            Arc::new(ComponentLocks {
                id: ComponentId(self.next_component.fetch_add(1, Ordering::Relaxed)),
                name: name.to_owned(),
                mutation: Arc::new(Mutex::new(())),
                visibility: RwLock::new(()),
            })
        }))
    }
}

impl fmt::Debug for AtomicOperationsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicOperationsManager")
            .field("state", &self.state())
            .field("active", &self.active_operations())
            .finish()
    }
}

/// A freeze in effect. Dropping it lifts the freeze.
#[must_use = "the freeze is lifted as soon as the guard is dropped"]
pub struct FreezeGuard<'a> {
    manager: &'a AtomicOperationsManager,
    mode: FreezeMode,
    released: bool,
}

impl FreezeGuard<'_> {
    /// Mode the freeze was requested with.
    pub fn mode(&self) -> FreezeMode {
        self.mode
    }
}

impl Drop for FreezeGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.manager.freezer.unfreeze(self.mode);
            info!(mode = ?self.mode, "atomic.freeze.end");
        }
    }
}

struct HeldLock {
    locks: Arc<ComponentLocks>,
    _mutation: ArcMutexGuard<RawMutex, ()>,
}

/// One unit of crash-consistent page mutation.
///
/// Pages are copied on first write and stay private until [`Self::commit`].
/// Dropping an operation without committing rolls it back.
pub struct AtomicOperation<'a> {
    manager: &'a AtomicOperationsManager,
    id: OperationId,
    pages: BTreeMap<PageKey, Box<[u8]>>,
    allocated: Vec<PageKey>,
    added_files: Vec<FileId>,
    deleted_files: Vec<FileId>,
    locks: SmallVec<[HeldLock; 2]>,
    rollback_only: bool,
    finished: bool,
}

impl<'a> AtomicOperation<'a> {
    /// Identifier of the operation.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Manager that admitted the operation.
    pub fn manager(&self) -> &'a AtomicOperationsManager {
        self.manager
    }

    /// Number of pages the operation changed so far.
    pub fn touched_pages(&self) -> usize {
        self.pages.len()
    }

    /// Makes [`Self::commit`] roll back instead.
    pub fn mark_rollback_only(&mut self) {
        if !self.rollback_only {
            debug!(op = self.id.0, "atomic.rollback_only");
        }
        self.rollback_only = true;
    }

    /// True once [`Self::mark_rollback_only`] was called.
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// Takes the mutation lock of a component until the operation ends.
    ///
    /// Re-locking a component already held is a no-op. Operations locking several
    /// components must do so in a consistent order.
    pub fn lock_component(&mut self, locks: &Arc<ComponentLocks>) {
        if self.holds_lock(locks.id) {
            return;
        }
        let guard = locks.mutation.lock_arc();
        let pos = self
            .locks
            .iter()
            .position(|held| held.locks.id > locks.id)
            .unwrap_or(self.locks.len());
        self.locks.insert(
            pos,
            HeldLock {
                locks: Arc::clone(locks),
                _mutation: guard,
            },
        );
    }

    /// True when the operation holds the mutation lock of component `id`.
    pub fn holds_lock(&self, id: ComponentId) -> bool {
        self.locks.iter().any(|held| held.locks.id == id)
    }

    /// Runs `f` over the operation's view of `key`: its private copy if it has one,
    /// the cached committed image otherwise.
    pub(crate) fn read_page<R>(&self, key: PageKey, f: impl FnOnce(&[u8]) -> Result<R>) -> Result<R> {
        match self.pages.get(&key) {
            Some(image) => f(image),
            None => {
                let page = self.manager.cache.load(key)?;
                f(page.data())
            }
        }
    }

    /// Private copy of `key`, made from the committed image on first use.
    pub(crate) fn page_mut(&mut self, key: PageKey) -> Result<&mut [u8]> {
        match self.pages.entry(key) {
            Entry::Occupied(entry) => Ok(&mut entry.into_mut()[..]),
            Entry::Vacant(entry) => {
                let mut image = vec![0u8; self.manager.cache.page_size()].into_boxed_slice();
                self.manager.cache.read_into(key, &mut image)?;
                Ok(&mut entry.insert(image)[..])
            }
        }
    }

    /// Appends a zeroed page to `file`. Rollback returns the index to the file.
    pub(crate) fn allocate_page(&mut self, file: FileId) -> Result<u64> {
        let segment = self.manager.cache.registry().segment(file)?;
        let index = segment.allocate_page();
        let key = PageKey::new(file, index);
        let blank = vec![0u8; self.manager.cache.page_size()].into_boxed_slice();
        self.pages.insert(key, blank);
        self.allocated.push(key);
        Ok(index)
    }

    /// Creates a data file. Rollback deletes it again.
    pub(crate) fn add_file(&mut self, name: &str) -> Result<FileId> {
        let segment = self.manager.cache.registry().add_file(name)?;
        self.added_files.push(segment.id());
        Ok(segment.id())
    }

    /// Schedules `file` for deletion at commit.
    pub(crate) fn delete_file(&mut self, file: FileId) -> Result<()> {
        self.manager.cache.registry().segment(file)?;
        if !self.deleted_files.contains(&file) {
            self.deleted_files.push(file);
        }
        Ok(())
    }

    /// Publishes every changed page and ends the operation.
    ///
    /// Under [`Synchronous::Full`] this returns once the double-write log and the
    /// data files took the pages. A rollback-only operation is rolled back and
    /// reported as [`StoreError::Invalid`].
    pub fn commit(mut self) -> Result<()> {
        if self.rollback_only {
            self.finish_rollback();
            return Err(StoreError::Invalid("atomic operation is rollback-only"));
        }
        let ticket = match self.publish() {
            Ok(ticket) => ticket,
            Err(err) => {
                warn!(op = self.id.0, error = %err, "atomic.commit.failed");
                self.finish_rollback();
                return Err(err);
            }
        };
        self.finished = true;
        let outcome = self.finish_commit(ticket);
        self.locks.clear();
        self.manager.freezer.leave();
        outcome
    }

    /// Drops every change and ends the operation.
    pub fn rollback(mut self) {
        self.finish_rollback();
    }

    fn publish(&mut self) -> Result<Option<FlushTicket>> {
        let cache = &self.manager.cache;
        cache.health()?;
        let deleted = &self.deleted_files;
        let mut images: Vec<(PageKey, Box<[u8]>)> = std::mem::take(&mut self.pages)
            .into_iter()
            .filter(|(key, _)| !deleted.contains(&key.file))
            .collect();
        if images.is_empty() {
            return Ok(None);
        }
        for (key, image) in &mut images {
            page::seal(image, *key)?;
        }
        let pages = images.len();
        let ticket = {
            let _visible: SmallVec<[RwLockWriteGuard<'_, ()>; 2]> = self
                .locks
                .iter()
                .map(|held| held.locks.visibility.write())
                .collect();
            cache.apply(images)?
        };
        debug!(op = self.id.0, pages, "atomic.commit");
        Ok(Some(ticket))
    }

    fn finish_commit(&mut self, ticket: Option<FlushTicket>) -> Result<()> {
        let cache = &self.manager.cache;
        for file in std::mem::take(&mut self.deleted_files) {
            cache.forget_file(file);
            cache.registry().delete_file(file)?;
        }
        match ticket {
            Some(ticket) if cache.synchronous() == Synchronous::Full => ticket.wait(),
            _ => Ok(()),
        }
    }

    fn finish_rollback(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let manager = self.manager;
        let registry = manager.cache.registry();
        self.pages.clear();
        for key in self.allocated.drain(..) {
            if let Some(segment) = registry.try_segment(key.file) {
                segment.release_page(key.index);
            }
        }
        for file in self.added_files.drain(..) {
            manager.cache.forget_file(file);
            if let Err(err) = registry.delete_file(file) {
                warn!(file = file.0, error = %err, "atomic.rollback.delete_failed");
            }
        }
        self.deleted_files.clear();
        self.locks.clear();
        self.manager.freezer.leave();
        debug!(op = self.id.0, "atomic.rollback");
    }
}

impl Drop for AtomicOperation<'_> {
    fn drop(&mut self) {
        self.finish_rollback();
    }
}

impl fmt::Debug for AtomicOperation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicOperation")
            .field("id", &self.id)
            .field("pages", &self.pages.len())
            .field("rollback_only", &self.rollback_only)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::dwl::SegmentedDoubleWriteLog;
    use crate::primitives::io::StdFileOpener;
    use crate::primitives::pager::{CacheConfig, FileRegistry};
    use crate::primitives::dwl::DoubleWriteLog;
    use crate::types::page::{PageKind, PAGE_HDR_LEN};
    use std::path::Path;
    use tempfile::tempdir;

    const PAGE: usize = 4096;

    fn manager(dir: &Path) -> AtomicOperationsManager {
        let registry = Arc::new(FileRegistry::open(dir, PAGE, Arc::new(StdFileOpener)).unwrap());
        let dwl = Arc::new(SegmentedDoubleWriteLog::new(Arc::new(StdFileOpener), 1 << 20, 1 << 30));
        dwl.open("ops", dir, PAGE).unwrap();
        let cache = PageCache::new(
            CacheConfig {
                page_size: PAGE,
                capacity: 16,
                verify_checksums: true,
                flush_batch_pages: 32,
                flush_retries: 0,
                flush_retry_backoff: Duration::from_millis(1),
                synchronous: Synchronous::Full,
            },
            registry,
            dwl,
        )
        .unwrap();
        AtomicOperationsManager::new(Arc::new(cache))
    }

    fn write_marker(op: &mut AtomicOperation<'_>, key: PageKey, marker: u8) {
        let page = op.page_mut(key).unwrap();
        page::set_kind(page, PageKind::Raw);
        page[PAGE_HDR_LEN] = marker;
    }

    #[test]
    fn committed_pages_become_visible() {
        let dir = tempdir().unwrap();
        let ops = manager(dir.path());
        let mut op = ops.start_atomic_operation().unwrap();
        let file = op.add_file("a.cbt").unwrap();
        let index = op.allocate_page(file).unwrap();
        let key = PageKey::new(file, index);
        write_marker(&mut op, key, 7);
        assert_eq!(op.read_page(key, |p| Ok(p[PAGE_HDR_LEN])).unwrap(), 7);
        op.commit().unwrap();
        assert_eq!(ops.active_operations(), 0);
        let page = ops.cache().load(key).unwrap();
        assert_eq!(page.data()[PAGE_HDR_LEN], 7);
        page::verify(page.data(), key, true).unwrap();
    }

    #[test]
    fn rollback_discards_pages_and_files() {
        let dir = tempdir().unwrap();
        let ops = manager(dir.path());
        let mut op = ops.start_atomic_operation().unwrap();
        let file = op.add_file("b.cbt").unwrap();
        op.allocate_page(file).unwrap();
        drop(op);
        assert_eq!(ops.active_operations(), 0);
        assert!(ops.cache().registry().try_segment(file).is_none());
        assert!(!dir.path().join("b.cbt").exists());
    }

    #[test]
    fn rolled_back_allocation_is_reused() {
        let dir = tempdir().unwrap();
        let ops = manager(dir.path());
        let mut op = ops.start_atomic_operation().unwrap();
        let file = op.add_file("c.cbt").unwrap();
        let first = op.allocate_page(file).unwrap();
        write_marker(&mut op, PageKey::new(file, first), 1);
        op.commit().unwrap();

        let mut op = ops.start_atomic_operation().unwrap();
        let second = op.allocate_page(file).unwrap();
        op.rollback();
        let mut op = ops.start_atomic_operation().unwrap();
        assert_eq!(op.allocate_page(file).unwrap(), second);
        op.rollback();
    }

    #[test]
    fn rollback_only_commit_fails_without_publishing() {
        let dir = tempdir().unwrap();
        let ops = manager(dir.path());
        let mut op = ops.start_atomic_operation().unwrap();
        let file = op.add_file("d.cbt").unwrap();
        let index = op.allocate_page(file).unwrap();
        write_marker(&mut op, PageKey::new(file, index), 9);
        op.commit().unwrap();

        let key = PageKey::new(file, index);
        let mut op = ops.start_atomic_operation().unwrap();
        write_marker(&mut op, key, 10);
        op.mark_rollback_only();
        assert!(matches!(op.commit(), Err(StoreError::Invalid(_))));
        assert_eq!(ops.cache().load(key).unwrap().data()[PAGE_HDR_LEN], 9);
    }

    #[test]
    fn reject_freeze_refuses_admission() {
        let dir = tempdir().unwrap();
        let ops = manager(dir.path());
        let guard = ops.freeze(FreezeMode::Reject).unwrap();
        assert_eq!(ops.state(), FreezerState::Frozen);
        let err = ops.start_atomic_operation().unwrap_err();
        assert!(err.is_retryable());
        ops.unfreeze(guard);
        ops.start_atomic_operation().unwrap().rollback();
    }

    #[test]
    fn component_locks_are_shared_by_name() {
        let dir = tempdir().unwrap();
        let ops = manager(dir.path());
        let a = ops.component_locks("idx");
        let b = ops.component_locks("idx");
        let c = ops.component_locks("other");
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        let mut op = ops.start_atomic_operation().unwrap();
        op.lock_component(&c);
        op.lock_component(&a);
        op.lock_component(&b);
        assert!(op.holds_lock(a.id()));
        assert_eq!(op.locks.len(), 2);
        assert!(op.locks[0].locks.id() < op.locks[1].locks.id());
        op.rollback();
        assert!(a.mutation.try_lock().is_some());
    }

    #[test]
    fn end_atomic_operation_commits_or_rolls_back() {
        let dir = tempdir().unwrap();
        let ops = manager(dir.path());
        let mut op = ops.start_atomic_operation().unwrap();
        let file = op.add_file("e.cbt").unwrap();
        ops.end_atomic_operation(op, true).unwrap();
        assert!(ops.cache().registry().try_segment(file).is_some());

        let mut op = ops.start_atomic_operation().unwrap();
        op.delete_file(file).unwrap();
        ops.end_atomic_operation(op, false).unwrap();
        assert!(ops.cache().registry().try_segment(file).is_some());

        let mut op = ops.start_atomic_operation().unwrap();
        op.delete_file(file).unwrap();
        ops.end_atomic_operation(op, true).unwrap();
        assert!(ops.cache().registry().try_segment(file).is_none());
    }
}
