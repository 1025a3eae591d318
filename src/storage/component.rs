#![forbid(unsafe_code)]
//! Base of every page-backed structure that mutates inside atomic operations.

use std::sync::Arc;

use parking_lot::RwLockReadGuard;
use tracing::debug;

use super::atomic::{AtomicOperation, AtomicOperationsManager, ComponentLocks};
use crate::primitives::pager::PageCache;
use crate::types::{ComponentId, FileId, PageKey, Result, StoreError};

/// A named structure stored in one or more paged files.
///
/// Every mutating call takes the current [`AtomicOperation`] explicitly and first
/// locks the component for that operation. Readers outside an operation go through
/// [`DurableComponent::shared_lock`] so they never observe half of a commit.
pub struct DurableComponent {
    name: String,
    extension: String,
    cache: Arc<PageCache>,
    locks: Arc<ComponentLocks>,
}

impl DurableComponent {
    /// Binds a component called `name` whose main file carries `extension`.
    pub fn new(manager: &AtomicOperationsManager, name: &str, extension: &str) -> Self {
        Self {
            name: name.to_owned(),
            extension: extension.to_owned(),
            cache: Arc::clone(manager.cache()),
            locks: manager.component_locks(&format!("{name}.{extension}")),
        }
    }

    /// Component name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Extension of the main data file.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Name of the main data file.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.name, self.extension)
    }

    /// Identifier shared by every handle on this component.
    pub fn id(&self) -> ComponentId {
        self.locks.id()
    }

    /// Cache the component reads through.
    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    /// Creates `file_name` inside `op`.
    pub fn add_file(&self, op: &mut AtomicOperation<'_>, file_name: &str) -> Result<FileId> {
        self.acquire_exclusive_lock(op);
        let file = op.add_file(file_name)?;
        debug!(component = %self.name, file = file.0, file_name, "component.add_file");
        Ok(file)
    }

    /// Id of an existing file.
    pub fn open_file(&self, file_name: &str) -> Option<FileId> {
        self.cache.registry().file_id(file_name)
    }

    /// Deletes `file` when `op` commits.
    pub fn delete_file(&self, op: &mut AtomicOperation<'_>, file: FileId) -> Result<()> {
        self.acquire_exclusive_lock(op);
        op.delete_file(file)
    }

    /// Appends a zeroed page to `file` and returns its index.
    pub fn add_page(&self, op: &mut AtomicOperation<'_>, file: FileId) -> Result<u64> {
        self.acquire_exclusive_lock(op);
        op.allocate_page(file)
    }

    /// Pages allocated in `file`, including ones allocated by running operations.
    pub fn page_count(&self, file: FileId) -> Result<u64> {
        Ok(self.cache.registry().segment(file)?.page_count())
    }

    /// Runs `f` over a page: the operation's private copy when `op` has one, the
    /// committed image otherwise.
    pub fn load_page_for_read<R>(
        &self,
        op: Option<&AtomicOperation<'_>>,
        key: PageKey,
        f: impl FnOnce(&[u8]) -> Result<R>,
    ) -> Result<R> {
        match op {
            Some(op) => op.read_page(key, f),
            None => {
                let page = self.cache.load(key)?;
                f(page.data())
            }
        }
    }

    /// Private copy of a page for `op` to change.
    pub fn load_page_for_write<'o>(
        &self,
        op: &'o mut AtomicOperation<'_>,
        key: PageKey,
    ) -> Result<&'o mut [u8]> {
        self.acquire_exclusive_lock(op);
        op.page_mut(key)
    }

    /// Locks the component for `op` until the operation ends.
    pub fn acquire_exclusive_lock(&self, op: &mut AtomicOperation<'_>) {
        op.lock_component(&self.locks);
    }

    /// Keeps commits of this component out while held.
    pub fn shared_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.locks.read_visible()
    }

    /// Runs `f` with the component locked; a failure makes `op` rollback-only.
    pub fn execute_inside_component_operation<'a, R>(
        &self,
        op: &mut AtomicOperation<'a>,
        f: impl FnOnce(&mut AtomicOperation<'a>) -> Result<R>,
    ) -> Result<R> {
        self.acquire_exclusive_lock(op);
        let outcome = f(op);
        if outcome.is_err() {
            op.mark_rollback_only();
        }
        outcome
    }

    /// Error describing a page of this component in an impossible state.
    pub fn structure_error(&self, key: PageKey, reason: &'static str) -> StoreError {
        StoreError::Structure {
            component: self.name.clone(),
            file: key.file,
            page: key.index,
            reason,
        }
    }
}

impl std::fmt::Debug for DurableComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableComponent")
            .field("name", &self.name)
            .field("extension", &self.extension)
            .field("id", &self.locks.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::dwl::NoopDoubleWriteLog;
    use crate::primitives::io::StdFileOpener;
    use crate::primitives::pager::{CacheConfig, FileRegistry, Synchronous};
    use crate::types::page::{set_kind, PageKind, PAGE_HDR_LEN};
    use std::time::Duration;
    use tempfile::tempdir;

    fn manager(dir: &std::path::Path) -> AtomicOperationsManager {
        let registry =
            Arc::new(FileRegistry::open(dir, 4096, Arc::new(StdFileOpener)).unwrap());
        let cache = PageCache::new(
            CacheConfig {
                page_size: 4096,
                capacity: 8,
                verify_checksums: true,
                flush_batch_pages: 16,
                flush_retries: 0,
                flush_retry_backoff: Duration::from_millis(1),
                synchronous: Synchronous::Full,
            },
            registry,
            Arc::new(NoopDoubleWriteLog),
        )
        .unwrap();
        AtomicOperationsManager::new(Arc::new(cache))
    }

    #[test]
    fn failed_step_marks_operation_rollback_only() {
        let dir = tempdir().unwrap();
        let ops = manager(dir.path());
        let component = DurableComponent::new(&ops, "people", "cbt");
        let mut op = ops.start_atomic_operation().unwrap();
        let file = component.add_file(&mut op, &component.full_name()).unwrap();
        let err = component
            .execute_inside_component_operation(&mut op, |op| {
                let index = op.allocate_page(file)?;
                Err::<(), _>(component.structure_error(PageKey::new(file, index), "test"))
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Structure { .. }));
        assert!(op.is_rollback_only());
        assert!(op.holds_lock(component.id()));
        assert!(op.commit().is_err());
        assert!(component.open_file("people.cbt").is_none());
    }

    #[test]
    fn pages_written_in_an_operation_stay_private_until_commit() {
        let dir = tempdir().unwrap();
        let ops = manager(dir.path());
        let component = DurableComponent::new(&ops, "people", "cbt");
        let mut op = ops.start_atomic_operation().unwrap();
        let file = component.add_file(&mut op, "people.cbt").unwrap();
        let index = component.add_page(&mut op, file).unwrap();
        op.commit().unwrap();

        let key = PageKey::new(file, index);
        let mut op = ops.start_atomic_operation().unwrap();
        {
            let page = component.load_page_for_write(&mut op, key).unwrap();
            set_kind(page, PageKind::Raw);
            page[PAGE_HDR_LEN] = 42;
        }
        let private = component
            .load_page_for_read(Some(&op), key, |p| Ok(p[PAGE_HDR_LEN]))
            .unwrap();
        let committed = component
            .load_page_for_read(None, key, |p| Ok(p[PAGE_HDR_LEN]))
            .unwrap();
        assert_eq!((private, committed), (42, 0));
        op.commit().unwrap();
        let _visible = component.shared_lock();
        assert_eq!(
            component
                .load_page_for_read(None, key, |p| Ok(p[PAGE_HDR_LEN]))
                .unwrap(),
            42
        );
        assert_eq!(component.page_count(file).unwrap(), 1);
    }
}
