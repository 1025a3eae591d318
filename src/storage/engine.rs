#![forbid(unsafe_code)]
//! Storage facade: opens the files, recovers from the double-write log and owns the
//! page cache, the flush worker and the atomic operation manager.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::atomic::{AtomicOperation, AtomicOperationsManager, FreezeGuard, FreezeMode};
use super::options::{DoubleWriteMode, StorageOptions};
use crate::primitives::dwl::{DoubleWriteLog, DwlStats, NoopDoubleWriteLog, SegmentedDoubleWriteLog};
use crate::primitives::io::{FileOpener, StdFileOpener};
use crate::primitives::pager::{CacheStats, FileRegistry, PageCache, StorageExceptionListener};
use crate::types::{PageKey, Result, StoreError};

/// Counters of a running storage.
#[derive(Clone, Debug, Serialize)]
pub struct StorageStats {
    /// Page cache counters.
    pub cache: CacheStats,
    /// Double-write log counters.
    pub dwl: DwlStats,
    /// Atomic operations currently running.
    pub active_operations: usize,
    /// Pages copied back from the double-write log when the storage opened.
    pub restored_pages: u64,
    /// Checkpoints completed since open.
    pub checkpoints: u64,
}

/// Outcome of one checkpoint.
#[derive(Clone, Debug, Serialize)]
pub struct CheckpointReport {
    /// Wall time spent, freeze included.
    pub duration_ms: f64,
    /// Double-write log segment files deleted.
    pub segments_removed: u64,
}

struct Shared {
    name: String,
    dir: PathBuf,
    cache: Arc<PageCache>,
    operations: AtomicOperationsManager,
    checkpoint_lock: Mutex<()>,
    checkpoints: AtomicU64,
    stopping: Mutex<bool>,
    wakeup: Condvar,
}

impl Shared {
    fn checkpoint(&self) -> Result<CheckpointReport> {
        let _serial = self.checkpoint_lock.lock();
        let started = Instant::now();
        let dwl = self.cache.dwl();
        let segments_before = dwl.stats().segments;
        let freeze = self.operations.freeze(FreezeMode::Park)?;
        let outcome = self.write_back_and_truncate(dwl.as_ref());
        drop(freeze);
        outcome?;
        let completed = self.checkpoints.fetch_add(1, Ordering::Relaxed) + 1;
        let report = CheckpointReport {
            duration_ms: started.elapsed().as_secs_f64() * 1_000.0,
            segments_removed: segments_before.saturating_sub(dwl.stats().segments),
        };
        info!(
            storage = %self.name,
            duration_ms = report.duration_ms,
            segments_removed = report.segments_removed,
            checkpoints = completed,
            "storage.checkpoint"
        );
        Ok(report)
    }

    fn write_back_and_truncate(&self, dwl: &dyn DoubleWriteLog) -> Result<()> {
        self.cache.flush_all()?;
        dwl.start_checkpoint()?;
        let truncated = self.cache.sync_files().and_then(|()| dwl.truncate());
        let ended = dwl.end_checkpoint();
        truncated?;
        ended
    }

    fn run_checkpointer(&self, interval: Duration) {
        let mut stopping = self.stopping.lock();
        while !*stopping {
            self.wakeup.wait_for(&mut stopping, interval);
            if *stopping {
                break;
            }
            if !self.cache.dwl().needs_checkpoint() {
                continue;
            }
            drop(stopping);
            if let Err(err) = self.checkpoint() {
                warn!(storage = %self.name, error = %err, "storage.checkpoint.auto_failed");
            }
            stopping = self.stopping.lock();
        }
        debug!(storage = %self.name, "storage.checkpointer.stop");
    }
}

/// One storage directory with its page cache, double-write log and atomic
/// operations.
///
/// ```no_run
/// use cellstore::storage::{BTreeOptions, SingleValueTree, Storage, StorageOptions};
/// use cellstore::types::Rid;
///
/// # fn main() -> cellstore::types::Result<()> {
/// let storage = Storage::open("/tmp/db", "db", StorageOptions::default())?;
/// let ops = storage.atomic_operations();
/// let mut op = ops.start_atomic_operation()?;
/// let tree = SingleValueTree::<String>::create(&mut op, "people", BTreeOptions::default())?;
/// tree.put(&mut op, &"ann".to_owned(), Rid::new(10, 1))?;
/// op.commit()?;
/// assert_eq!(tree.get(&"ann".to_owned())?, Some(Rid::new(10, 1)));
/// drop(tree);
/// storage.close()?;
/// # Ok(())
/// # }
/// ```
pub struct Storage {
    shared: Arc<Shared>,
    options: StorageOptions,
    restored_pages: u64,
    checkpointer: Mutex<Option<JoinHandle<()>>>,
}

impl Storage {
    /// Opens (creating if needed) the storage `name` in `dir`.
    pub fn open(dir: impl AsRef<Path>, name: &str, options: StorageOptions) -> Result<Self> {
        Self::open_with(dir, name, options, Arc::new(StdFileOpener))
    }

    /// Like [`Storage::open`] with a custom file opener.
    pub fn open_with(
        dir: impl AsRef<Path>,
        name: &str,
        options: StorageOptions,
        opener: Arc<dyn FileOpener>,
    ) -> Result<Self> {
        options
            .validate()
            .map_err(|err| StoreError::Config(err.to_string()))?;
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let page_size = options.page_size as usize;
        let registry = Arc::new(FileRegistry::open(dir, page_size, Arc::clone(&opener))?);
        let dwl: Arc<dyn DoubleWriteLog> = match options.double_write {
            DoubleWriteMode::Enabled => Arc::new(SegmentedDoubleWriteLog::new(
                Arc::clone(&opener),
                options.dwl_max_segment_bytes,
                options.dwl_checkpoint_bytes,
            )),
            DoubleWriteMode::Disabled => Arc::new(NoopDoubleWriteLog),
        };
        dwl.open(name, dir, page_size)?;
        let restored_pages = recover(&registry, dwl.as_ref())?;
        let cache = Arc::new(PageCache::new(options.cache_config(), registry, dwl)?);
        let shared = Arc::new(Shared {
            name: name.to_owned(),
            dir: dir.to_path_buf(),
            operations: AtomicOperationsManager::new(Arc::clone(&cache)),
            cache,
            checkpoint_lock: Mutex::new(()),
            checkpoints: AtomicU64::new(0),
            stopping: Mutex::new(false),
            wakeup: Condvar::new(),
        });
        let checkpointer = match (options.auto_checkpoint_ms, options.double_write) {
            (Some(ms), DoubleWriteMode::Enabled) => {
                let worker = Arc::clone(&shared);
                let interval = Duration::from_millis(ms);
                Some(
                    thread::Builder::new()
                        .name("cellstore-checkpoint".into())
                        .spawn(move || worker.run_checkpointer(interval))?,
                )
            }
            _ => None,
        };
        info!(
            storage = name,
            dir = %dir.display(),
            page_size,
            restored_pages,
            double_write = ?options.double_write,
            "storage.open"
        );
        Ok(Self {
            shared,
            options,
            restored_pages,
            checkpointer: Mutex::new(checkpointer),
        })
    }

    /// Storage name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Directory holding the data files.
    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    /// Options the storage was opened with.
    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Page cache shared by every component.
    pub fn cache(&self) -> &Arc<PageCache> {
        &self.shared.cache
    }

    /// Coordinator of atomic operations; components are created and loaded against it.
    pub fn atomic_operations(&self) -> &AtomicOperationsManager {
        &self.shared.operations
    }

    /// Starts an atomic operation.
    pub fn begin_atomic_operation(&self) -> Result<AtomicOperation<'_>> {
        self.shared.operations.start_atomic_operation()
    }

    /// Freezes atomic operations, then flushes and fsyncs every committed page.
    ///
    /// The returned guard unfreezes on drop. Must not be called while the calling
    /// thread has an operation open.
    pub fn freeze(&self, mode: FreezeMode) -> Result<FreezeGuard<'_>> {
        let guard = self.shared.operations.freeze(mode)?;
        self.shared.cache.flush_all()?;
        self.shared.cache.sync_files()?;
        info!(storage = %self.shared.name, mode = ?mode, "storage.freeze");
        Ok(guard)
    }

    /// Writes every committed page to the data files and truncates the
    /// double-write log.
    pub fn checkpoint(&self) -> Result<CheckpointReport> {
        self.shared.checkpoint()
    }

    /// Registers a listener for background flush failures.
    pub fn register_exception_listener(&self, listener: Arc<dyn StorageExceptionListener>) {
        self.shared.cache.register_listener(listener);
    }

    /// Snapshot of the storage counters.
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            cache: self.shared.cache.stats(),
            dwl: self.shared.cache.dwl().stats(),
            active_operations: self.shared.operations.active_operations(),
            restored_pages: self.restored_pages,
            checkpoints: self.shared.checkpoints.load(Ordering::Relaxed),
        }
    }

    fn stop_checkpointer(&self) {
        *self.shared.stopping.lock() = true;
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.checkpointer.lock().take() {
            if handle.join().is_err() {
                warn!(storage = %self.shared.name, "storage.checkpointer.panicked");
            }
        }
    }

    /// Checkpoints, stops the background threads and deletes the double-write log.
    pub fn close(self) -> Result<()> {
        self.stop_checkpointer();
        self.shared.checkpoint()?;
        self.shared.cache.shutdown()?;
        self.shared.cache.dwl().close()?;
        info!(storage = %self.shared.name, "storage.close");
        Ok(())
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        self.stop_checkpointer();
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("name", &self.shared.name)
            .field("dir", &self.shared.dir)
            .field("restored_pages", &self.restored_pages)
            .finish()
    }
}

/// Copies every page image still held by the double-write log back into the data
/// files, then drops the log.
fn recover(registry: &FileRegistry, dwl: &dyn DoubleWriteLog) -> Result<u64> {
    let pending = dwl.pending_pages();
    if pending.is_empty() {
        return Ok(0);
    }
    info!(pages = pending.len(), "storage.recovery.start");
    dwl.restore_mode_on()?;
    let replayed = replay(registry, dwl, &pending);
    dwl.restore_mode_off();
    let restored = replayed?;
    dwl.start_checkpoint()?;
    let truncated = dwl.truncate();
    dwl.end_checkpoint()?;
    truncated?;
    info!(restored, "storage.recovery.done");
    Ok(restored)
}

fn replay(
    registry: &FileRegistry,
    dwl: &dyn DoubleWriteLog,
    pending: &[PageKey],
) -> Result<u64> {
    let mut restored = 0u64;
    for &key in pending {
        let Some(segment) = registry.try_segment(key.file) else {
            debug!(file = key.file.0, page = key.index, "storage.recovery.skip_deleted");
            continue;
        };
        let Some(image) = dwl.load_page(key)? else {
            continue;
        };
        segment.write_page(key.index, &image)?;
        restored += 1;
    }
    registry.sync_all()?;
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::atomic::FreezerState;
    use tempfile::tempdir;

    fn options() -> StorageOptions {
        StorageOptions {
            page_size: 4096,
            cache_pages: 32,
            auto_checkpoint_ms: None,
            ..StorageOptions::default()
        }
    }

    #[test]
    fn invalid_options_are_a_config_error() {
        let dir = tempdir().unwrap();
        let bad = StorageOptions {
            page_size: 3000,
            ..options()
        };
        assert!(matches!(
            Storage::open(dir.path(), "bad", bad),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn freeze_guard_parks_and_releases() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path(), "frz", options()).unwrap();
        {
            let _guard = storage.freeze(FreezeMode::Reject).unwrap();
            assert_eq!(storage.atomic_operations().state(), FreezerState::Frozen);
            assert!(matches!(
                storage.begin_atomic_operation(),
                Err(StoreError::OperationsFrozen)
            ));
        }
        assert_eq!(storage.atomic_operations().state(), FreezerState::Running);
        storage.begin_atomic_operation().unwrap().rollback();
        storage.close().unwrap();
    }

    #[test]
    fn checkpoint_empties_the_log() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path(), "cp", options()).unwrap();
        let mut op = storage.begin_atomic_operation().unwrap();
        let file = op.add_file("raw.dat").unwrap();
        let index = op.allocate_page(file).unwrap();
        let page = op.page_mut(PageKey::new(file, index)).unwrap();
        crate::types::page::set_kind(page, crate::types::page::PageKind::Raw);
        op.commit().unwrap();
        storage.checkpoint().unwrap();
        let stats = storage.stats();
        assert_eq!(stats.checkpoints, 1);
        assert_eq!(stats.dwl.restorable_pages, 0);
        storage.close().unwrap();
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "dwl"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
