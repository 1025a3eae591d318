#![forbid(unsafe_code)]

use std::cmp::{max, min};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::flush::{run_worker, Completion, FlushPage, FlushRequest, FlushTicket};
use super::frame::{Frame, FrameState};
use super::registry::FileRegistry;
use super::segment::FileSegment;
use super::Synchronous;
use crate::primitives::concurrency::{queue, QueueProducer};
use crate::primitives::dwl::DoubleWriteLog;
use crate::types::page;
use crate::types::{FileId, PageKey, Result, StoreError};

/// Receives failures raised on the background flush thread.
pub trait StorageExceptionListener: Send + Sync {
    /// Called once per failed flush attempt, and once more if the storage fails closed.
    fn on_exception(&self, err: &StoreError);
}

impl<F> StorageExceptionListener for F
where
    F: Fn(&StoreError) + Send + Sync,
{
    fn on_exception(&self, err: &StoreError) {
        self(err)
    }
}

/// Tuning for a [`PageCache`].
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Page size in bytes.
    pub page_size: usize,
    /// Frames kept resident before eviction starts.
    pub capacity: usize,
    /// Verify page checksums on every disk read.
    pub verify_checksums: bool,
    /// Pages the flush worker coalesces into one batch.
    pub flush_batch_pages: usize,
    /// Retries before a failing flush turns fatal.
    pub flush_retries: u32,
    /// Base delay between flush retries; grows linearly per attempt.
    pub flush_retry_backoff: Duration,
    /// Durability of committed batches.
    pub synchronous: Synchronous,
}

/// Snapshot of cache counters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CacheStats {
    /// Loads served from memory.
    pub hits: u64,
    /// Loads that read the disk.
    pub misses: u64,
    /// Frames evicted.
    pub evictions: u64,
    /// Pages currently resident.
    pub resident: u64,
    /// Configured capacity.
    pub capacity: u64,
    /// Resident pages waiting for the flush worker.
    pub dirty: u64,
    /// Pages written by the flush worker.
    pub flushed_pages: u64,
    /// Batches written by the flush worker.
    pub flush_batches: u64,
    /// Failed flush attempts.
    pub flush_errors: u64,
    /// Torn pages rebuilt from the double-write log.
    pub repaired_pages: u64,
    /// Requests waiting in the flush queue.
    pub queued_requests: u64,
}

#[derive(Default)]
pub(super) struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    flushed_pages: AtomicU64,
    flush_batches: AtomicU64,
    flush_errors: AtomicU64,
    repaired_pages: AtomicU64,
}

impl CacheCounters {
    pub(super) fn record_flush(&self, pages: u64) {
        self.flushed_pages.fetch_add(pages, AtomicOrdering::Relaxed);
        self.flush_batches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(super) fn record_flush_error(&self) {
        self.flush_errors.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

struct CacheInner {
    frames: Vec<Frame>,
    free: Vec<usize>,
    page_table: FxHashMap<PageKey, usize>,
    resident: usize,
    clock_hand_hot: usize,
    clock_hand_cold: usize,
    target_cold: usize,
    hot_count: usize,
    cold_count: usize,
    test_pages: VecDeque<PageKey>,
    test_lookup: FxHashSet<PageKey>,
}

impl CacheInner {
    fn new(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity),
            free: Vec::new(),
            page_table: FxHashMap::default(),
            resident: 0,
            clock_hand_hot: 0,
            clock_hand_cold: 0,
            target_cold: max(1, capacity / 2),
            hot_count: 0,
            cold_count: 0,
            test_pages: VecDeque::new(),
            test_lookup: FxHashSet::default(),
        }
    }

    fn set_frame_state(&mut self, idx: usize, new_state: FrameState) {
        let frame = &mut self.frames[idx];
        if frame.state == new_state {
            return;
        }
        match frame.state {
            FrameState::Hot => self.hot_count = self.hot_count.saturating_sub(1),
            FrameState::Cold => self.cold_count = self.cold_count.saturating_sub(1),
            FrameState::Test => {}
        }
        match new_state {
            FrameState::Hot => self.hot_count += 1,
            FrameState::Cold => self.cold_count += 1,
            FrameState::Test => {}
        }
        frame.state = new_state;
    }

    fn add_test_page(&mut self, key: PageKey, limit: usize) {
        if self.test_lookup.insert(key) {
            self.test_pages.push_back(key);
            while self.test_pages.len() > limit {
                if let Some(oldest) = self.test_pages.pop_front() {
                    self.test_lookup.remove(&oldest);
                }
            }
        }
    }

    fn remove_test_page(&mut self, key: &PageKey) -> bool {
        if self.test_lookup.remove(key) {
            if let Some(pos) = self.test_pages.iter().position(|k| k == key) {
                self.test_pages.swap_remove_back(pos);
            }
            true
        } else {
            false
        }
    }
}

/// State shared between the cache handle and the flush worker.
pub(crate) struct CacheShared {
    pub(super) config: CacheConfig,
    pub(super) registry: Arc<FileRegistry>,
    pub(super) dwl: Arc<dyn DoubleWriteLog>,
    pub(super) fatal: Mutex<Option<String>>,
    pub(super) counters: CacheCounters,
    inner: Mutex<CacheInner>,
    listeners: RwLock<Vec<Arc<dyn StorageExceptionListener>>>,
}

impl CacheShared {
    pub(super) fn health(&self) -> Result<()> {
        match self.fatal.lock().as_ref() {
            Some(message) => Err(StoreError::Fatal(message.clone())),
            None => Ok(()),
        }
    }

    pub(super) fn notify(&self, err: &StoreError) {
        for listener in self.listeners.read().iter() {
            listener.on_exception(err);
        }
    }

    pub(super) fn mark_clean(&self, pages: &[FlushPage]) {
        let mut inner = self.inner.lock();
        for page in pages {
            if let Some(&idx) = inner.page_table.get(&page.key) {
                let frame = &mut inner.frames[idx];
                if frame.version == page.version {
                    frame.dirty = false;
                }
            }
        }
    }

    fn unpin(&self, idx: usize) {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get_mut(idx) {
            frame.pin_count = frame.pin_count.saturating_sub(1);
        }
    }

    /// Finds a slot for a new page: a free frame while under capacity, an evicted one
    /// once full, or an extra frame when every resident page is pinned or dirty.
    fn obtain_frame(&self, inner: &mut CacheInner) -> usize {
        let capacity = self.config.capacity;
        if inner.resident >= capacity {
            if let Some(idx) = self.run_clock(inner) {
                if inner.resident >= capacity {
                    if let Some(extra) = self.run_clock(inner) {
                        inner.free.push(extra);
                    }
                }
                return idx;
            }
        }
        if let Some(idx) = inner.free.pop() {
            return idx;
        }
        if inner.resident >= capacity {
            debug!(
                resident = inner.resident,
                capacity, "cache.capacity.exceeded"
            );
        }
        inner.frames.push(Frame::empty());
        inner.frames.len() - 1
    }

    fn install(&self, inner: &mut CacheInner, idx: usize, key: PageKey) {
        let capacity = self.config.capacity;
        {
            let frame = &mut inner.frames[idx];
            frame.ensure_buffer(self.config.page_size);
            frame.key = Some(key);
            frame.reference = true;
            frame.dirty = false;
            frame.pin_count = 0;
        }
        if inner.remove_test_page(&key) {
            inner.target_cold = min(capacity, inner.target_cold + 1);
            inner.set_frame_state(idx, FrameState::Hot);
        } else {
            if inner.target_cold > 1 {
                inner.target_cold -= 1;
            }
            inner.set_frame_state(idx, FrameState::Cold);
        }
        inner.page_table.insert(key, idx);
        inner.resident += 1;
        self.adjust_cold_balance(inner);
    }

    fn discard(&self, inner: &mut CacheInner, idx: usize) {
        if let Some(key) = inner.frames[idx].key {
            if inner.page_table.get(&key) == Some(&idx) {
                inner.page_table.remove(&key);
            }
            inner.resident -= 1;
        }
        inner.set_frame_state(idx, FrameState::Test);
        inner.frames[idx].reset();
        inner.free.push(idx);
    }

    fn evict_frame(&self, inner: &mut CacheInner, idx: usize) {
        if let Some(key) = inner.frames[idx].key {
            if inner.page_table.get(&key) == Some(&idx) {
                inner.page_table.remove(&key);
            }
            inner.add_test_page(key, self.config.capacity);
            inner.resident -= 1;
        }
        inner.set_frame_state(idx, FrameState::Test);
        let frame = &mut inner.frames[idx];
        frame.reset();
        if idx >= self.config.capacity {
            frame.release_buffer();
        }
        CacheCounters::bump(&self.counters.evictions);
    }

    fn run_clock(&self, inner: &mut CacheInner) -> Option<usize> {
        let len = inner.frames.len();
        if len == 0 {
            return None;
        }
        for _ in 0..len * 4 {
            let idx = inner.clock_hand_cold % len;
            inner.clock_hand_cold = (idx + 1) % len;
            let mut promote_to_hot = false;
            let mut convert_to_cold = false;
            let mut evict = false;
            {
                let frame = &mut inner.frames[idx];
                if !frame.is_evictable() {
                    continue;
                }
                match frame.state {
                    FrameState::Cold => {
                        if frame.reference {
                            frame.reference = false;
                            promote_to_hot = true;
                        } else {
                            evict = true;
                        }
                    }
                    FrameState::Hot => {
                        if frame.reference {
                            frame.reference = false;
                        } else if inner.cold_count < inner.target_cold {
                            convert_to_cold = true;
                        }
                    }
                    FrameState::Test => {}
                }
            }
            if promote_to_hot {
                inner.set_frame_state(idx, FrameState::Hot);
            } else if convert_to_cold {
                inner.set_frame_state(idx, FrameState::Cold);
            } else if evict {
                self.evict_frame(inner, idx);
                return Some(idx);
            }
        }
        None
    }

    fn adjust_cold_balance(&self, inner: &mut CacheInner) {
        while inner.cold_count > inner.target_cold {
            if !Self::shift_state(inner, FrameState::Cold, FrameState::Hot) {
                break;
            }
        }
        while inner.cold_count < inner.target_cold {
            if !Self::shift_state(inner, FrameState::Hot, FrameState::Cold) {
                break;
            }
        }
    }

    /// Moves one unpinned frame from `from` to `to`, skipping recently referenced hot frames.
    fn shift_state(inner: &mut CacheInner, from: FrameState, to: FrameState) -> bool {
        let len = inner.frames.len();
        if len == 0 {
            return false;
        }
        for _ in 0..len * 2 {
            let idx = inner.clock_hand_hot % len;
            inner.clock_hand_hot = (idx + 1) % len;
            let frame = &mut inner.frames[idx];
            if frame.key.is_none() || frame.pin_count > 0 || frame.state != from {
                continue;
            }
            if from == FrameState::Hot && frame.reference {
                frame.reference = false;
                continue;
            }
            inner.set_frame_state(idx, to);
            return true;
        }
        false
    }

    /// Reads a page from its file and checks it; a damaged page is rebuilt from the
    /// double-write log when restore mode holds a copy.
    fn fill_from_disk(&self, dst: &mut [u8], segment: &FileSegment, key: PageKey) -> Result<()> {
        segment.read_page(key.index, dst)?;
        let err = match page::verify(dst, key, self.config.verify_checksums) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        let Some(image) = self.dwl.load_page(key)? else {
            warn!(page = %key, error = %err, "cache.page.corrupt");
            return Err(err);
        };
        page::verify(&image, key, true)?;
        dst.copy_from_slice(&image);
        segment.write_page(key.index, &image)?;
        CacheCounters::bump(&self.counters.repaired_pages);
        warn!(page = %key, "cache.page.repaired");
        Ok(())
    }
}

/// Pinned, read-locked view of a cached page. Unpins on drop.
pub struct PageRef<'a> {
    key: PageKey,
    shared: &'a CacheShared,
    frame: usize,
    guard: Option<ArcRwLockReadGuard<RawRwLock, Box<[u8]>>>,
}

impl PageRef<'_> {
    /// Address of the page.
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// Page bytes.
    pub fn data(&self) -> &[u8] {
        self.guard.as_deref().map_or(&[][..], |buf| &buf[..])
    }
}

impl Drop for PageRef<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.shared.unpin(self.frame);
    }
}

/// Write-back page cache with a single background flush thread.
///
/// Readers pin frames through [`PageCache::load`]. Committed images enter through
/// [`PageCache::apply`], which marks their frames dirty and queues them; the flush
/// worker logs each batch to the double-write log before writing the data files.
/// Dirty and pinned frames are never evicted.
pub struct PageCache {
    shared: Arc<CacheShared>,
    producer: QueueProducer<FlushRequest>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: Thread,
}

impl PageCache {
    /// Creates the cache and starts its flush thread.
    pub fn new(
        config: CacheConfig,
        registry: Arc<FileRegistry>,
        dwl: Arc<dyn DoubleWriteLog>,
    ) -> Result<Self> {
        if config.capacity == 0 {
            return Err(StoreError::Invalid("cache capacity must be non-zero"));
        }
        let capacity = config.capacity;
        let shared = Arc::new(CacheShared {
            config: CacheConfig {
                flush_batch_pages: config.flush_batch_pages.max(1),
                ..config
            },
            registry,
            dwl,
            fatal: Mutex::new(None),
            counters: CacheCounters::default(),
            inner: Mutex::new(CacheInner::new(capacity)),
            listeners: RwLock::new(Vec::new()),
        });
        let (producer, consumer) = queue();
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("cellstore-flush".into())
            .spawn(move || run_worker(worker_shared, consumer))?;
        let worker_thread = handle.thread().clone();
        info!(capacity, "cache.open");
        Ok(Self {
            shared,
            producer,
            worker: Mutex::new(Some(handle)),
            worker_thread,
        })
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.shared.config.page_size
    }

    /// Durability mode of committed batches.
    pub fn synchronous(&self) -> Synchronous {
        self.shared.config.synchronous
    }

    /// File registry backing the cache.
    pub fn registry(&self) -> &Arc<FileRegistry> {
        &self.shared.registry
    }

    /// Double-write log the flush worker writes through.
    pub fn dwl(&self) -> &Arc<dyn DoubleWriteLog> {
        &self.shared.dwl
    }

    /// Returns the page pinned and read-locked, reading it from disk on a miss.
    ///
    /// The disk read runs outside the cache mutex. The missing frame is installed
    /// pinned and write-locked first, so concurrent loads of the same page wait on the
    /// frame lock while loads of other pages proceed.
    pub fn load(&self, key: PageKey) -> Result<PageRef<'_>> {
        let segment = self.shared.registry.segment(key.file)?;
        loop {
            let mut inner = self.shared.inner.lock();
            if let Some(idx) = inner.page_table.get(&key).copied() {
                let frame = &mut inner.frames[idx];
                if frame.loading {
                    let buf = Arc::clone(&frame.buf);
                    drop(inner);
                    drop(buf.read());
                    continue;
                }
                CacheCounters::bump(&self.shared.counters.hits);
                frame.reference = true;
                frame.pin_count += 1;
                let buf = Arc::clone(&frame.buf);
                drop(inner);
                return Ok(PageRef {
                    key,
                    shared: &self.shared,
                    frame: idx,
                    guard: Some(buf.read_arc()),
                });
            }

            CacheCounters::bump(&self.shared.counters.misses);
            if key.index >= segment.page_count() {
                return Err(StoreError::Invalid("page not allocated"));
            }
            let idx = self.shared.obtain_frame(&mut inner);
            self.shared.install(&mut inner, idx, key);
            let frame = &mut inner.frames[idx];
            frame.loading = true;
            frame.pin_count = 1;
            let mut fill = frame.buf.write_arc();
            drop(inner);

            let outcome = self.shared.fill_from_disk(&mut fill[..], &segment, key);
            let mut inner = self.shared.inner.lock();
            inner.frames[idx].loading = false;
            if let Err(err) = outcome {
                self.shared.discard(&mut inner, idx);
                drop(inner);
                drop(fill);
                return Err(err);
            }
            drop(inner);
            return Ok(PageRef {
                key,
                shared: &self.shared,
                frame: idx,
                guard: Some(ArcRwLockWriteGuard::downgrade(fill)),
            });
        }
    }

    /// Copies the current image of `key` into `dst`.
    pub fn read_into(&self, key: PageKey, dst: &mut [u8]) -> Result<()> {
        let page = self.load(key)?;
        if dst.len() != page.data().len() {
            return Err(StoreError::Invalid("page buffer size mismatch"));
        }
        dst.copy_from_slice(page.data());
        Ok(())
    }

    /// Installs committed page images and queues them for write-back.
    ///
    /// Fails with [`StoreError::Fatal`] once the flush worker gave up.
    pub fn apply(&self, pages: Vec<(PageKey, Box<[u8]>)>) -> Result<FlushTicket> {
        self.shared.health()?;
        let mut queued = Vec::with_capacity(pages.len());
        for (key, image) in pages {
            if image.len() != self.page_size() {
                return Err(StoreError::Invalid("page buffer size mismatch"));
            }
            let (idx, buf, version) = loop {
                let mut inner = self.shared.inner.lock();
                let idx = match inner.page_table.get(&key).copied() {
                    Some(idx) if inner.frames[idx].loading => {
                        let buf = Arc::clone(&inner.frames[idx].buf);
                        drop(inner);
                        drop(buf.read());
                        continue;
                    }
                    Some(idx) => idx,
                    None => {
                        let idx = self.shared.obtain_frame(&mut inner);
                        self.shared.install(&mut inner, idx, key);
                        idx
                    }
                };
                let frame = &mut inner.frames[idx];
                frame.pin_count += 1;
                frame.reference = true;
                frame.dirty = true;
                frame.version += 1;
                break (idx, Arc::clone(&frame.buf), frame.version);
            };
            buf.write().copy_from_slice(&image);
            self.shared.unpin(idx);
            queued.push(FlushPage {
                key,
                image: Arc::from(image),
                version,
            });
        }
        let done = Completion::new();
        debug!(pages = queued.len(), "cache.apply");
        self.producer.offer(FlushRequest::Batch {
            pages: queued,
            done: Some(Arc::clone(&done)),
        });
        self.worker_thread.unpark();
        Ok(FlushTicket { completion: done })
    }

    /// Waits until every batch queued so far has been written.
    pub fn flush_all(&self) -> Result<()> {
        self.shared.health()?;
        let done = Completion::new();
        self.producer.offer(FlushRequest::Barrier(Arc::clone(&done)));
        self.worker_thread.unpark();
        FlushTicket { completion: done }.wait()
    }

    /// Fsyncs every data file.
    pub fn sync_files(&self) -> Result<()> {
        self.shared.registry.sync_all()
    }

    /// Drops every resident page of `file`.
    pub fn forget_file(&self, file: FileId) {
        let mut inner = self.shared.inner.lock();
        let victims: Vec<(PageKey, usize)> = inner
            .page_table
            .iter()
            .filter(|(key, _)| key.file == file)
            .map(|(&key, &idx)| (key, idx))
            .collect();
        for (key, idx) in victims {
            if inner.frames[idx].pin_count == 0 {
                self.shared.discard(&mut inner, idx);
            } else {
                inner.page_table.remove(&key);
                inner.frames[idx].dirty = false;
            }
        }
    }

    /// Adds a listener for background flush failures.
    pub fn register_listener(&self, listener: Arc<dyn StorageExceptionListener>) {
        self.shared.listeners.write().push(listener);
    }

    /// Fails with [`StoreError::Fatal`] once flushing failed permanently.
    pub fn health(&self) -> Result<()> {
        self.shared.health()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        let counters = &self.shared.counters;
        let (resident, dirty) = {
            let inner = self.shared.inner.lock();
            let dirty = inner
                .frames
                .iter()
                .filter(|frame| frame.key.is_some() && frame.dirty)
                .count();
            (inner.resident, dirty)
        };
        CacheStats {
            hits: counters.hits.load(AtomicOrdering::Relaxed),
            misses: counters.misses.load(AtomicOrdering::Relaxed),
            evictions: counters.evictions.load(AtomicOrdering::Relaxed),
            resident: resident as u64,
            capacity: self.shared.config.capacity as u64,
            dirty: dirty as u64,
            flushed_pages: counters.flushed_pages.load(AtomicOrdering::Relaxed),
            flush_batches: counters.flush_batches.load(AtomicOrdering::Relaxed),
            flush_errors: counters.flush_errors.load(AtomicOrdering::Relaxed),
            repaired_pages: counters.repaired_pages.load(AtomicOrdering::Relaxed),
            queued_requests: self.producer.len() as u64,
        }
    }

    /// Drains the flush queue and stops the worker. Later calls are no-ops.
    pub fn shutdown(&self) -> Result<()> {
        let Some(handle) = self.worker.lock().take() else {
            return Ok(());
        };
        self.producer.offer(FlushRequest::Shutdown);
        self.worker_thread.unpark();
        handle
            .join()
            .map_err(|_| StoreError::Fatal("flush worker panicked".into()))?;
        debug!("cache.shutdown");
        Ok(())
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "cache.shutdown_failed");
        }
    }
}
