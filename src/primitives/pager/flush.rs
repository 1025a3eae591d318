#![forbid(unsafe_code)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rand::Rng;
use rustc_hash::FxHashMap;
use tracing::{debug, error, warn};

use super::cache::CacheShared;
use super::segment::FileSegment;
use super::Synchronous;
use crate::primitives::concurrency::QueueConsumer;
use crate::primitives::dwl::DwlPage;
use crate::types::{clone_error, PageKey, Result, StoreError};

const IDLE_PARK: Duration = Duration::from_millis(50);

/// Linear backoff plus up to 50% random jitter.
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let linear = base * attempt;
    let jitter = rand::thread_rng().gen_range(0.0..=0.5);
    linear + linear.mul_f64(jitter)
}

/// A committed page image on its way to disk.
pub(crate) struct FlushPage {
    pub key: PageKey,
    pub image: Arc<[u8]>,
    pub version: u64,
}

pub(crate) enum FlushRequest {
    Batch {
        pages: Vec<FlushPage>,
        done: Option<Arc<Completion>>,
    },
    Barrier(Arc<Completion>),
    Shutdown,
}

pub(crate) struct Completion {
    result: Mutex<Option<Result<()>>>,
    cv: Condvar,
}

impl Completion {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    fn finish(&self, outcome: Result<()>) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(outcome);
            self.cv.notify_all();
        }
    }

    fn wait(&self) -> Result<()> {
        let mut guard = self.result.lock();
        loop {
            if let Some(result) = guard.as_ref() {
                return result.as_ref().map(|_| ()).map_err(clone_error);
            }
            self.cv.wait(&mut guard);
        }
    }

    fn is_done(&self) -> bool {
        self.result.lock().is_some()
    }
}

/// Handle on a batch handed to the flush worker.
pub struct FlushTicket {
    pub(crate) completion: Arc<Completion>,
}

impl FlushTicket {
    /// Blocks until the batch reached the double-write log and the data files.
    pub fn wait(&self) -> Result<()> {
        self.completion.wait()
    }

    /// True once the worker finished with the batch, successfully or not.
    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }
}

/// Body of the single flush thread: drains the queue, coalescing consecutive batches.
pub(crate) fn run_worker(shared: Arc<CacheShared>, mut rx: QueueConsumer<FlushRequest>) {
    debug!("cache.flush.worker_start");
    let mut carry: Option<FlushRequest> = None;
    loop {
        let Some(request) = carry.take().or_else(|| rx.poll()) else {
            thread::park_timeout(IDLE_PARK);
            continue;
        };
        match request {
            FlushRequest::Shutdown => break,
            FlushRequest::Barrier(done) => done.finish(shared.health()),
            FlushRequest::Batch { pages, done } => {
                let mut batch = pages;
                let mut waiters: Vec<Arc<Completion>> = done.into_iter().collect();
                while batch.len() < shared.config.flush_batch_pages {
                    match rx.poll() {
                        Some(FlushRequest::Batch { pages, done }) => {
                            batch.extend(pages);
                            waiters.extend(done);
                        }
                        Some(other) => {
                            carry = Some(other);
                            break;
                        }
                        None => break,
                    }
                }
                let outcome = shared.flush_batch(batch);
                for waiter in waiters {
                    waiter.finish(outcome.as_ref().map(|_| ()).map_err(clone_error));
                }
            }
        }
    }
    debug!("cache.flush.worker_exit");
}

impl CacheShared {
    fn flush_batch(&self, batch: Vec<FlushPage>) -> Result<()> {
        self.health()?;
        let mut latest: FxHashMap<PageKey, FlushPage> = FxHashMap::default();
        for page in batch {
            latest.insert(page.key, page);
        }
        let mut pages: Vec<FlushPage> = latest
            .into_values()
            .filter(|page| self.registry.try_segment(page.key.file).is_some())
            .collect();
        if pages.is_empty() {
            return Ok(());
        }
        pages.sort_unstable_by_key(|page| page.key);

        let retries = self.config.flush_retries;
        let mut attempt = 0u32;
        loop {
            match self.write_pages(&pages) {
                Ok(protected) => {
                    debug!(
                        pages = pages.len(),
                        protected,
                        attempt,
                        "cache.flush.batch"
                    );
                    break;
                }
                Err(err) => {
                    self.counters.record_flush_error();
                    self.notify(&err);
                    if attempt >= retries {
                        let message = format!("flush failed after {} attempts: {err}", attempt + 1);
                        error!(pages = pages.len(), error = %err, "cache.flush.fatal");
                        *self.fatal.lock() = Some(message.clone());
                        let fatal = StoreError::Fatal(message);
                        self.notify(&fatal);
                        return Err(fatal);
                    }
                    attempt += 1;
                    warn!(attempt, retries, error = %err, "cache.flush.retry");
                    thread::sleep(retry_delay(self.config.flush_retry_backoff, attempt));
                }
            }
        }
        self.mark_clean(&pages);
        self.counters.record_flush(pages.len() as u64);
        Ok(())
    }

    /// Logs the batch, then writes it to the data files in runs of consecutive pages.
    fn write_pages(&self, pages: &[FlushPage]) -> Result<bool> {
        let logged: Vec<DwlPage<'_>> = pages
            .iter()
            .map(|page| DwlPage {
                key: page.key,
                data: &page.image,
            })
            .collect();
        let protected = self.dwl.write(&logged)?;
        let mut touched: Vec<Arc<FileSegment>> = Vec::new();
        let mut start = 0usize;
        while start < pages.len() {
            let file = pages[start].key.file;
            let mut end = start + 1;
            while end < pages.len()
                && pages[end].key.file == file
                && pages[end].key.index == pages[end - 1].key.index + 1
            {
                end += 1;
            }
            let Some(segment) = self.registry.try_segment(file) else {
                start = end;
                continue;
            };
            let run: Vec<&[u8]> = pages[start..end].iter().map(|p| &p.image[..]).collect();
            segment.write_pages(pages[start].key.index, &run)?;
            if touched.last().map(|seg| seg.id()) != Some(file) {
                touched.push(segment);
            }
            start = end;
        }
        if !protected && self.config.synchronous != Synchronous::Off {
            for segment in touched {
                segment.sync()?;
            }
        }
        Ok(protected)
    }
}
