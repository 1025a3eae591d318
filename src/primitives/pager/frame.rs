use parking_lot::RwLock;
use std::sync::Arc;

use crate::types::PageKey;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameState {
    Hot,
    Cold,
    Test,
}

/// One cache slot. Bookkeeping fields are guarded by the cache mutex, the page bytes
/// by the per-frame lock.
pub struct Frame {
    pub key: Option<PageKey>,
    pub buf: Arc<RwLock<Box<[u8]>>>,
    pub state: FrameState,
    pub reference: bool,
    /// Holds a committed image the flush worker has not written yet.
    pub dirty: bool,
    /// Bumped on every committed image; the flush worker clears `dirty` only when the
    /// version it wrote is still current.
    pub version: u64,
    pub pin_count: u32,
    /// A miss is reading the page from disk; the loader holds the frame write lock.
    pub loading: bool,
}

impl Frame {
    pub fn empty() -> Self {
        Self {
            key: None,
            buf: Arc::new(RwLock::new(Box::default())),
            state: FrameState::Test,
            reference: false,
            dirty: false,
            version: 0,
            pin_count: 0,
            loading: false,
        }
    }

    pub fn is_evictable(&self) -> bool {
        self.key.is_some() && self.pin_count == 0 && !self.dirty && !self.loading
    }

    /// Makes sure the buffer holds a full page; buffers of retired frames are dropped.
    pub fn ensure_buffer(&mut self, page_size: usize) {
        if self.buf.read().len() != page_size {
            self.buf = Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice()));
        }
    }

    pub fn release_buffer(&mut self) {
        self.buf = Arc::new(RwLock::new(Box::default()));
    }

    pub fn reset(&mut self) {
        self.key = None;
        self.reference = false;
        self.dirty = false;
        self.pin_count = 0;
        self.loading = false;
    }
}
