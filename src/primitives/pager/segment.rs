#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs;
use std::io::{self as stdio, IoSlice};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::primitives::io::{FileIo, FileOpener};
use crate::types::{FileId, Result, StoreError};

/// Fixed-size page storage backing one logical file.
///
/// Page `i` lives at byte offset `i * page_size`. Pages past the end of the file
/// read as zeros, so a page can be allocated long before it is first written.
pub struct FileSegment {
    id: FileId,
    name: String,
    path: PathBuf,
    io: Arc<dyn FileIo>,
    page_size: usize,
    pages: AtomicU64,
    released: Mutex<BTreeSet<u64>>,
    free_space: Mutex<FxHashMap<u64, u32>>,
}

impl FileSegment {
    /// Opens (creating if needed) the file at `path`.
    pub fn open(
        id: FileId,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        page_size: usize,
        opener: &dyn FileOpener,
    ) -> Result<Self> {
        if page_size == 0 {
            return Err(StoreError::Invalid("page size must be non-zero"));
        }
        let path = path.into();
        let io = opener.open(&path)?;
        let len = io.len()?;
        let pages = len.div_ceil(page_size as u64);
        let name = name.into();
        debug!(file = id.0, name = %name, pages, "segment.open");
        Ok(Self {
            id,
            name,
            path,
            io,
            page_size,
            pages: AtomicU64::new(pages),
            released: Mutex::new(BTreeSet::new()),
            free_space: Mutex::new(FxHashMap::default()),
        })
    }

    /// File id.
    pub fn id(&self) -> FileId {
        self.id
    }

    /// File name relative to the storage directory.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Absolute path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages allocated so far, written or not.
    pub fn page_count(&self) -> u64 {
        self.pages.load(AtomicOrdering::Acquire)
    }

    /// Reserves a page index, preferring indices given back by [`Self::release_page`].
    pub fn allocate_page(&self) -> u64 {
        if let Some(index) = self.released.lock().pop_first() {
            return index;
        }
        self.pages.fetch_add(1, AtomicOrdering::AcqRel)
    }

    /// Returns an allocated but never committed page index for reuse.
    pub fn release_page(&self, index: u64) {
        if index < self.page_count() {
            self.released.lock().insert(index);
            self.free_space.lock().remove(&index);
        }
    }

    /// Reads page `index` into `dst`; the missing tail of a short file reads as zeros.
    pub fn read_page(&self, index: u64, dst: &mut [u8]) -> Result<()> {
        self.check_len(dst.len())?;
        let off = self.offset(index)?;
        let file_len = self.io.len()?;
        if off >= file_len {
            dst.fill(0);
            return Ok(());
        }
        let available = ((file_len - off) as usize).min(dst.len());
        self.io.read_at(off, &mut dst[..available])?;
        dst[available..].fill(0);
        Ok(())
    }

    /// Writes one full page image.
    pub fn write_page(&self, index: u64, src: &[u8]) -> Result<()> {
        self.check_len(src.len())?;
        self.io.write_at(self.offset(index)?, src)?;
        self.pages.fetch_max(index + 1, AtomicOrdering::AcqRel);
        Ok(())
    }

    /// Writes a run of consecutive pages starting at `first` with one vectored write.
    pub fn write_pages(&self, first: u64, pages: &[&[u8]]) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        for page in pages {
            self.check_len(page.len())?;
        }
        let slices: Vec<IoSlice<'_>> = pages.iter().map(|page| IoSlice::new(page)).collect();
        self.io.writev_at(self.offset(first)?, &slices)?;
        self.pages
            .fetch_max(first + pages.len() as u64, AtomicOrdering::AcqRel);
        Ok(())
    }

    /// Flushes the file to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    /// Cuts the file down to `pages` pages.
    pub fn truncate(&self, pages: u64) -> Result<()> {
        let len = pages
            .checked_mul(self.page_size as u64)
            .ok_or(StoreError::Invalid("truncate length overflow"))?;
        self.io.truncate(len)?;
        self.pages.store(pages, AtomicOrdering::Release);
        self.released.lock().retain(|&idx| idx < pages);
        self.free_space.lock().retain(|&idx, _| idx < pages);
        Ok(())
    }

    /// Removes the backing file. The segment holds no pages afterwards.
    pub fn delete(&self) -> Result<()> {
        self.pages.store(0, AtomicOrdering::Release);
        self.released.lock().clear();
        self.free_space.lock().clear();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == stdio::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Records how many bytes are still free on page `index`.
    pub fn record_free_space(&self, index: u64, bytes: u32) {
        self.free_space.lock().insert(index, bytes);
    }

    /// Last recorded free space of page `index`.
    pub fn free_space(&self, index: u64) -> Option<u32> {
        self.free_space.lock().get(&index).copied()
    }

    /// Pages known to have at least `min` free bytes, in index order.
    pub fn pages_with_free_space(&self, min: u32) -> Vec<u64> {
        let table = self.free_space.lock();
        let mut pages: Vec<u64> = table
            .iter()
            .filter(|(_, &free)| free >= min)
            .map(|(&idx, _)| idx)
            .collect();
        pages.sort_unstable();
        pages
    }

    fn offset(&self, index: u64) -> Result<u64> {
        index
            .checked_mul(self.page_size as u64)
            .ok_or(StoreError::Invalid("page offset overflow"))
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.page_size {
            return Err(StoreError::Invalid("page buffer size mismatch"));
        }
        Ok(())
    }
}
