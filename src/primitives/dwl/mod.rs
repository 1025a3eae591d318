#![forbid(unsafe_code)]
//! Double-write log: every batch of pages bound for the data files is first appended
//! here and fsynced, so a page torn by a crash mid-write can be rebuilt on restart.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::primitives::bytes::buf::Cursor;
use crate::primitives::io::{is_eof, FileIo, FileOpener};
use crate::types::{Checksum, Crc32Fast, FileId, PageKey, Result, StoreError};

const DWL_MAGIC: [u8; 4] = *b"CDWL";
const RECORD_MAGIC: [u8; 4] = *b"CDWR";
const DWL_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 32;
const RECORD_HEADER_LEN: usize = 32;
const ENTRY_HEADER_LEN: usize = 16;
const DWL_EXTENSION: &str = "dwl";

/// One page image handed to [`DoubleWriteLog::write`].
#[derive(Clone, Copy, Debug)]
pub struct DwlPage<'a> {
    /// Where the page goes in the data files.
    pub key: PageKey,
    /// Full page image.
    pub data: &'a [u8],
}

/// Counters reported by a double-write log.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DwlStats {
    /// Page images appended.
    pub pages_written: u64,
    /// Bytes appended, headers included.
    pub bytes_written: u64,
    /// Batches appended.
    pub batches: u64,
    /// fsync calls issued.
    pub syncs: u64,
    /// Segment files currently on disk.
    pub segments: u64,
    /// Pages that restore mode can serve.
    pub restorable_pages: u64,
}

/// Torn-page protection for the page cache's write-back path.
pub trait DoubleWriteLog: Send + Sync {
    /// Prepares the log for `storage_name` under `dir`. Calling it again is a no-op.
    fn open(&self, storage_name: &str, dir: &Path, page_size: usize) -> Result<()>;
    /// Appends and fsyncs a batch. Returns false when the batch is not protected and
    /// the caller writes the data files directly.
    fn write(&self, pages: &[DwlPage<'_>]) -> Result<bool>;
    /// True once the log grew past its checkpoint threshold.
    fn needs_checkpoint(&self) -> bool;
    /// Seals the active segment; everything logged so far becomes truncatable once the
    /// data files are synced.
    fn start_checkpoint(&self) -> Result<()>;
    /// Ends the checkpoint window opened by [`Self::start_checkpoint`].
    fn end_checkpoint(&self) -> Result<()>;
    /// Deletes every sealed segment.
    fn truncate(&self) -> Result<()>;
    /// Serves [`Self::load_page`] from the logged images until switched off.
    fn restore_mode_on(&self) -> Result<()>;
    /// Leaves restore mode.
    fn restore_mode_off(&self);
    /// Latest logged image of `key`, or `None` when the data file copy is trustworthy.
    fn load_page(&self, key: PageKey) -> Result<Option<Vec<u8>>>;
    /// Pages restore mode can serve, in address order.
    fn pending_pages(&self) -> Vec<PageKey>;
    /// Removes every segment after a clean shutdown.
    fn close(&self) -> Result<()>;
    /// Snapshot of the counters.
    fn stats(&self) -> DwlStats;
}

/// Log that protects nothing: writes go straight to the data files.
#[derive(Debug, Default)]
pub struct NoopDoubleWriteLog;

impl DoubleWriteLog for NoopDoubleWriteLog {
    fn open(&self, storage_name: &str, _dir: &Path, _page_size: usize) -> Result<()> {
        warn!(storage = storage_name, "dwl.disabled");
        Ok(())
    }

    fn write(&self, _pages: &[DwlPage<'_>]) -> Result<bool> {
        Ok(false)
    }

    fn needs_checkpoint(&self) -> bool {
        false
    }

    fn start_checkpoint(&self) -> Result<()> {
        Ok(())
    }

    fn end_checkpoint(&self) -> Result<()> {
        Ok(())
    }

    fn truncate(&self) -> Result<()> {
        Ok(())
    }

    fn restore_mode_on(&self) -> Result<()> {
        Ok(())
    }

    fn restore_mode_off(&self) {}

    fn load_page(&self, _key: PageKey) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn pending_pages(&self) -> Vec<PageKey> {
        Vec::new()
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> DwlStats {
        DwlStats::default()
    }
}

#[derive(Clone, Debug)]
struct SegmentHeader {
    page_size: u32,
    segment_id: u64,
}

impl SegmentHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&DWL_MAGIC);
        buf[4..6].copy_from_slice(&DWL_FORMAT_VERSION.to_be_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_be_bytes());
        buf[12..20].copy_from_slice(&self.segment_id.to_be_bytes());
        let crc = crc32(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FILE_HEADER_LEN {
            return Err(StoreError::Corruption("dwl header truncated"));
        }
        let mut cur = Cursor::new(&src[..FILE_HEADER_LEN]);
        if cur.take(4)? != DWL_MAGIC {
            return Err(StoreError::Corruption("dwl magic mismatch"));
        }
        if cur.u16()? != DWL_FORMAT_VERSION {
            return Err(StoreError::Corruption("dwl format version mismatch"));
        }
        cur.take(2)?;
        let page_size = cur.u32()?;
        let segment_id = cur.u64()?;
        cur.take(8)?;
        if cur.u32()? != crc32(&[&src[..28]]) {
            return Err(StoreError::Corruption("dwl header crc mismatch"));
        }
        Ok(Self {
            page_size,
            segment_id,
        })
    }
}

#[derive(Clone, Copy, Debug)]
struct RecordHeader {
    pages: u32,
    payload_len: u64,
    batch: u64,
    payload_crc32: u32,
}

impl RecordHeader {
    fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut buf = [0u8; RECORD_HEADER_LEN];
        buf[0..4].copy_from_slice(&RECORD_MAGIC);
        buf[4..8].copy_from_slice(&self.pages.to_be_bytes());
        buf[8..16].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[16..24].copy_from_slice(&self.batch.to_be_bytes());
        buf[24..28].copy_from_slice(&self.payload_crc32.to_be_bytes());
        let crc = crc32(&[&buf[..28]]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8; RECORD_HEADER_LEN]) -> Result<Self> {
        let mut cur = Cursor::new(src);
        if cur.take(4)? != RECORD_MAGIC {
            return Err(StoreError::Corruption("dwl record magic mismatch"));
        }
        let pages = cur.u32()?;
        let payload_len = cur.u64()?;
        let batch = cur.u64()?;
        let payload_crc32 = cur.u32()?;
        if cur.u32()? != crc32(&[&src[..28]]) {
            return Err(StoreError::Corruption("dwl record header crc mismatch"));
        }
        Ok(Self {
            pages,
            payload_len,
            batch,
            payload_crc32,
        })
    }
}

struct SegmentFile {
    path: PathBuf,
    io: Arc<dyn FileIo>,
    len: u64,
}

#[derive(Clone, Copy, Debug)]
struct LoggedPage {
    segment: u64,
    offset: u64,
    compressed_len: u32,
}

struct OpenLog {
    storage: String,
    dir: PathBuf,
    page_size: usize,
    segments: BTreeMap<u64, SegmentFile>,
    current: u64,
    next_batch: u64,
    checkpointing: bool,
    restore: Option<FxHashMap<PageKey, LoggedPage>>,
    stats: DwlStats,
}

impl OpenLog {
    fn logged_bytes(&self) -> u64 {
        self.segments
            .values()
            .map(|seg| seg.len.saturating_sub(FILE_HEADER_LEN as u64))
            .sum()
    }

    fn current_mut(&mut self) -> Result<&mut SegmentFile> {
        self.segments
            .get_mut(&self.current)
            .ok_or(StoreError::Corruption("active dwl segment missing"))
    }
}

/// Double-write log spread over numbered segment files `<storage>_<n>.dwl`.
pub struct SegmentedDoubleWriteLog {
    opener: Arc<dyn FileOpener>,
    max_segment_bytes: u64,
    checkpoint_bytes: u64,
    state: Mutex<Option<OpenLog>>,
}

impl SegmentedDoubleWriteLog {
    /// Creates an unopened log; segments rotate past `max_segment_bytes` and
    /// [`DoubleWriteLog::needs_checkpoint`] trips past `checkpoint_bytes`.
    pub fn new(opener: Arc<dyn FileOpener>, max_segment_bytes: u64, checkpoint_bytes: u64) -> Self {
        Self {
            opener,
            max_segment_bytes: max_segment_bytes.max(FILE_HEADER_LEN as u64 + 1),
            checkpoint_bytes,
            state: Mutex::new(None),
        }
    }

    fn segment_path(dir: &Path, storage: &str, id: u64) -> PathBuf {
        dir.join(format!("{storage}_{id}.{DWL_EXTENSION}"))
    }

    fn existing_segments(dir: &Path, storage: &str) -> Result<Vec<(u64, PathBuf)>> {
        let prefix = format!("{storage}_");
        let suffix = format!(".{DWL_EXTENSION}");
        let mut found = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(number) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
            else {
                continue;
            };
            if let Ok(id) = number.parse::<u64>() {
                found.push((id, entry.path()));
            }
        }
        found.sort_unstable_by_key(|(id, _)| *id);
        Ok(found)
    }

    fn create_segment(&self, log: &mut OpenLog, id: u64) -> Result<()> {
        let path = Self::segment_path(&log.dir, &log.storage, id);
        let io = self.opener.open(&path)?;
        let header = SegmentHeader {
            page_size: log.page_size as u32,
            segment_id: id,
        };
        io.truncate(0)?;
        io.write_at(0, &header.encode())?;
        io.sync_all()?;
        log.stats.syncs += 1;
        log.segments.insert(
            id,
            SegmentFile {
                path,
                io,
                len: FILE_HEADER_LEN as u64,
            },
        );
        log.current = id;
        log.stats.segments = log.segments.len() as u64;
        Ok(())
    }

    fn rotate(&self, log: &mut OpenLog) -> Result<()> {
        let next = log.current + 1;
        debug!(
            storage = %log.storage,
            sealed = log.current,
            next,
            "dwl.segment.rotate"
        );
        self.create_segment(log, next)
    }

    /// Walks every intact record of a segment, calling `visit` per logged page.
    fn scan_segment(
        segment_id: u64,
        seg: &SegmentFile,
        page_size: usize,
        mut visit: impl FnMut(PageKey, LoggedPage, u64),
    ) -> Result<()> {
        let mut hdr = [0u8; FILE_HEADER_LEN];
        match seg.io.read_at(0, &mut hdr) {
            Ok(()) => {}
            Err(err) if is_eof(&err) => return Ok(()),
            Err(err) => return Err(err),
        }
        match SegmentHeader::decode(&hdr) {
            Ok(header) if header.page_size as usize != page_size => {
                return Err(StoreError::Corruption("dwl page size mismatch"));
            }
            Ok(header) if header.segment_id != segment_id => {
                return Err(StoreError::Corruption("dwl segment id mismatch"));
            }
            Ok(_) => {}
            Err(_) => {
                warn!(path = %seg.path.display(), "dwl.segment.bad_header");
                return Ok(());
            }
        }
        let mut offset = FILE_HEADER_LEN as u64;
        loop {
            let mut rec = [0u8; RECORD_HEADER_LEN];
            match seg.io.read_at(offset, &mut rec) {
                Ok(()) => {}
                Err(err) if is_eof(&err) => break,
                Err(err) => return Err(err),
            }
            let Ok(header) = RecordHeader::decode(&rec) else {
                break;
            };
            let Ok(payload_len) = usize::try_from(header.payload_len) else {
                break;
            };
            let mut payload = vec![0u8; payload_len];
            let payload_off = offset + RECORD_HEADER_LEN as u64;
            match seg.io.read_at(payload_off, &mut payload) {
                Ok(()) => {}
                Err(err) if is_eof(&err) => break,
                Err(err) => return Err(err),
            }
            if crc32(&[&payload]) != header.payload_crc32 {
                debug!(segment = segment_id, offset, "dwl.record.torn");
                break;
            }
            let mut cur = Cursor::new(&payload);
            for _ in 0..header.pages {
                let file = FileId(cur.u32()?);
                let index = cur.u64()?;
                let compressed_len = cur.u32()?;
                let at = payload_off + cur.position() as u64;
                cur.take(compressed_len as usize)?;
                visit(
                    PageKey::new(file, index),
                    LoggedPage {
                        segment: segment_id,
                        offset: at,
                        compressed_len,
                    },
                    header.batch,
                );
            }
            offset = payload_off + header.payload_len;
        }
        Ok(())
    }

    fn build_restore_index(log: &OpenLog) -> Result<(FxHashMap<PageKey, LoggedPage>, u64)> {
        let mut index = FxHashMap::default();
        let mut last_batch = 0u64;
        for (&id, seg) in &log.segments {
            Self::scan_segment(id, seg, log.page_size, |key, at, batch| {
                index.insert(key, at);
                last_batch = last_batch.max(batch);
            })?;
        }
        Ok((index, last_batch))
    }

    fn encode_batch(pages: &[DwlPage<'_>], page_size: usize) -> Result<(u32, Vec<u8>)> {
        let count = u32::try_from(pages.len()).map_err(|_| StoreError::Invalid("dwl batch too large"))?;
        let mut encoder = snap::raw::Encoder::new();
        let mut payload = Vec::with_capacity(pages.len() * (ENTRY_HEADER_LEN + page_size / 2));
        for page in pages {
            if page.data.len() != page_size {
                return Err(StoreError::Invalid("dwl page size mismatch"));
            }
            let compressed = encoder
                .compress_vec(page.data)
                .map_err(|err| StoreError::Io(io::Error::other(err)))?;
            let compressed_len = u32::try_from(compressed.len())
                .map_err(|_| StoreError::Invalid("compressed page too large"))?;
            payload.extend_from_slice(&page.key.file.0.to_be_bytes());
            payload.extend_from_slice(&page.key.index.to_be_bytes());
            payload.extend_from_slice(&compressed_len.to_be_bytes());
            payload.extend_from_slice(&compressed);
        }
        Ok((count, payload))
    }
}

impl DoubleWriteLog for SegmentedDoubleWriteLog {
    fn open(&self, storage_name: &str, dir: &Path, page_size: usize) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(log) = state.as_ref() {
            if log.storage == storage_name && log.dir == dir && log.page_size == page_size {
                return Ok(());
            }
            return Err(StoreError::Invalid("double-write log already open"));
        }
        if page_size == 0 {
            return Err(StoreError::Invalid("dwl page size must be non-zero"));
        }
        let mut segments = BTreeMap::new();
        for (id, path) in Self::existing_segments(dir, storage_name)? {
            let io = self.opener.open(&path)?;
            let len = io.len()?;
            segments.insert(id, SegmentFile { path, io, len });
        }
        let leftovers = segments.len();
        let next_id = segments.keys().next_back().map_or(0, |id| id + 1);
        let mut log = OpenLog {
            storage: storage_name.to_owned(),
            dir: dir.to_path_buf(),
            page_size,
            segments,
            current: next_id,
            next_batch: 0,
            checkpointing: false,
            restore: None,
            stats: DwlStats::default(),
        };
        if leftovers > 0 {
            let (_, last_batch) = Self::build_restore_index(&log)?;
            log.next_batch = last_batch + 1;
        }
        self.create_segment(&mut log, next_id)?;
        info!(
            storage = storage_name,
            leftovers,
            segment = next_id,
            "dwl.open"
        );
        *state = Some(log);
        Ok(())
    }

    fn write(&self, pages: &[DwlPage<'_>]) -> Result<bool> {
        let mut state = self.state.lock();
        let log = state
            .as_mut()
            .ok_or(StoreError::Invalid("double-write log is not open"))?;
        if pages.is_empty() {
            return Ok(true);
        }
        let (count, payload) = Self::encode_batch(pages, log.page_size)?;
        let header = RecordHeader {
            pages: count,
            payload_len: payload.len() as u64,
            batch: log.next_batch,
            payload_crc32: crc32(&[&payload]),
        };
        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
        record.extend_from_slice(&header.encode());
        record.extend_from_slice(&payload);
        {
            let seg = log.current_mut()?;
            seg.io.write_at(seg.len, &record)?;
            seg.io.sync_all()?;
            seg.len += record.len() as u64;
        }
        log.next_batch += 1;
        log.stats.pages_written += u64::from(count);
        log.stats.bytes_written += record.len() as u64;
        log.stats.batches += 1;
        log.stats.syncs += 1;
        debug!(
            pages = count,
            bytes = record.len(),
            segment = log.current,
            "dwl.write"
        );
        let current_len = log.current_mut()?.len;
        if !log.checkpointing && current_len >= self.max_segment_bytes {
            self.rotate(log)?;
        }
        Ok(true)
    }

    fn needs_checkpoint(&self) -> bool {
        self.state
            .lock()
            .as_ref()
            .is_some_and(|log| log.logged_bytes() >= self.checkpoint_bytes.max(1))
    }

    fn start_checkpoint(&self) -> Result<()> {
        let mut state = self.state.lock();
        let log = state
            .as_mut()
            .ok_or(StoreError::Invalid("double-write log is not open"))?;
        if log.checkpointing {
            return Err(StoreError::Invalid("checkpoint already in progress"));
        }
        if log.current_mut()?.len > FILE_HEADER_LEN as u64 {
            self.rotate(log)?;
        }
        log.checkpointing = true;
        debug!(storage = %log.storage, segment = log.current, "dwl.checkpoint.start");
        Ok(())
    }

    fn end_checkpoint(&self) -> Result<()> {
        let mut state = self.state.lock();
        let log = state
            .as_mut()
            .ok_or(StoreError::Invalid("double-write log is not open"))?;
        log.checkpointing = false;
        debug!(storage = %log.storage, "dwl.checkpoint.end");
        Ok(())
    }

    fn truncate(&self) -> Result<()> {
        let mut state = self.state.lock();
        let log = state
            .as_mut()
            .ok_or(StoreError::Invalid("double-write log is not open"))?;
        if log.restore.is_some() {
            debug!(storage = %log.storage, "dwl.truncate.skipped_restore");
            return Ok(());
        }
        let sealed: Vec<u64> = log
            .segments
            .keys()
            .copied()
            .filter(|&id| id != log.current)
            .collect();
        for id in &sealed {
            if let Some(seg) = log.segments.remove(id) {
                drop(seg.io);
                match fs::remove_file(&seg.path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        log.stats.segments = log.segments.len() as u64;
        debug!(storage = %log.storage, removed = sealed.len(), "dwl.truncate");
        Ok(())
    }

    fn restore_mode_on(&self) -> Result<()> {
        let mut state = self.state.lock();
        let log = state
            .as_mut()
            .ok_or(StoreError::Invalid("double-write log is not open"))?;
        let (index, _) = Self::build_restore_index(log)?;
        log.stats.restorable_pages = index.len() as u64;
        info!(storage = %log.storage, pages = index.len(), "dwl.restore.on");
        log.restore = Some(index);
        Ok(())
    }

    fn restore_mode_off(&self) {
        if let Some(log) = self.state.lock().as_mut() {
            if log.restore.take().is_some() {
                log.stats.restorable_pages = 0;
                info!(storage = %log.storage, "dwl.restore.off");
            }
        }
    }

    fn load_page(&self, key: PageKey) -> Result<Option<Vec<u8>>> {
        let state = self.state.lock();
        let Some(log) = state.as_ref() else {
            return Ok(None);
        };
        let Some(at) = log.restore.as_ref().and_then(|index| index.get(&key).copied()) else {
            return Ok(None);
        };
        let seg = log
            .segments
            .get(&at.segment)
            .ok_or(StoreError::Corruption("dwl segment vanished"))?;
        let mut compressed = vec![0u8; at.compressed_len as usize];
        seg.io.read_at(at.offset, &mut compressed)?;
        let page = snap::raw::Decoder::new()
            .decompress_vec(&compressed)
            .map_err(|_| StoreError::Corruption("dwl page image undecodable"))?;
        if page.len() != log.page_size {
            return Err(StoreError::Corruption("dwl page image has wrong size"));
        }
        Ok(Some(page))
    }

    fn pending_pages(&self) -> Vec<PageKey> {
        let state = self.state.lock();
        let mut keys: Vec<PageKey> = state
            .as_ref()
            .and_then(|log| log.restore.as_ref())
            .map(|index| index.keys().copied().collect())
            .unwrap_or_default();
        keys.sort_unstable();
        keys
    }

    fn close(&self) -> Result<()> {
        let Some(log) = self.state.lock().take() else {
            return Ok(());
        };
        let count = log.segments.len();
        for (_, seg) in log.segments {
            drop(seg.io);
            match fs::remove_file(&seg.path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        info!(storage = %log.storage, removed = count, "dwl.close");
        Ok(())
    }

    fn stats(&self) -> DwlStats {
        self.state
            .lock()
            .as_ref()
            .map(|log| log.stats.clone())
            .unwrap_or_default()
    }
}

fn crc32(chunks: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}
