//! Bucket page layout.
//!
//! After the 32-byte page header every bucket carries its own 32-byte header,
//! then cells packed upward from there, and a slot directory of `(offset, len)`
//! pairs at the end of the page. Slots are kept in key order.
//!
//! ```text
//! 0      1      2..4   4..6        6..8  8..16  16..24  24..32
//! flags  rsvd   count  free_start  rsvd  left   right   leftmost child
//! ```
//!
//! A cell is `key_len:u16 | key | seq:u64 (multi-value trees only) | value`, where
//! the value is a record id in leaves and a child page index in internal buckets.

use std::cmp::Ordering;
use std::ops::Range;

use crate::primitives::bytes::buf::Cursor;
use crate::types::page::{self, PageKind, PAGE_HDR_LEN};
use crate::types::{Result, Rid, StoreError};

/// Length of the bucket header that follows the page header.
pub(crate) const BUCKET_HEADER_LEN: usize = 32;
/// Sibling or child pointer meaning "none".
pub(crate) const NO_PAGE: u64 = u64::MAX;
const SLOT_LEN: usize = 4;
const COUNT: Range<usize> = 2..4;
const FREE_START: Range<usize> = 4..6;
const LEFT: Range<usize> = 8..16;
const RIGHT: Range<usize> = 16..24;
const LEFTMOST: Range<usize> = 24..32;

/// Physical cell layout shared by every bucket of one tree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Layout {
    /// Cells carry an insertion sequence after the key.
    pub multi: bool,
}

impl Layout {
    fn cell_len(self, key_len: usize, leaf: bool) -> usize {
        let seq = if self.multi { 8 } else { 0 };
        let value = if leaf { Rid::ENCODED_LEN } else { 8 };
        2 + key_len + seq + value
    }

    /// Largest per-cell overhead, slot included.
    pub(crate) fn cell_overhead(self) -> usize {
        self.cell_len(0, true).max(self.cell_len(0, false)) + SLOT_LEN
    }
}

/// Payload of a cell.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CellValue {
    Rid(Rid),
    Child(u64),
}

/// Owned cell.
#[derive(Clone, Debug)]
pub(crate) struct Cell {
    pub key: Vec<u8>,
    pub seq: u64,
    pub value: CellValue,
}

impl Cell {
    pub(crate) fn rid(&self) -> Result<Rid> {
        match self.value {
            CellValue::Rid(rid) => Ok(rid),
            CellValue::Child(_) => Err(StoreError::Corruption("internal cell has no record id")),
        }
    }

    pub(crate) fn child(&self) -> Result<u64> {
        match self.value {
            CellValue::Child(child) => Ok(child),
            CellValue::Rid(_) => Err(StoreError::Corruption("leaf cell has no child")),
        }
    }
}

/// Decoded bucket, edited in memory and written back as a whole.
#[derive(Clone, Debug)]
pub(crate) struct Bucket {
    pub leaf: bool,
    pub left: Option<u64>,
    pub right: Option<u64>,
    pub leftmost: u64,
    pub cells: Vec<Cell>,
}

impl Bucket {
    pub(crate) fn leaf() -> Self {
        Self {
            leaf: true,
            left: None,
            right: None,
            leftmost: NO_PAGE,
            cells: Vec::new(),
        }
    }

    pub(crate) fn internal(leftmost: u64, cells: Vec<Cell>) -> Self {
        Self {
            leaf: false,
            left: None,
            right: None,
            leftmost,
            cells,
        }
    }

    pub(crate) fn decode(page: &[u8], layout: Layout) -> Result<Self> {
        let view = BucketView::parse(page, layout)?;
        let mut cells = Vec::with_capacity(view.len());
        for idx in 0..view.len() {
            let cell = view.cell(idx)?;
            cells.push(Cell {
                key: cell.key.to_vec(),
                seq: cell.seq,
                value: cell.value,
            });
        }
        Ok(Self {
            leaf: view.is_leaf(),
            left: view.left(),
            right: view.right(),
            leftmost: view.leftmost(),
            cells,
        })
    }

    /// Bytes the bucket occupies after the page header.
    pub(crate) fn encoded_len(&self, layout: Layout) -> usize {
        BUCKET_HEADER_LEN
            + self
                .cells
                .iter()
                .map(|cell| layout.cell_len(cell.key.len(), self.leaf) + SLOT_LEN)
                .sum::<usize>()
    }

    /// Child followed for child index `idx`: 0 is the leftmost child, `i` the child
    /// of separator `i - 1`.
    pub(crate) fn child(&self, idx: usize) -> Result<u64> {
        match idx {
            0 => Ok(self.leftmost),
            _ => self
                .cells
                .get(idx - 1)
                .ok_or(StoreError::Corruption("child index out of range"))?
                .child(),
        }
    }

    /// Rewrites `page` with this bucket; fails when it does not fit.
    pub(crate) fn encode_into(&self, page: &mut [u8], layout: Layout) -> Result<()> {
        if self.encoded_len(layout) > page.len().saturating_sub(PAGE_HDR_LEN) {
            return Err(StoreError::Invalid("bucket overflows page"));
        }
        let count =
            u16::try_from(self.cells.len()).map_err(|_| StoreError::Invalid("too many cells"))?;
        page::set_kind(
            page,
            if self.leaf {
                PageKind::BTreeLeaf
            } else {
                PageKind::BTreeInternal
            },
        );
        let payload = &mut page[PAGE_HDR_LEN..];
        payload.fill(0);
        payload[COUNT].copy_from_slice(&count.to_be_bytes());
        payload[LEFT].copy_from_slice(&self.left.unwrap_or(NO_PAGE).to_be_bytes());
        payload[RIGHT].copy_from_slice(&self.right.unwrap_or(NO_PAGE).to_be_bytes());
        payload[LEFTMOST].copy_from_slice(&self.leftmost.to_be_bytes());
        let slot_base = payload.len() - self.cells.len() * SLOT_LEN;
        let mut off = BUCKET_HEADER_LEN;
        for (idx, cell) in self.cells.iter().enumerate() {
            let start = off;
            let key_len = u16::try_from(cell.key.len())
                .map_err(|_| StoreError::Invalid("key too long for a bucket"))?;
            payload[off..off + 2].copy_from_slice(&key_len.to_be_bytes());
            off += 2;
            payload[off..off + cell.key.len()].copy_from_slice(&cell.key);
            off += cell.key.len();
            if layout.multi {
                payload[off..off + 8].copy_from_slice(&cell.seq.to_be_bytes());
                off += 8;
            }
            match cell.value {
                CellValue::Rid(rid) if self.leaf => {
                    rid.encode_into(&mut payload[off..off + Rid::ENCODED_LEN]);
                    off += Rid::ENCODED_LEN;
                }
                CellValue::Child(child) if !self.leaf => {
                    payload[off..off + 8].copy_from_slice(&child.to_be_bytes());
                    off += 8;
                }
                _ => return Err(StoreError::Invalid("cell kind does not match bucket kind")),
            }
            let slot = slot_base + idx * SLOT_LEN;
            payload[slot..slot + 2].copy_from_slice(&(start as u16).to_be_bytes());
            payload[slot + 2..slot + 4].copy_from_slice(&((off - start) as u16).to_be_bytes());
        }
        payload[FREE_START].copy_from_slice(&(off as u16).to_be_bytes());
        Ok(())
    }

    /// Splits an overflowing bucket roughly in half by bytes.
    ///
    /// Returns the right half and its separator. A leaf separator is a copy of the
    /// right half's first key; an internal split moves the middle cell up and hands
    /// its child to the right half as leftmost child.
    pub(crate) fn split_off(&mut self, layout: Layout) -> Result<(Bucket, Vec<u8>, u64)> {
        let min_cells = if self.leaf { 2 } else { 3 };
        if self.cells.len() < min_cells {
            return Err(StoreError::Corruption("bucket too small to split"));
        }
        let total = self.encoded_len(layout) - BUCKET_HEADER_LEN;
        let mut acc = 0usize;
        let mut mid = 0usize;
        for cell in &self.cells {
            acc += layout.cell_len(cell.key.len(), self.leaf) + SLOT_LEN;
            mid += 1;
            if acc * 2 >= total {
                break;
            }
        }
        let upper = if self.leaf {
            self.cells.len() - 1
        } else {
            self.cells.len() - 2
        };
        let mid = mid.clamp(1, upper);
        let mut tail = self.cells.split_off(mid);
        if self.leaf {
            let sep = (tail[0].key.clone(), tail[0].seq);
            let right = Bucket {
                leaf: true,
                left: None,
                right: None,
                leftmost: NO_PAGE,
                cells: tail,
            };
            Ok((right, sep.0, sep.1))
        } else {
            let middle = tail.remove(0);
            let right = Bucket::internal(middle.child()?, tail);
            Ok((right, middle.key, middle.seq))
        }
    }
}

/// Read-only view of a cell.
pub(crate) struct CellRef<'a> {
    pub key: &'a [u8],
    pub seq: u64,
    pub value: CellValue,
}

/// Zero-copy reader over a bucket page.
pub(crate) struct BucketView<'a> {
    payload: &'a [u8],
    layout: Layout,
    leaf: bool,
    count: usize,
}

impl<'a> BucketView<'a> {
    pub(crate) fn parse(page: &'a [u8], layout: Layout) -> Result<Self> {
        let leaf = match page::kind(page)? {
            PageKind::BTreeLeaf => true,
            PageKind::BTreeInternal => false,
            _ => return Err(StoreError::Corruption("page is not a bucket")),
        };
        let payload = &page[PAGE_HDR_LEN..];
        let count = u16::from_be_bytes([payload[COUNT.start], payload[COUNT.start + 1]]) as usize;
        let free_start =
            u16::from_be_bytes([payload[FREE_START.start], payload[FREE_START.start + 1]]) as usize;
        if free_start < BUCKET_HEADER_LEN || free_start + count * SLOT_LEN > payload.len() {
            return Err(StoreError::Corruption("bucket free space pointers out of range"));
        }
        Ok(Self {
            payload,
            layout,
            leaf,
            count,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.leaf
    }

    fn pointer(&self, range: Range<usize>) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.payload[range]);
        u64::from_be_bytes(buf)
    }

    pub(crate) fn left(&self) -> Option<u64> {
        Some(self.pointer(LEFT)).filter(|&p| p != NO_PAGE)
    }

    pub(crate) fn right(&self) -> Option<u64> {
        Some(self.pointer(RIGHT)).filter(|&p| p != NO_PAGE)
    }

    pub(crate) fn leftmost(&self) -> u64 {
        self.pointer(LEFTMOST)
    }

    fn cell_bytes(&self, idx: usize) -> Result<&'a [u8]> {
        if idx >= self.count {
            return Err(StoreError::Corruption("slot index out of range"));
        }
        let slot = self.payload.len() - (self.count - idx) * SLOT_LEN;
        let off = u16::from_be_bytes([self.payload[slot], self.payload[slot + 1]]) as usize;
        let len = u16::from_be_bytes([self.payload[slot + 2], self.payload[slot + 3]]) as usize;
        self.payload
            .get(off..off + len)
            .filter(|_| off >= BUCKET_HEADER_LEN)
            .ok_or(StoreError::Corruption("cell outside bucket"))
    }

    pub(crate) fn cell(&self, idx: usize) -> Result<CellRef<'a>> {
        let mut cur = Cursor::new(self.cell_bytes(idx)?);
        let key_len = cur.u16()? as usize;
        let key = cur.take(key_len)?;
        let seq = if self.layout.multi { cur.u64()? } else { 0 };
        let value = if self.leaf {
            CellValue::Rid(Rid::decode(cur.take(Rid::ENCODED_LEN)?)?)
        } else {
            CellValue::Child(cur.u64()?)
        };
        if cur.remaining() != 0 {
            return Err(StoreError::Corruption("cell length mismatch"));
        }
        Ok(CellRef { key, seq, value })
    }

    pub(crate) fn key(&self, idx: usize) -> Result<(&'a [u8], u64)> {
        let cell = self.cell(idx)?;
        Ok((cell.key, cell.seq))
    }

    pub(crate) fn child(&self, idx: usize) -> Result<u64> {
        match idx {
            0 => Ok(self.leftmost()),
            _ => match self.cell(idx - 1)?.value {
                CellValue::Child(child) => Ok(child),
                CellValue::Rid(_) => Err(StoreError::Corruption("leaf cell has no child")),
            },
        }
    }

    /// First slot whose cell orders at or after the target (`strict`: after).
    pub(crate) fn seek(
        &self,
        mut order: impl FnMut(&[u8], u64) -> Result<Ordering>,
        strict: bool,
    ) -> Result<usize> {
        let (mut lo, mut hi) = (0usize, self.count);
        while lo < hi {
            let mid = (lo + hi) / 2;
            let (key, seq) = self.key(mid)?;
            let ord = order(key, seq)?;
            let before = match ord {
                Ordering::Less => true,
                Ordering::Equal => strict,
                Ordering::Greater => false,
            };
            if before {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }
}

/// Overwrites the record id of leaf cell `idx` in place.
pub(crate) fn set_leaf_rid(page: &mut [u8], layout: Layout, idx: usize, rid: Rid) -> Result<()> {
    let range = {
        let view = BucketView::parse(page, layout)?;
        if !view.is_leaf() {
            return Err(StoreError::Corruption("in-place update on internal bucket"));
        }
        let cell = view.cell_bytes(idx)?;
        let start = cell.as_ptr() as usize - page.as_ptr() as usize;
        start + cell.len() - Rid::ENCODED_LEN..start + cell.len()
    };
    rid.encode_into(&mut page[range]);
    Ok(())
}
