//! Shared on-disk page metadata: every page starts with this fixed header.

use core::convert::TryFrom;

use super::{page_crc32, PageKey, Result, StoreError};

/// Magic bytes opening every written page.
pub const PAGE_MAGIC: [u8; 4] = *b"CELP";
/// Current page format.
pub const PAGE_FORMAT_VERSION: u16 = 1;
/// Page size used when none is configured.
pub const DEFAULT_PAGE_SIZE: u32 = 8192;
/// Smallest supported page size.
pub const MIN_PAGE_SIZE: u32 = 4096;
/// Largest supported page size; in-page offsets are 16-bit.
pub const MAX_PAGE_SIZE: u32 = 32 * 1024;
/// Bytes reserved at the start of each page.
pub const PAGE_HDR_LEN: usize = 32;

pub mod header {
    //! Byte offsets for fixed header fields.
    use core::ops::Range;

    /// Magic bytes.
    pub const MAGIC: Range<usize> = 0..4;
    /// Format version.
    pub const FORMAT_VERSION: Range<usize> = 4..6;
    /// Page kind tag.
    pub const PAGE_KIND: usize = 6;
    /// Always zero.
    pub const RESERVED: usize = 7;
    /// Page size in bytes.
    pub const PAGE_SIZE: Range<usize> = 8..12;
    /// Owning file id.
    pub const FILE_ID: Range<usize> = 12..16;
    /// Page index within the file.
    pub const PAGE_INDEX: Range<usize> = 16..24;
    /// Reserved flags, always zero.
    pub const FLAGS: Range<usize> = 24..28;
    /// CRC32 of the whole page with this field zeroed.
    pub const CRC32: Range<usize> = 28..32;
}

/// What a page holds.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageKind {
    /// Content owned by a component without a dedicated kind.
    Raw = 0,
    /// Tree metadata page.
    EntryPoint = 1,
    /// Leaf bucket.
    BTreeLeaf = 2,
    /// Internal bucket.
    BTreeInternal = 3,
    /// Values stored under the null key.
    NullBucket = 4,
    /// Page on a component free list.
    Free = 5,
}

impl PageKind {
    /// Raw tag value.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PageKind {
    type Error = StoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PageKind::Raw),
            1 => Ok(PageKind::EntryPoint),
            2 => Ok(PageKind::BTreeLeaf),
            3 => Ok(PageKind::BTreeInternal),
            4 => Ok(PageKind::NullBucket),
            5 => Ok(PageKind::Free),
            _ => Err(StoreError::Corruption("unknown page kind")),
        }
    }
}

/// Decoded page header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageHeader {
    /// Format version.
    pub format_version: u16,
    /// Page kind.
    pub kind: PageKind,
    /// Page size the page was written with.
    pub page_size: u32,
    /// Address recorded on the page.
    pub key: PageKey,
    /// Stored CRC32.
    pub crc32: u32,
}

impl PageHeader {
    /// Decodes and sanity-checks the header at the start of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < PAGE_HDR_LEN {
            return Err(StoreError::Corruption("page header truncated"));
        }
        let hdr = &src[..PAGE_HDR_LEN];
        if hdr[header::MAGIC] != PAGE_MAGIC {
            return Err(StoreError::Corruption("invalid page magic"));
        }
        let format_version = u16::from_be_bytes([hdr[4], hdr[5]]);
        if format_version != PAGE_FORMAT_VERSION {
            return Err(StoreError::Corruption("unsupported page format version"));
        }
        if hdr[header::RESERVED] != 0 {
            return Err(StoreError::Corruption("page header reserved byte not zero"));
        }
        let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
        let page_size = read_u32(&hdr[header::PAGE_SIZE]);
        if (page_size as usize) < PAGE_HDR_LEN {
            return Err(StoreError::Corruption("page size smaller than header"));
        }
        let file = super::FileId(read_u32(&hdr[header::FILE_ID]));
        let index = read_u64(&hdr[header::PAGE_INDEX]);
        let crc32 = read_u32(&hdr[header::CRC32]);
        Ok(Self {
            format_version,
            kind,
            page_size,
            key: PageKey::new(file, index),
            crc32,
        })
    }
}

/// Returns true for a page that was never written (all zero bytes).
pub fn is_blank(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

/// Reads the kind tag of a page image.
pub fn kind(page: &[u8]) -> Result<PageKind> {
    PageKind::try_from(page[header::PAGE_KIND])
}

/// Tags a page image with `kind`, leaving every other byte alone.
pub fn set_kind(page: &mut [u8], kind: PageKind) {
    page[header::PAGE_KIND] = kind.as_u8();
}

/// Fills in the address fields and CRC so the image can be written to disk.
pub fn seal(page: &mut [u8], key: PageKey) -> Result<()> {
    if page.len() < PAGE_HDR_LEN {
        return Err(StoreError::Invalid("page buffer smaller than header"));
    }
    PageKind::try_from(page[header::PAGE_KIND])?;
    let page_size = u32::try_from(page.len()).map_err(|_| StoreError::Invalid("page too large"))?;
    page[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
    page[header::FORMAT_VERSION].copy_from_slice(&PAGE_FORMAT_VERSION.to_be_bytes());
    page[header::RESERVED] = 0;
    page[header::PAGE_SIZE].copy_from_slice(&page_size.to_be_bytes());
    page[header::FILE_ID].copy_from_slice(&key.file.0.to_be_bytes());
    page[header::PAGE_INDEX].copy_from_slice(&key.index.to_be_bytes());
    page[header::FLAGS].fill(0);
    let crc = page_crc32(key.file.0, key.index, page);
    page[header::CRC32].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Checks that a page read from disk belongs at `key` and is not torn.
///
/// Blank pages pass: they were allocated but never written.
pub fn verify(page: &[u8], key: PageKey, check_crc: bool) -> Result<()> {
    if is_blank(page) {
        return Ok(());
    }
    let header = PageHeader::decode(page)?;
    if header.page_size as usize != page.len() {
        return Err(StoreError::Corruption("page size mismatch"));
    }
    if header.key != key {
        return Err(StoreError::Corruption("page address mismatch"));
    }
    if check_crc && page_crc32(key.file.0, key.index, page) != header.crc32 {
        return Err(StoreError::Corruption("page crc mismatch"));
    }
    Ok(())
}

fn read_u32(src: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&src[..4]);
    u32::from_be_bytes(buf)
}

fn read_u64(src: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&src[..8]);
    u64::from_be_bytes(buf)
}
