//! Page 0 of every tree data file.

use crate::types::page::{self, PageKind, PAGE_HDR_LEN};
use crate::types::{Result, StoreError};

const FORMAT_VERSION: u8 = 1;
const SIZE: usize = 0;
const FREE_HEAD: usize = 8;
const NEXT_SEQ: usize = 16;
const CARDINALITY: usize = 24;
const KEY_TYPE: usize = 25;
const VERSION: usize = 26;
const MAX_KEY: usize = 28;
const NULL_COUNT: usize = 32;

/// Tree metadata persisted on page 0.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct EntryPoint {
    /// Non-null entries.
    pub size: u64,
    /// First page of the free list; 0 when empty.
    pub free_head: u64,
    /// Next insertion sequence handed to a multi-value entry.
    pub next_seq: u64,
    pub multi: bool,
    pub key_type: u8,
    pub max_key_size: u16,
    /// Values stored under the null key.
    pub null_count: u64,
}

impl EntryPoint {
    pub(crate) fn decode(page: &[u8]) -> Result<Self> {
        if page::kind(page)? != PageKind::EntryPoint {
            return Err(StoreError::Corruption("page 0 is not a tree entry point"));
        }
        let p = &page[PAGE_HDR_LEN..];
        if p[VERSION] != FORMAT_VERSION {
            return Err(StoreError::Corruption("unsupported tree format version"));
        }
        let multi = match p[CARDINALITY] {
            0 => false,
            1 => true,
            _ => return Err(StoreError::Corruption("unknown tree cardinality")),
        };
        Ok(Self {
            size: read_u64(p, SIZE),
            free_head: read_u64(p, FREE_HEAD),
            next_seq: read_u64(p, NEXT_SEQ),
            multi,
            key_type: p[KEY_TYPE],
            max_key_size: u16::from_be_bytes([p[MAX_KEY], p[MAX_KEY + 1]]),
            null_count: read_u64(p, NULL_COUNT),
        })
    }

    pub(crate) fn encode_into(&self, page: &mut [u8]) {
        page::set_kind(page, PageKind::EntryPoint);
        let p = &mut page[PAGE_HDR_LEN..];
        p.fill(0);
        p[SIZE..SIZE + 8].copy_from_slice(&self.size.to_be_bytes());
        p[FREE_HEAD..FREE_HEAD + 8].copy_from_slice(&self.free_head.to_be_bytes());
        p[NEXT_SEQ..NEXT_SEQ + 8].copy_from_slice(&self.next_seq.to_be_bytes());
        p[CARDINALITY] = u8::from(self.multi);
        p[KEY_TYPE] = self.key_type;
        p[VERSION] = FORMAT_VERSION;
        p[MAX_KEY..MAX_KEY + 2].copy_from_slice(&self.max_key_size.to_be_bytes());
        p[NULL_COUNT..NULL_COUNT + 8].copy_from_slice(&self.null_count.to_be_bytes());
    }
}

fn read_u64(src: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&src[at..at + 8]);
    u64::from_be_bytes(buf)
}

/// Next pointer of a page on the free list.
pub(crate) fn free_next(page: &[u8]) -> Result<u64> {
    if page::kind(page)? != PageKind::Free {
        return Err(StoreError::Corruption("free list points at a live page"));
    }
    Ok(read_u64(&page[PAGE_HDR_LEN..], 0))
}

/// Turns `page` into a free-list node pointing at `next`.
pub(crate) fn mark_free(page: &mut [u8], next: u64) {
    page::set_kind(page, PageKind::Free);
    let p = &mut page[PAGE_HDR_LEN..];
    p.fill(0);
    p[..8].copy_from_slice(&next.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_point_roundtrip() {
        let entry = EntryPoint {
            size: 12,
            free_head: 7,
            next_seq: 99,
            multi: true,
            key_type: 6,
            max_key_size: 900,
            null_count: 4,
        };
        let mut page = vec![0u8; 4096];
        entry.encode_into(&mut page);
        assert_eq!(EntryPoint::decode(&page).unwrap(), entry);
    }

    #[test]
    fn free_list_node_is_not_an_entry_point() {
        let mut page = vec![0u8; 4096];
        mark_free(&mut page, 3);
        assert_eq!(free_next(&page).unwrap(), 3);
        assert!(EntryPoint::decode(&page).is_err());
    }
}
