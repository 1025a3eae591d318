//! Values stored under the null key.
//!
//! The null file is a chain of pages starting at page 0. Each page holds a count,
//! the next page of the chain (0 ends it), then packed record ids. Page 0 also
//! records the tail of the chain, where new values are appended.

use crate::storage::atomic::AtomicOperation;
use crate::storage::component::DurableComponent;
use crate::types::page::{self, PageKind, PAGE_HDR_LEN};
use crate::types::{FileId, PageKey, Result, Rid, StoreError};

const COUNT: usize = 0;
const NEXT: usize = 4;
const TAIL: usize = 12;
const HEADER: usize = 20;

fn capacity(page_size: usize) -> usize {
    (page_size - PAGE_HDR_LEN - HEADER) / Rid::ENCODED_LEN
}

fn read_u64(src: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&src[at..at + 8]);
    u64::from_be_bytes(buf)
}

#[derive(Debug, Default)]
struct NullPage {
    rids: Vec<Rid>,
    next: u64,
    tail: u64,
}

impl NullPage {
    fn decode(page: &[u8]) -> Result<Self> {
        if page::kind(page)? != PageKind::NullBucket {
            return Err(StoreError::Corruption("page is not a null bucket"));
        }
        let p = &page[PAGE_HDR_LEN..];
        let count = u32::from_be_bytes([p[COUNT], p[COUNT + 1], p[COUNT + 2], p[COUNT + 3]]) as usize;
        if count > capacity(page.len()) {
            return Err(StoreError::Corruption("null bucket count out of range"));
        }
        let mut rids = Vec::with_capacity(count);
        for idx in 0..count {
            let at = HEADER + idx * Rid::ENCODED_LEN;
            rids.push(Rid::decode(&p[at..at + Rid::ENCODED_LEN])?);
        }
        Ok(Self {
            rids,
            next: read_u64(p, NEXT),
            tail: read_u64(p, TAIL),
        })
    }

    fn encode_into(&self, page: &mut [u8]) {
        page::set_kind(page, PageKind::NullBucket);
        let p = &mut page[PAGE_HDR_LEN..];
        p.fill(0);
        p[COUNT..COUNT + 4].copy_from_slice(&(self.rids.len() as u32).to_be_bytes());
        p[NEXT..NEXT + 8].copy_from_slice(&self.next.to_be_bytes());
        p[TAIL..TAIL + 8].copy_from_slice(&self.tail.to_be_bytes());
        for (idx, rid) in self.rids.iter().enumerate() {
            let at = HEADER + idx * Rid::ENCODED_LEN;
            rid.encode_into(&mut p[at..at + Rid::ENCODED_LEN]);
        }
    }
}

fn load(component: &DurableComponent, op: Option<&AtomicOperation<'_>>, key: PageKey) -> Result<NullPage> {
    component
        .load_page_for_read(op, key, NullPage::decode)
        .map_err(|err| match err {
            StoreError::Corruption(reason) => component.structure_error(key, reason),
            other => other,
        })
}

fn store(component: &DurableComponent, op: &mut AtomicOperation<'_>, key: PageKey, page: &NullPage) -> Result<()> {
    page.encode_into(component.load_page_for_write(op, key)?);
    Ok(())
}

/// Writes an empty head page into a freshly created null file.
pub(crate) fn init(component: &DurableComponent, op: &mut AtomicOperation<'_>, file: FileId) -> Result<()> {
    let index = component.add_page(op, file)?;
    store(component, op, PageKey::new(file, index), &NullPage::default())
}

/// Every record id stored under the null key, in insertion order.
pub(crate) fn read_all(
    component: &DurableComponent,
    op: Option<&AtomicOperation<'_>>,
    file: FileId,
) -> Result<Vec<Rid>> {
    let mut rids = Vec::new();
    let mut index = 0u64;
    for _ in 0..component.page_count(file)? {
        let mut page = load(component, op, PageKey::new(file, index))?;
        rids.append(&mut page.rids);
        if page.next == 0 {
            return Ok(rids);
        }
        index = page.next;
    }
    Err(component.structure_error(PageKey::new(file, index), "null bucket chain has a cycle"))
}

/// First record id of the head page; the only one a single-value tree keeps.
pub(crate) fn first(
    component: &DurableComponent,
    op: Option<&AtomicOperation<'_>>,
    file: FileId,
) -> Result<Option<Rid>> {
    Ok(load(component, op, PageKey::new(file, 0))?.rids.first().copied())
}

/// Makes `value` the sole content of the head page.
pub(crate) fn replace_head(
    component: &DurableComponent,
    op: &mut AtomicOperation<'_>,
    file: FileId,
    value: Option<Rid>,
) -> Result<()> {
    let key = PageKey::new(file, 0);
    let mut head = load(component, Some(&*op), key)?;
    head.rids = value.into_iter().collect();
    store(component, op, key, &head)
}

/// Appends `rid` to the tail of the chain and returns the page that took it.
pub(crate) fn append(
    component: &DurableComponent,
    op: &mut AtomicOperation<'_>,
    file: FileId,
    rid: Rid,
) -> Result<u64> {
    let per_page = capacity(component.cache().page_size());
    let head_key = PageKey::new(file, 0);
    let tail_index = load(component, Some(&*op), head_key)?.tail;
    let tail_key = PageKey::new(file, tail_index);
    let mut tail = load(component, Some(&*op), tail_key)?;
    if tail.rids.len() < per_page {
        tail.rids.push(rid);
        store(component, op, tail_key, &tail)?;
        return Ok(tail_index);
    }

    // Pages past the tail are left empty by `clear` and are refilled first.
    let (next_index, mut next) = if tail.next == 0 {
        let fresh = component.add_page(op, file)?;
        tail.next = fresh;
        store(component, op, tail_key, &tail)?;
        (fresh, NullPage::default())
    } else {
        let next = load(component, Some(&*op), PageKey::new(file, tail.next))?;
        (tail.next, next)
    };
    if next.rids.len() >= per_page {
        return Err(component.structure_error(PageKey::new(file, next_index), "null bucket past the tail is full"));
    }
    next.rids.push(rid);
    store(component, op, PageKey::new(file, next_index), &next)?;

    let mut head = load(component, Some(&*op), head_key)?;
    head.tail = next_index;
    store(component, op, head_key, &head)?;
    Ok(next_index)
}

/// Removes `rid` from page `index`, keeping the order of the rest.
pub(crate) fn remove_from(
    component: &DurableComponent,
    op: &mut AtomicOperation<'_>,
    file: FileId,
    index: u64,
    rid: Rid,
) -> Result<bool> {
    let key = PageKey::new(file, index);
    let mut page = load(component, Some(&*op), key)?;
    let Some(at) = page.rids.iter().position(|stored| *stored == rid) else {
        return Ok(false);
    };
    page.rids.remove(at);
    store(component, op, key, &page)?;
    Ok(true)
}

/// Empties every page of the chain and returns what was stored.
///
/// The pages stay linked so later appends reuse them.
pub(crate) fn clear(component: &DurableComponent, op: &mut AtomicOperation<'_>, file: FileId) -> Result<Vec<Rid>> {
    let mut removed = Vec::new();
    let mut index = 0u64;
    for _ in 0..component.page_count(file)? {
        let key = PageKey::new(file, index);
        let mut page = load(component, Some(&*op), key)?;
        let next = page.next;
        if !page.rids.is_empty() || page.tail != 0 {
            removed.append(&mut page.rids);
            page.tail = 0;
            store(component, op, key, &page)?;
        }
        if next == 0 {
            return Ok(removed);
        }
        index = next;
    }
    Err(component.structure_error(PageKey::new(file, index), "null bucket chain has a cycle"))
}
