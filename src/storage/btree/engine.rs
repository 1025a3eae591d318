//! Page-level engine shared by the typed trees.
//!
//! Entries are ordered by `(key, seq)`. Single-value trees always store seq 0, so
//! the pair collapses to the key; multi-value trees stamp every entry with a
//! per-tree insertion counter, keeping values of one key in insertion order.
//!
//! Page 0 of the data file is the [`EntryPoint`]; the root bucket never moves off
//! page 1. A root split copies both halves out to fresh pages and turns page 1
//! into an internal bucket, and a root left with a single child absorbs it.
//!
//! Multi-value trees keep a companion single-value tree (`<name>.pairs.cbt`) keyed
//! by record id plus key. It answers "is this pair stored, and at which seq" with
//! one descent, and locates null-key values inside the null chain.

use std::cmp::Ordering;
use std::ops::Bound;

use parking_lot::RwLockReadGuard;
use tracing::debug;

use super::bucket::{set_leaf_rid, Bucket, BucketView, Cell, CellValue, Layout, BUCKET_HEADER_LEN};
use super::entry_point::{self, EntryPoint};
use super::null_bucket;
use super::stats::{BTreeCounters, BTreeStats, TreeShape};
use super::{PutOutcome, Validation};
use crate::storage::atomic::{AtomicOperation, AtomicOperationsManager};
use crate::storage::component::DurableComponent;
use crate::storage::options::BTreeOptions;
use crate::types::page::PAGE_HDR_LEN;
use crate::types::{FileId, PageKey, Result, Rid, StoreError};

pub(crate) const ENTRY_PAGE: u64 = 0;
pub(crate) const ROOT_PAGE: u64 = 1;
pub(crate) const DATA_EXTENSION: &str = "cbt";
pub(crate) const NULL_EXTENSION: &str = "nbt";
const MAX_DEPTH: usize = 64;
const PAIR_SUFFIX: &str = "pairs";
const PAIR_KEY_TYPE: u8 = 0xF0;
/// Tag byte and record id written ahead of the key in a pair index entry.
const PAIR_PREFIX: usize = 1 + Rid::ENCODED_LEN;

pub(crate) type CompareFn = fn(&[u8], &[u8]) -> Result<Ordering>;

/// Static description of a tree flavour.
#[derive(Clone, Copy)]
pub(crate) struct TreeKind {
    pub multi: bool,
    pub key_type: u8,
    pub compare: CompareFn,
}

/// Entry count as the signed size the public tree API reports.
pub(crate) fn signed_size(size: u64) -> Result<i64> {
    i64::try_from(size).map_err(|_| StoreError::Corruption("tree size exceeds i64"))
}

fn compare_raw(a: &[u8], b: &[u8]) -> Result<Ordering> {
    Ok(a.cmp(b))
}

const PAIR_KIND: TreeKind = TreeKind {
    multi: false,
    key_type: PAIR_KEY_TYPE,
    compare: compare_raw,
};

fn pair_name(name: &str) -> String {
    format!("{name}.{PAIR_SUFFIX}")
}

/// Pair index key of `(key, rid)`; `None` is the null key. The fixed-width record
/// id goes first so two pairs never share an encoding.
fn pair_key(key: Option<&[u8]>, rid: Rid) -> Vec<u8> {
    let mut out = vec![0u8; PAIR_PREFIX + key.map_or(0, <[u8]>::len)];
    out[0] = u8::from(key.is_some());
    rid.encode_into(&mut out[1..PAIR_PREFIX]);
    if let Some(key) = key {
        out[PAIR_PREFIX..].copy_from_slice(key);
    }
    out
}

/// Pair index values carry a seq or a null chain page in the position field.
fn locator(value: u64) -> Rid {
    Rid::new(0, value as i64)
}

fn unlocate(rid: Rid) -> u64 {
    rid.cluster_position as u64
}

struct PathStep {
    page: u64,
    child: usize,
}

/// Entry copied out of a leaf.
#[derive(Clone, Debug)]
pub(crate) struct RawEntry {
    pub key: Vec<u8>,
    pub seq: u64,
    pub rid: Rid,
}

/// Bounds and direction of a range scan over serialized keys.
#[derive(Clone, Debug)]
pub(crate) struct ScanRange {
    pub lower: Bound<Vec<u8>>,
    pub upper: Bound<Vec<u8>>,
    pub ascending: bool,
}

impl ScanRange {
    pub(crate) fn all(ascending: bool) -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
            ascending,
        }
    }
}

enum Step {
    Stop { exhausted: bool },
    Next(Option<u64>),
}

pub(crate) struct TreeEngine {
    component: DurableComponent,
    file: FileId,
    null_file: Option<FileId>,
    pairs: Option<Box<TreeEngine>>,
    layout: Layout,
    kind: TreeKind,
    max_key_size: usize,
    min_fill_percent: usize,
    counters: BTreeCounters,
}

impl TreeEngine {
    fn capacity(page_size: usize) -> usize {
        page_size - PAGE_HDR_LEN
    }

    fn key_limit(page_size: usize, layout: Layout) -> usize {
        (Self::capacity(page_size) - BUCKET_HEADER_LEN) / 4 - layout.cell_overhead()
    }

    pub(crate) fn create(
        op: &mut AtomicOperation<'_>,
        name: &str,
        options: &BTreeOptions,
        kind: TreeKind,
    ) -> Result<Self> {
        if options.encryption.is_some() {
            return Err(StoreError::Invalid("encryption is not supported"));
        }
        let page_size = op.manager().cache().page_size();
        let mut max_key_size = options
            .max_key_size
            .min(Self::key_limit(page_size, Layout { multi: kind.multi }))
            .min(u16::MAX as usize);
        if !kind.multi {
            return Self::create_files(op, name, options, kind, max_key_size, true);
        }
        max_key_size = max_key_size.min(Self::key_limit(page_size, Layout { multi: false }) - PAIR_PREFIX);
        let mut engine = Self::create_files(op, name, options, kind, max_key_size, true)?;
        let pairs = Self::create_files(op, &pair_name(name), options, PAIR_KIND, max_key_size + PAIR_PREFIX, false)?;
        engine.pairs = Some(Box::new(pairs));
        Ok(engine)
    }

    fn create_files(
        op: &mut AtomicOperation<'_>,
        name: &str,
        options: &BTreeOptions,
        kind: TreeKind,
        max_key_size: usize,
        with_nulls: bool,
    ) -> Result<Self> {
        let component = DurableComponent::new(op.manager(), name, DATA_EXTENSION);
        let layout = Layout { multi: kind.multi };
        let entry = EntryPoint {
            size: 0,
            free_head: 0,
            next_seq: 0,
            multi: kind.multi,
            key_type: kind.key_type,
            max_key_size: max_key_size as u16,
            null_count: 0,
        };
        let (file, null_file) = component.execute_inside_component_operation(op, |op| {
            let file = component.add_file(op, &component.full_name())?;
            let null_file = if with_nulls {
                let null_file = component.add_file(op, &format!("{name}.{NULL_EXTENSION}"))?;
                null_bucket::init(&component, op, null_file)?;
                Some(null_file)
            } else {
                None
            };
            let entry_page = component.add_page(op, file)?;
            let root_page = component.add_page(op, file)?;
            if (entry_page, root_page) != (ENTRY_PAGE, ROOT_PAGE) {
                return Err(component.structure_error(
                    PageKey::new(file, entry_page),
                    "fresh tree file is not empty",
                ));
            }
            entry.encode_into(component.load_page_for_write(op, PageKey::new(file, ENTRY_PAGE))?);
            Bucket::leaf().encode_into(
                component.load_page_for_write(op, PageKey::new(file, ROOT_PAGE))?,
                layout,
            )?;
            Ok((file, null_file))
        })?;
        debug!(tree = name, multi = kind.multi, max_key_size, "btree.create");
        Ok(Self::assemble(component, file, null_file, options, kind, max_key_size))
    }

    pub(crate) fn load(
        manager: &AtomicOperationsManager,
        name: &str,
        options: &BTreeOptions,
        kind: TreeKind,
    ) -> Result<Self> {
        let mut engine = Self::open_files(manager, name, options, kind, true)?;
        if kind.multi {
            let pairs = Self::open_files(manager, &pair_name(name), options, PAIR_KIND, false)?;
            engine.pairs = Some(Box::new(pairs));
        }
        Ok(engine)
    }

    fn open_files(
        manager: &AtomicOperationsManager,
        name: &str,
        options: &BTreeOptions,
        kind: TreeKind,
        with_nulls: bool,
    ) -> Result<Self> {
        let component = DurableComponent::new(manager, name, DATA_EXTENSION);
        let file = component
            .open_file(&component.full_name())
            .ok_or(StoreError::Invalid("tree does not exist"))?;
        let null_file = if with_nulls {
            let null_file = component
                .open_file(&format!("{name}.{NULL_EXTENSION}"))
                .ok_or(StoreError::Invalid("tree null file is missing"))?;
            Some(null_file)
        } else {
            None
        };
        let entry = {
            let _visible = component.shared_lock();
            let key = PageKey::new(file, ENTRY_PAGE);
            component
                .load_page_for_read(None, key, EntryPoint::decode)
                .map_err(|err| match err {
                    StoreError::Corruption(reason) => component.structure_error(key, reason),
                    other => other,
                })?
        };
        if entry.key_type != kind.key_type {
            return Err(StoreError::Invalid("tree was created with another key type"));
        }
        if entry.multi != kind.multi {
            return Err(StoreError::Invalid("tree was created with another cardinality"));
        }
        debug!(tree = name, size = entry.size, "btree.load");
        Ok(Self::assemble(
            component,
            file,
            null_file,
            options,
            kind,
            entry.max_key_size as usize,
        ))
    }

    fn assemble(
        component: DurableComponent,
        file: FileId,
        null_file: Option<FileId>,
        options: &BTreeOptions,
        kind: TreeKind,
        max_key_size: usize,
    ) -> Self {
        Self {
            component,
            file,
            null_file,
            pairs: None,
            layout: Layout { multi: kind.multi },
            kind,
            max_key_size,
            min_fill_percent: usize::from(options.min_fill_percent.clamp(1, 45)),
            counters: BTreeCounters::default(),
        }
    }

    pub(crate) fn component(&self) -> &DurableComponent {
        &self.component
    }

    pub(crate) fn name(&self) -> &str {
        self.component.name()
    }

    pub(crate) fn max_key_size(&self) -> usize {
        self.max_key_size
    }

    pub(crate) fn stats(&self) -> BTreeStats {
        self.counters.snapshot()
    }

    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > self.max_key_size {
            return Err(StoreError::KeyTooLarge {
                size: key.len(),
                max: self.max_key_size,
            });
        }
        Ok(())
    }

    /// Shared visibility lock unless `op` already owns the tree.
    pub(crate) fn visible(&self, op: Option<&AtomicOperation<'_>>) -> Option<RwLockReadGuard<'_, ()>> {
        match op {
            Some(op) if op.holds_lock(self.component.id()) => None,
            _ => Some(self.component.shared_lock()),
        }
    }

    fn null_file(&self) -> Result<FileId> {
        self.null_file.ok_or(StoreError::Invalid("tree keeps no null key"))
    }

    fn pairs(&self) -> Result<&TreeEngine> {
        self.pairs
            .as_deref()
            .ok_or(StoreError::Invalid("tree keeps no pair index"))
    }

    fn page(&self, index: u64) -> PageKey {
        PageKey::new(self.file, index)
    }

    fn structural(&self, index: u64, err: StoreError) -> StoreError {
        match err {
            StoreError::Corruption(reason) | StoreError::Invalid(reason) => {
                self.component.structure_error(self.page(index), reason)
            }
            other => other,
        }
    }

    fn page_size(&self) -> usize {
        self.component.cache().page_size()
    }

    fn min_fill_bytes(&self) -> usize {
        Self::capacity(self.page_size()) * self.min_fill_percent / 100
    }

    fn cmp_entry(&self, key: &[u8], seq: u64, target: &[u8], target_seq: u64) -> Result<Ordering> {
        Ok((self.kind.compare)(key, target)?.then(seq.cmp(&target_seq)))
    }

    fn keys_equal(&self, a: &[u8], b: &[u8]) -> Result<bool> {
        Ok((self.kind.compare)(a, b)? == Ordering::Equal)
    }

    fn with_view<R>(
        &self,
        op: Option<&AtomicOperation<'_>>,
        index: u64,
        f: impl FnOnce(&BucketView<'_>) -> Result<R>,
    ) -> Result<R> {
        self.component
            .load_page_for_read(op, self.page(index), |page| {
                let view = BucketView::parse(page, self.layout)?;
                f(&view)
            })
            .map_err(|err| self.structural(index, err))
    }

    fn read_bucket(&self, op: Option<&AtomicOperation<'_>>, index: u64) -> Result<Bucket> {
        self.component
            .load_page_for_read(op, self.page(index), |page| Bucket::decode(page, self.layout))
            .map_err(|err| self.structural(index, err))
    }

    fn write_bucket(&self, op: &mut AtomicOperation<'_>, index: u64, bucket: &Bucket) -> Result<()> {
        let page = self.component.load_page_for_write(op, self.page(index))?;
        bucket
            .encode_into(page, self.layout)
            .map_err(|err| self.structural(index, err))
    }

    pub(crate) fn entry(&self, op: Option<&AtomicOperation<'_>>) -> Result<EntryPoint> {
        self.component
            .load_page_for_read(op, self.page(ENTRY_PAGE), EntryPoint::decode)
            .map_err(|err| self.structural(ENTRY_PAGE, err))
    }

    fn lower_bound(&self, cells: &[Cell], key: &[u8], seq: u64) -> Result<usize> {
        let (mut lo, mut hi) = (0usize, cells.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.cmp_entry(&cells[mid].key, cells[mid].seq, key, seq)? == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn descend(
        &self,
        op: Option<&AtomicOperation<'_>>,
        key: &[u8],
        seq: u64,
    ) -> Result<(Vec<PathStep>, u64)> {
        self.counters.inc_searches();
        let mut path = Vec::new();
        let mut index = ROOT_PAGE;
        while path.len() < MAX_DEPTH {
            let step = self.with_view(op, index, |view| {
                if view.is_leaf() {
                    return Ok(None);
                }
                let child = view.seek(|k, s| self.cmp_entry(k, s, key, seq), true)?;
                Ok(Some((child, view.child(child)?)))
            })?;
            match step {
                None => return Ok((path, index)),
                Some((child, next)) => {
                    path.push(PathStep { page: index, child });
                    index = next;
                }
            }
        }
        Err(self
            .component
            .structure_error(self.page(index), "tree deeper than any valid tree"))
    }

    fn edge_leaf(&self, op: Option<&AtomicOperation<'_>>, last: bool) -> Result<u64> {
        self.counters.inc_searches();
        let mut index = ROOT_PAGE;
        for _ in 0..MAX_DEPTH {
            let next = self.with_view(op, index, |view| {
                if view.is_leaf() {
                    return Ok(None);
                }
                let child = if last { view.len() } else { 0 };
                view.child(child).map(Some)
            })?;
            match next {
                None => return Ok(index),
                Some(child) => index = child,
            }
        }
        Err(self
            .component
            .structure_error(self.page(index), "tree deeper than any valid tree"))
    }

    /// Leaf holding the first entry at or after `(key, seq)` (`strict`: after), and
    /// the slot of that entry in the leaf.
    fn seek_leaf(
        &self,
        op: Option<&AtomicOperation<'_>>,
        key: &[u8],
        seq: u64,
        strict: bool,
    ) -> Result<(u64, usize)> {
        let (_, leaf) = self.descend(op, key, seq)?;
        let at = self.with_view(op, leaf, |view| {
            view.seek(|k, s| self.cmp_entry(k, s, key, seq), strict)
        })?;
        Ok((leaf, at))
    }

    /// Record id stored under `key` in a single-value tree.
    pub(crate) fn get(&self, op: Option<&AtomicOperation<'_>>, key: &[u8]) -> Result<Option<Rid>> {
        let _visible = self.visible(op);
        let (_, leaf) = self.descend(op, key, 0)?;
        self.with_view(op, leaf, |view| {
            let at = view.seek(|k, s| self.cmp_entry(k, s, key, 0), false)?;
            if at == view.len() {
                return Ok(None);
            }
            let cell = view.cell(at)?;
            if !self.keys_equal(cell.key, key)? {
                return Ok(None);
            }
            match cell.value {
                CellValue::Rid(rid) => Ok(Some(rid)),
                CellValue::Child(_) => Err(StoreError::Corruption("leaf cell has no record id")),
            }
        })
    }

    fn leaf_limit(&self) -> Result<u64> {
        self.component.page_count(self.file)
    }

    fn within_upper(&self, key: &[u8], upper: &Bound<Vec<u8>>) -> Result<bool> {
        Ok(match upper {
            Bound::Unbounded => true,
            Bound::Included(u) => (self.kind.compare)(key, u)? != Ordering::Greater,
            Bound::Excluded(u) => (self.kind.compare)(key, u)? == Ordering::Less,
        })
    }

    fn within_lower(&self, key: &[u8], lower: &Bound<Vec<u8>>) -> Result<bool> {
        Ok(match lower {
            Bound::Unbounded => true,
            Bound::Included(l) => (self.kind.compare)(key, l)? != Ordering::Less,
            Bound::Excluded(l) => (self.kind.compare)(key, l)? == Ordering::Greater,
        })
    }

    /// Copies up to `limit` entries of `range` following `resume` (exclusive) into
    /// `out`. Returns true once the range has no further entries.
    pub(crate) fn scan(
        &self,
        op: Option<&AtomicOperation<'_>>,
        range: &ScanRange,
        resume: Option<(&[u8], u64)>,
        limit: usize,
        out: &mut Vec<RawEntry>,
    ) -> Result<bool> {
        let _visible = self.visible(op);
        if range.ascending {
            self.scan_forward(op, range, resume, limit, out)
        } else {
            self.scan_backward(op, range, resume, limit, out)
        }
    }

    fn scan_forward(
        &self,
        op: Option<&AtomicOperation<'_>>,
        range: &ScanRange,
        resume: Option<(&[u8], u64)>,
        limit: usize,
        out: &mut Vec<RawEntry>,
    ) -> Result<bool> {
        let (mut index, mut at) = match (resume, &range.lower) {
            (Some((key, seq)), _) => self.seek_leaf(op, key, seq, true)?,
            (None, Bound::Included(key)) => self.seek_leaf(op, key, 0, false)?,
            (None, Bound::Excluded(key)) => self.seek_leaf(op, key, u64::MAX, true)?,
            (None, Bound::Unbounded) => (self.edge_leaf(op, false)?, 0),
        };
        let taken = out.len();
        for _ in 0..self.leaf_limit()? {
            let step = self.with_view(op, index, |view| {
                while at < view.len() {
                    let cell = view.cell(at)?;
                    if !self.within_upper(cell.key, &range.upper)? {
                        return Ok(Step::Stop { exhausted: true });
                    }
                    out.push(raw_entry(&cell)?);
                    at += 1;
                    if out.len() - taken >= limit {
                        return Ok(Step::Stop { exhausted: false });
                    }
                }
                Ok(Step::Next(view.right()))
            })?;
            match step {
                Step::Stop { exhausted } => return Ok(exhausted),
                Step::Next(None) => return Ok(true),
                Step::Next(Some(next)) => {
                    index = next;
                    at = 0;
                }
            }
        }
        Err(self
            .component
            .structure_error(self.page(index), "leaf sibling chain has a cycle"))
    }

    fn scan_backward(
        &self,
        op: Option<&AtomicOperation<'_>>,
        range: &ScanRange,
        resume: Option<(&[u8], u64)>,
        limit: usize,
        out: &mut Vec<RawEntry>,
    ) -> Result<bool> {
        let (mut index, mut end) = match (resume, &range.upper) {
            (Some((key, seq)), _) => {
                let (leaf, at) = self.seek_leaf(op, key, seq, false)?;
                (leaf, Some(at))
            }
            (None, Bound::Included(key)) => {
                let (leaf, at) = self.seek_leaf(op, key, u64::MAX, true)?;
                (leaf, Some(at))
            }
            (None, Bound::Excluded(key)) => {
                let (leaf, at) = self.seek_leaf(op, key, 0, false)?;
                (leaf, Some(at))
            }
            (None, Bound::Unbounded) => (self.edge_leaf(op, true)?, None),
        };
        let taken = out.len();
        for _ in 0..self.leaf_limit()? {
            let step = self.with_view(op, index, |view| {
                let mut at = end.unwrap_or(view.len()).min(view.len());
                while at > 0 {
                    at -= 1;
                    let cell = view.cell(at)?;
                    if !self.within_lower(cell.key, &range.lower)? {
                        return Ok(Step::Stop { exhausted: true });
                    }
                    out.push(raw_entry(&cell)?);
                    if out.len() - taken >= limit {
                        return Ok(Step::Stop { exhausted: false });
                    }
                }
                Ok(Step::Next(view.left()))
            })?;
            match step {
                Step::Stop { exhausted } => return Ok(exhausted),
                Step::Next(None) => return Ok(true),
                Step::Next(Some(prev)) => {
                    index = prev;
                    end = None;
                }
            }
        }
        Err(self
            .component
            .structure_error(self.page(index), "leaf sibling chain has a cycle"))
    }

    /// Runs a mutation with the tree locked for `op`, persisting entry point changes.
    fn mutate<'a, R>(
        &self,
        op: &mut AtomicOperation<'a>,
        f: impl FnOnce(&mut AtomicOperation<'a>, &mut EntryPoint) -> Result<R>,
    ) -> Result<R> {
        self.component.execute_inside_component_operation(op, |op| {
            let mut entry = self.entry(Some(&*op))?;
            let before = entry;
            let out = f(op, &mut entry)?;
            if entry != before {
                entry.encode_into(
                    self.component
                        .load_page_for_write(op, self.page(ENTRY_PAGE))?,
                );
            }
            Ok(out)
        })
    }

    fn allocate(&self, op: &mut AtomicOperation<'_>, entry: &mut EntryPoint) -> Result<u64> {
        if entry.free_head == 0 {
            return self.component.add_page(op, self.file);
        }
        let index = entry.free_head;
        entry.free_head = self
            .component
            .load_page_for_read(Some(&*op), self.page(index), entry_point::free_next)
            .map_err(|err| self.structural(index, err))?;
        Ok(index)
    }

    fn release(&self, op: &mut AtomicOperation<'_>, entry: &mut EntryPoint, index: u64) -> Result<()> {
        let page = self.component.load_page_for_write(op, self.page(index))?;
        entry_point::mark_free(page, entry.free_head);
        entry.free_head = index;
        Ok(())
    }

    fn relink_left(&self, op: &mut AtomicOperation<'_>, index: u64, left: u64) -> Result<()> {
        let mut bucket = self.read_bucket(Some(&*op), index)?;
        bucket.left = Some(left);
        self.write_bucket(op, index, &bucket)
    }

    /// Writes `bucket` to `index`, splitting upward while buckets overflow.
    fn store(
        &self,
        op: &mut AtomicOperation<'_>,
        entry: &mut EntryPoint,
        mut path: Vec<PathStep>,
        mut index: u64,
        mut bucket: Bucket,
    ) -> Result<()> {
        let capacity = Self::capacity(self.page_size());
        loop {
            if bucket.encoded_len(self.layout) <= capacity {
                return self.write_bucket(op, index, &bucket);
            }
            let leaf = bucket.leaf;
            let (mut right, sep_key, sep_seq) = bucket
                .split_off(self.layout)
                .map_err(|err| self.structural(index, err))?;
            self.counters.inc_split(leaf);
            if index == ROOT_PAGE {
                let left_index = self.allocate(op, entry)?;
                let right_index = self.allocate(op, entry)?;
                if leaf {
                    bucket.right = Some(right_index);
                    right.left = Some(left_index);
                }
                self.write_bucket(op, left_index, &bucket)?;
                self.write_bucket(op, right_index, &right)?;
                let root = Bucket::internal(
                    left_index,
                    vec![Cell {
                        key: sep_key,
                        seq: sep_seq,
                        value: CellValue::Child(right_index),
                    }],
                );
                debug!(tree = self.name(), left = left_index, right = right_index, "btree.root_split");
                return self.write_bucket(op, ROOT_PAGE, &root);
            }
            let right_index = self.allocate(op, entry)?;
            if leaf {
                right.right = bucket.right;
                right.left = Some(index);
                bucket.right = Some(right_index);
                if let Some(next) = right.right {
                    self.relink_left(op, next, right_index)?;
                }
            }
            self.write_bucket(op, index, &bucket)?;
            self.write_bucket(op, right_index, &right)?;
            let step = path.pop().ok_or_else(|| {
                self.component
                    .structure_error(self.page(index), "non-root bucket without a parent")
            })?;
            let mut parent = self.read_bucket(Some(&*op), step.page)?;
            parent.cells.insert(
                step.child,
                Cell {
                    key: sep_key,
                    seq: sep_seq,
                    value: CellValue::Child(right_index),
                },
            );
            index = step.page;
            bucket = parent;
        }
    }

    /// Writes `bucket` after a removal, merging or redistributing underfull buckets.
    fn rebalance(
        &self,
        op: &mut AtomicOperation<'_>,
        entry: &mut EntryPoint,
        mut path: Vec<PathStep>,
        mut index: u64,
        mut bucket: Bucket,
    ) -> Result<()> {
        let capacity = Self::capacity(self.page_size());
        let min_fill = self.min_fill_bytes();
        loop {
            if index == ROOT_PAGE {
                return self.settle_root(op, entry, bucket);
            }
            if bucket.encoded_len(self.layout) >= min_fill {
                return self.write_bucket(op, index, &bucket);
            }
            let step = path.pop().ok_or_else(|| {
                self.component
                    .structure_error(self.page(index), "non-root bucket without a parent")
            })?;
            let mut parent = self.read_bucket(Some(&*op), step.page)?;
            if parent.cells.is_empty() {
                return Err(self
                    .component
                    .structure_error(self.page(step.page), "internal bucket without separators"));
            }
            let (sep_at, left_index, right_index) = if step.child > 0 {
                (step.child - 1, parent.child(step.child - 1)?, index)
            } else {
                (0, index, parent.child(1)?)
            };
            let (left, mut right) = if step.child > 0 {
                (self.read_bucket(Some(&*op), left_index)?, bucket)
            } else {
                (bucket, self.read_bucket(Some(&*op), right_index)?)
            };
            let leaf = left.leaf;
            let outer_right = right.right;
            let mut merged = Bucket {
                leaf,
                left: left.left,
                right: outer_right,
                leftmost: left.leftmost,
                cells: left.cells,
            };
            if !leaf {
                let separator = &parent.cells[sep_at];
                merged.cells.push(Cell {
                    key: separator.key.clone(),
                    seq: separator.seq,
                    value: CellValue::Child(right.leftmost),
                });
            }
            merged.cells.append(&mut right.cells);
            let combined = merged.encoded_len(self.layout);
            if combined > capacity || (combined >= 2 * min_fill && merged.cells.len() >= 3) {
                let (mut new_right, sep_key, sep_seq) = merged
                    .split_off(self.layout)
                    .map_err(|err| self.structural(left_index, err))?;
                if leaf {
                    merged.right = Some(right_index);
                    new_right.left = Some(left_index);
                    new_right.right = outer_right;
                }
                self.write_bucket(op, left_index, &merged)?;
                self.write_bucket(op, right_index, &new_right)?;
                let separator = &mut parent.cells[sep_at];
                separator.key = sep_key;
                separator.seq = sep_seq;
                self.counters.inc_redistributions();
                // The new separator may be longer or shorter than the old one.
                if parent.encoded_len(self.layout) > capacity {
                    return self.store(op, entry, path, step.page, parent);
                }
                index = step.page;
                bucket = parent;
                continue;
            }
            if let (true, Some(next)) = (leaf, outer_right) {
                self.relink_left(op, next, left_index)?;
            }
            self.write_bucket(op, left_index, &merged)?;
            self.release(op, entry, right_index)?;
            parent.cells.remove(sep_at);
            self.counters.inc_merges();
            index = step.page;
            bucket = parent;
        }
    }

    fn settle_root(
        &self,
        op: &mut AtomicOperation<'_>,
        entry: &mut EntryPoint,
        mut bucket: Bucket,
    ) -> Result<()> {
        while !bucket.leaf && bucket.cells.is_empty() {
            let child = bucket.leftmost;
            let mut absorbed = self.read_bucket(Some(&*op), child)?;
            absorbed.left = None;
            absorbed.right = None;
            self.release(op, entry, child)?;
            self.counters.inc_root_collapses();
            debug!(tree = self.name(), child, "btree.root_collapse");
            bucket = absorbed;
        }
        self.write_bucket(op, ROOT_PAGE, &bucket)
    }

    /// Inserts or updates `key` in a single-value tree after consulting `validator`.
    pub(crate) fn put_single(
        &self,
        op: &mut AtomicOperation<'_>,
        key: &[u8],
        rid: Rid,
        validator: impl FnOnce(Option<Rid>, Rid) -> Validation,
    ) -> Result<PutOutcome> {
        self.check_key(key)?;
        self.mutate(op, |op, entry| {
            let (path, leaf) = self.descend(Some(&*op), key, 0)?;
            let mut bucket = self.read_bucket(Some(&*op), leaf)?;
            let at = self.lower_bound(&bucket.cells, key, 0)?;
            let mut existing = None;
            if let Some(cell) = bucket.cells.get(at) {
                if self.keys_equal(&cell.key, key)? {
                    existing = Some(cell.rid().map_err(|err| self.structural(leaf, err))?);
                }
            }
            let value = match validator(existing, rid) {
                Validation::Accept => rid,
                Validation::Replace(other) => other,
                Validation::Ignore => return Ok(PutOutcome::Rejected),
            };
            match existing {
                Some(old) => {
                    if old != value {
                        let page = self.component.load_page_for_write(op, self.page(leaf))?;
                        set_leaf_rid(page, self.layout, at, value)
                            .map_err(|err| self.structural(leaf, err))?;
                        self.counters.inc_in_place_updates();
                    }
                    Ok(PutOutcome::Updated)
                }
                None => {
                    bucket.cells.insert(
                        at,
                        Cell {
                            key: key.to_vec(),
                            seq: 0,
                            value: CellValue::Rid(value),
                        },
                    );
                    self.store(op, entry, path, leaf, bucket)?;
                    entry.size += 1;
                    Ok(PutOutcome::Inserted)
                }
            }
        })
    }

    /// Removes `key` from a single-value tree.
    pub(crate) fn remove_single(&self, op: &mut AtomicOperation<'_>, key: &[u8]) -> Result<Option<Rid>> {
        self.mutate(op, |op, entry| {
            let (path, leaf) = self.descend(Some(&*op), key, 0)?;
            let mut bucket = self.read_bucket(Some(&*op), leaf)?;
            let at = self.lower_bound(&bucket.cells, key, 0)?;
            match bucket.cells.get(at) {
                Some(cell) if self.keys_equal(&cell.key, key)? => {}
                _ => return Ok(None),
            }
            let removed = bucket.cells.remove(at);
            let rid = removed.rid().map_err(|err| self.structural(leaf, err))?;
            self.rebalance(op, entry, path, leaf, bucket)?;
            entry.size = entry
                .size
                .checked_sub(1)
                .ok_or_else(|| self.component.structure_error(self.page(ENTRY_PAGE), "tree size underflow"))?;
            Ok(Some(rid))
        })
    }

    /// Adds `(key, rid)` to a multi-value tree; false when the pair is present.
    pub(crate) fn insert_multi(&self, op: &mut AtomicOperation<'_>, key: &[u8], rid: Rid) -> Result<bool> {
        self.check_key(key)?;
        self.mutate(op, |op, entry| {
            let pairs = self.pairs()?;
            let pair = pair_key(Some(key), rid);
            if pairs.get(Some(&*op), &pair)?.is_some() {
                return Ok(false);
            }
            let seq = entry.next_seq;
            entry.next_seq = seq
                .checked_add(1)
                .ok_or(StoreError::Invalid("insertion sequence exhausted"))?;
            let (path, leaf) = self.descend(Some(&*op), key, seq)?;
            let mut bucket = self.read_bucket(Some(&*op), leaf)?;
            let at = self.lower_bound(&bucket.cells, key, seq)?;
            bucket.cells.insert(
                at,
                Cell {
                    key: key.to_vec(),
                    seq,
                    value: CellValue::Rid(rid),
                },
            );
            self.store(op, entry, path, leaf, bucket)?;
            pairs.put_single(op, &pair, locator(seq), |_, _| Validation::Accept)?;
            entry.size += 1;
            Ok(true)
        })
    }

    /// Removes `(key, rid)` from a multi-value tree.
    pub(crate) fn remove_multi(&self, op: &mut AtomicOperation<'_>, key: &[u8], rid: Rid) -> Result<bool> {
        self.mutate(op, |op, entry| {
            let pairs = self.pairs()?;
            let pair = pair_key(Some(key), rid);
            let Some(seq) = pairs.get(Some(&*op), &pair)?.map(unlocate) else {
                return Ok(false);
            };
            let (path, leaf) = self.descend(Some(&*op), key, seq)?;
            let mut bucket = self.read_bucket(Some(&*op), leaf)?;
            let at = self.lower_bound(&bucket.cells, key, seq)?;
            let found = match bucket.cells.get(at) {
                Some(cell) => {
                    self.cmp_entry(&cell.key, cell.seq, key, seq)? == Ordering::Equal
                        && cell.rid().map_err(|err| self.structural(leaf, err))? == rid
                }
                None => false,
            };
            if !found {
                return Err(self
                    .component
                    .structure_error(self.page(leaf), "indexed pair missing from its leaf"));
            }
            bucket.cells.remove(at);
            self.rebalance(op, entry, path, leaf, bucket)?;
            pairs.remove_single(op, &pair)?;
            entry.size = entry
                .size
                .checked_sub(1)
                .ok_or_else(|| self.component.structure_error(self.page(ENTRY_PAGE), "tree size underflow"))?;
            Ok(true)
        })
    }

    /// Record ids stored under the null key.
    pub(crate) fn null_values(&self, op: Option<&AtomicOperation<'_>>) -> Result<Vec<Rid>> {
        let _visible = self.visible(op);
        null_bucket::read_all(&self.component, op, self.null_file()?)
    }

    /// Record id stored under the null key of a single-value tree.
    pub(crate) fn null_value(&self, op: Option<&AtomicOperation<'_>>) -> Result<Option<Rid>> {
        let _visible = self.visible(op);
        null_bucket::first(&self.component, op, self.null_file()?)
    }

    pub(crate) fn put_null_single(
        &self,
        op: &mut AtomicOperation<'_>,
        rid: Rid,
        validator: impl FnOnce(Option<Rid>, Rid) -> Validation,
    ) -> Result<PutOutcome> {
        let null_file = self.null_file()?;
        self.mutate(op, |op, entry| {
            let existing = null_bucket::first(&self.component, Some(&*op), null_file)?;
            let value = match validator(existing, rid) {
                Validation::Accept => rid,
                Validation::Replace(other) => other,
                Validation::Ignore => return Ok(PutOutcome::Rejected),
            };
            if existing != Some(value) {
                null_bucket::replace_head(&self.component, op, null_file, Some(value))?;
            }
            Ok(match existing {
                Some(_) => PutOutcome::Updated,
                None => {
                    entry.null_count += 1;
                    PutOutcome::Inserted
                }
            })
        })
    }

    pub(crate) fn insert_null_multi(&self, op: &mut AtomicOperation<'_>, rid: Rid) -> Result<bool> {
        let null_file = self.null_file()?;
        self.mutate(op, |op, entry| {
            let pairs = self.pairs()?;
            let pair = pair_key(None, rid);
            if pairs.get(Some(&*op), &pair)?.is_some() {
                return Ok(false);
            }
            let page = null_bucket::append(&self.component, op, null_file, rid)?;
            pairs.put_single(op, &pair, locator(page), |_, _| Validation::Accept)?;
            entry.null_count += 1;
            Ok(true)
        })
    }

    /// Removes null-key values equal to `only`, or all of them when `only` is None.
    pub(crate) fn remove_null(&self, op: &mut AtomicOperation<'_>, only: Option<Rid>) -> Result<Vec<Rid>> {
        let null_file = self.null_file()?;
        self.mutate(op, |op, entry| {
            let removed = match (self.pairs.as_deref(), only) {
                (Some(pairs), Some(rid)) => {
                    let pair = pair_key(None, rid);
                    let Some(page) = pairs.get(Some(&*op), &pair)?.map(unlocate) else {
                        return Ok(Vec::new());
                    };
                    if !null_bucket::remove_from(&self.component, op, null_file, page, rid)? {
                        return Err(self.component.structure_error(
                            PageKey::new(null_file, page),
                            "indexed null value missing from its bucket",
                        ));
                    }
                    pairs.remove_single(op, &pair)?;
                    vec![rid]
                }
                (Some(pairs), None) => {
                    let removed = null_bucket::clear(&self.component, op, null_file)?;
                    for rid in &removed {
                        pairs.remove_single(op, &pair_key(None, *rid))?;
                    }
                    removed
                }
                (None, _) => match null_bucket::first(&self.component, Some(&*op), null_file)? {
                    Some(stored) if only.map_or(true, |wanted| wanted == stored) => {
                        null_bucket::replace_head(&self.component, op, null_file, None)?;
                        vec![stored]
                    }
                    _ => Vec::new(),
                },
            };
            entry.null_count = entry
                .null_count
                .checked_sub(removed.len() as u64)
                .ok_or_else(|| self.component.structure_error(self.page(ENTRY_PAGE), "null count underflow"))?;
            Ok(removed)
        })
    }

    /// Entries including null-key values, read from the entry point.
    pub(crate) fn size(&self, op: Option<&AtomicOperation<'_>>) -> Result<u64> {
        let _visible = self.visible(op);
        let entry = self.entry(op)?;
        Ok(entry.size + entry.null_count)
    }

    /// Locks the tree for `op` until the operation ends.
    pub(crate) fn lock(&self, op: &mut AtomicOperation<'_>) {
        self.component.acquire_exclusive_lock(op);
    }

    /// Deletes every tree file when `op` commits.
    pub(crate) fn delete(&self, op: &mut AtomicOperation<'_>) -> Result<()> {
        self.component.execute_inside_component_operation(op, |op| {
            self.component.delete_file(op, self.file)?;
            if let Some(null_file) = self.null_file {
                self.component.delete_file(op, null_file)?;
            }
            if let Some(pairs) = self.pairs.as_deref() {
                pairs.delete(op)?;
            }
            debug!(tree = self.name(), "btree.delete");
            Ok(())
        })
    }

    /// Walks the whole tree and verifies ordering, separators, sibling links, depth,
    /// the free list, the entry and null counts and the pair index.
    pub(crate) fn check(&self) -> Result<TreeShape> {
        let _visible = self.component.shared_lock();
        let entry = self.entry(None)?;
        let mut shape = TreeShape {
            file_pages: self.component.page_count(self.file)?,
            ..TreeShape::default()
        };
        let mut leaves = Vec::new();
        shape.depth = self.check_bucket(ROOT_PAGE, None, None, 1, &mut shape, &mut leaves)?;
        for (at, &leaf) in leaves.iter().enumerate() {
            let links = self.with_view(None, leaf, |view| Ok((view.left(), view.right())))?;
            let expected = (
                at.checked_sub(1).map(|prev| leaves[prev]),
                leaves.get(at + 1).copied(),
            );
            if links != expected {
                return Err(self
                    .component
                    .structure_error(self.page(leaf), "leaf sibling links are inconsistent"));
            }
        }
        if shape.entries != entry.size {
            return Err(self
                .component
                .structure_error(self.page(ENTRY_PAGE), "entry count disagrees with leaves"));
        }
        let mut free = entry.free_head;
        while free != 0 {
            shape.free_buckets += 1;
            if shape.free_buckets >= shape.file_pages {
                return Err(self
                    .component
                    .structure_error(self.page(free), "free list has a cycle"));
            }
            free = self
                .component
                .load_page_for_read(None, self.page(free), entry_point::free_next)
                .map_err(|err| self.structural(free, err))?;
        }
        if let Some(null_file) = self.null_file {
            shape.null_entries = null_bucket::read_all(&self.component, None, null_file)?.len() as u64;
        }
        if shape.null_entries != entry.null_count {
            return Err(self
                .component
                .structure_error(self.page(ENTRY_PAGE), "null count disagrees with the null chain"));
        }
        if let Some(pairs) = self.pairs.as_deref() {
            if pairs.check()?.entries != entry.size + entry.null_count {
                return Err(self
                    .component
                    .structure_error(self.page(ENTRY_PAGE), "pair index disagrees with the tree"));
            }
        }
        Ok(shape)
    }

    fn check_bucket(
        &self,
        index: u64,
        lower: Option<&(Vec<u8>, u64)>,
        upper: Option<&(Vec<u8>, u64)>,
        level: usize,
        shape: &mut TreeShape,
        leaves: &mut Vec<u64>,
    ) -> Result<u32> {
        if level > MAX_DEPTH {
            return Err(self
                .component
                .structure_error(self.page(index), "tree deeper than any valid tree"));
        }
        let bucket = self.read_bucket(None, index)?;
        let mut prev: Option<(&[u8], u64)> = None;
        for cell in &bucket.cells {
            if let Some((key, seq)) = prev {
                if self.cmp_entry(key, seq, &cell.key, cell.seq)? != Ordering::Less {
                    return Err(self
                        .component
                        .structure_error(self.page(index), "bucket entries out of order"));
                }
            }
            if let Some((key, seq)) = lower {
                if self.cmp_entry(&cell.key, cell.seq, key, *seq)? == Ordering::Less {
                    return Err(self
                        .component
                        .structure_error(self.page(index), "entry below its separator"));
                }
            }
            if let Some((key, seq)) = upper {
                if self.cmp_entry(&cell.key, cell.seq, key, *seq)? != Ordering::Less {
                    return Err(self
                        .component
                        .structure_error(self.page(index), "entry at or above the next separator"));
                }
            }
            prev = Some((cell.key.as_slice(), cell.seq));
        }
        if bucket.leaf {
            shape.leaf_buckets += 1;
            shape.entries += bucket.cells.len() as u64;
            leaves.push(index);
            return Ok(1);
        }
        shape.internal_buckets += 1;
        if bucket.cells.is_empty() {
            return Err(self
                .component
                .structure_error(self.page(index), "internal bucket without separators"));
        }
        let bounds: Vec<(Vec<u8>, u64)> = bucket
            .cells
            .iter()
            .map(|cell| (cell.key.clone(), cell.seq))
            .collect();
        let mut depth = None;
        for child in 0..=bounds.len() {
            let child_lower = if child == 0 { lower } else { bounds.get(child - 1) };
            let child_upper = if child == bounds.len() { upper } else { bounds.get(child) };
            let child_index = bucket.child(child).map_err(|err| self.structural(index, err))?;
            let got = self.check_bucket(child_index, child_lower, child_upper, level + 1, shape, leaves)?;
            match depth {
                None => depth = Some(got),
                Some(expected) if expected != got => {
                    return Err(self
                        .component
                        .structure_error(self.page(index), "leaves at different depths"));
                }
                Some(_) => {}
            }
        }
        Ok(depth.unwrap_or(0) + 1)
    }
}

fn raw_entry(cell: &super::bucket::CellRef<'_>) -> Result<RawEntry> {
    match cell.value {
        CellValue::Rid(rid) => Ok(RawEntry {
            key: cell.key.to_vec(),
            seq: cell.seq,
            rid,
        }),
        CellValue::Child(_) => Err(StoreError::Corruption("leaf cell has no record id")),
    }
}
