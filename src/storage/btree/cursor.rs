use std::collections::VecDeque;
use std::marker::PhantomData;

use super::codecs::KeySerializer;
use super::engine::{RawEntry, ScanRange, TreeEngine};
use crate::types::{Result, Rid};

/// Lazy iterator over `(key, rid)` pairs of a range.
///
/// Entries are copied out of the tree in batches; each batch is read under the
/// tree's visibility lock, and the next one re-seeks after the last entry
/// returned, so a stream never holds a lock while the caller runs. Changes
/// committed between batches may or may not be observed.
pub struct EntryStream<'t, K: KeySerializer> {
    engine: &'t TreeEngine,
    range: ScanRange,
    batch_size: usize,
    buffer: VecDeque<RawEntry>,
    resume: Option<(Vec<u8>, u64)>,
    exhausted: bool,
    _key: PhantomData<fn() -> K>,
}

impl<'t, K: KeySerializer> EntryStream<'t, K> {
    pub(crate) fn new(engine: &'t TreeEngine, range: ScanRange, batch_size: usize) -> Self {
        Self {
            engine,
            range,
            batch_size: batch_size.max(1),
            buffer: VecDeque::new(),
            resume: None,
            exhausted: false,
            _key: PhantomData,
        }
    }

    fn refill(&mut self) -> Result<()> {
        let mut batch = Vec::with_capacity(self.batch_size);
        let resume = self.resume.as_ref().map(|(key, seq)| (key.as_slice(), *seq));
        self.exhausted = self
            .engine
            .scan(None, &self.range, resume, self.batch_size, &mut batch)?;
        match batch.last() {
            Some(last) => self.resume = Some((last.key.clone(), last.seq)),
            None => self.exhausted = true,
        }
        self.buffer.extend(batch);
        Ok(())
    }
}

impl<K: KeySerializer> Iterator for EntryStream<'_, K> {
    type Item = Result<(K, Rid)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.refill() {
                self.exhausted = true;
                self.buffer.clear();
                return Some(Err(err));
            }
        }
        let entry = self.buffer.pop_front()?;
        Some(K::deserialize(&entry.key).map(|key| (key, entry.rid)))
    }
}

/// Distinct keys of a tree in ascending order.
pub struct KeyStream<'t, K: KeySerializer> {
    entries: EntryStream<'t, K>,
    last: Option<K>,
}

impl<'t, K: KeySerializer> KeyStream<'t, K> {
    pub(crate) fn new(entries: EntryStream<'t, K>) -> Self {
        Self {
            entries,
            last: None,
        }
    }
}

impl<K: KeySerializer> Iterator for KeyStream<'_, K> {
    type Item = Result<K>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let key = match self.entries.next()? {
                Ok((key, _)) => key,
                Err(err) => return Some(Err(err)),
            };
            if self.last.as_ref() != Some(&key) {
                self.last = Some(key.clone());
                return Some(Ok(key));
            }
        }
    }
}

/// Record ids stored under one key of a multi-value tree, oldest first.
pub struct ValueStream<'t, K: KeySerializer> {
    entries: EntryStream<'t, K>,
}

impl<'t, K: KeySerializer> ValueStream<'t, K> {
    pub(crate) fn new(entries: EntryStream<'t, K>) -> Self {
        Self { entries }
    }
}

impl<K: KeySerializer> Iterator for ValueStream<'_, K> {
    type Item = Result<Rid>;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next().map(|entry| entry.map(|(_, rid)| rid))
    }
}
