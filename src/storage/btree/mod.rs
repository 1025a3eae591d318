#![forbid(unsafe_code)]

//! Cell B-trees: ordered key to record-id indexes stored in durable component pages.

mod bucket;
/// Key serializers.
pub mod codecs;
mod cursor;
mod engine;
mod entry_point;
mod multi;
/// Byte-comparable composite keys.
pub mod normalized;
mod null_bucket;
mod single;
mod stats;

pub use codecs::{CompositeKey, KeySerializer, KeyValue};
pub use cursor::{EntryStream, KeyStream, ValueStream};
pub use multi::MultiValueTree;
pub use normalized::{KeyNormalizer, NormalizedKey};
pub use single::SingleValueTree;
pub use stats::{BTreeStats, TreeShape};

/// Single-value tree over normalized composite keys.
pub type NormalizedKeyTree = SingleValueTree<NormalizedKey>;

/// Multi-value tree over normalized composite keys.
pub type NormalizedMultiKeyTree = MultiValueTree<NormalizedKey>;

/// Verdict of a validator passed to [`SingleValueTree::validated_put`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validation {
    /// Write the proposed record id.
    Accept,
    /// Leave the tree untouched.
    Ignore,
    /// Write this record id instead.
    Replace(crate::types::Rid),
}

/// What a validated put did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// The key was absent and has been added.
    Inserted,
    /// The key existed and now maps to the accepted record id.
    Updated,
    /// The validator vetoed the write.
    Rejected,
}

#[cfg(test)]
mod tests;
