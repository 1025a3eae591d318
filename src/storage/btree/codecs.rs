//! Key serializers used by the cell B-trees.
//!
//! Plain serializers use compact little-endian or length-prefixed layouts and compare
//! by decoding; see [`super::normalized`] for the byte-comparable variant.

use std::cmp::Ordering;
use std::fmt;

use crate::primitives::bytes::buf::Cursor;
use crate::types::{Result, StoreError};

/// Trait implemented by key types stored in a cell B-tree.
///
/// Equal keys must serialize to identical bytes: multi-value trees index their
/// `(key, rid)` pairs by the serialized form.
pub trait KeySerializer: Clone + Ord + fmt::Debug + Send + Sync + 'static {
    /// Tag recorded in the tree's entry point; reopening with another type fails.
    const TYPE_ID: u8;

    /// Appends the serialized key to `out`.
    fn serialize(&self, out: &mut Vec<u8>) -> Result<()>;

    /// Rebuilds a key from bytes written by [`Self::serialize`].
    fn deserialize(bytes: &[u8]) -> Result<Self>;

    /// Orders two serialized keys the way their decoded values order.
    fn compare_serialized(a: &[u8], b: &[u8]) -> Result<Ordering> {
        Ok(Self::deserialize(a)?.cmp(&Self::deserialize(b)?))
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| StoreError::Corruption("fixed-width key has wrong length"))
}

impl KeySerializer for u64 {
    const TYPE_ID: u8 = 1;

    fn serialize(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(u64::from_le_bytes(fixed(bytes)?))
    }
}

impl KeySerializer for i64 {
    const TYPE_ID: u8 = 2;

    fn serialize(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(i64::from_le_bytes(fixed(bytes)?))
    }
}

impl KeySerializer for i32 {
    const TYPE_ID: u8 = 3;

    fn serialize(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(i32::from_le_bytes(fixed(bytes)?))
    }
}

impl KeySerializer for String {
    const TYPE_ID: u8 = 4;

    fn serialize(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(self.as_bytes());
        Ok(())
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec()).map_err(|_| StoreError::Corruption("string key is not UTF-8"))
    }

    // UTF-8 byte order is code point order.
    fn compare_serialized(a: &[u8], b: &[u8]) -> Result<Ordering> {
        Ok(a.cmp(b))
    }
}

impl KeySerializer for Vec<u8> {
    const TYPE_ID: u8 = 5;

    fn serialize(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(self);
        Ok(())
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }

    fn compare_serialized(a: &[u8], b: &[u8]) -> Result<Ordering> {
        Ok(a.cmp(b))
    }
}

/// One component of a [`CompositeKey`].
#[derive(Clone, Debug)]
pub enum KeyValue {
    /// Missing value; sorts before everything else.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number; NaN is rejected when the key is stored.
    Double(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl KeyValue {
    pub(crate) fn rank(&self) -> u8 {
        match self {
            KeyValue::Null => 0,
            KeyValue::Bool(_) => 1,
            KeyValue::Int(_) => 2,
            KeyValue::Double(_) => 3,
            KeyValue::Text(_) => 4,
            KeyValue::Bytes(_) => 5,
        }
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyValue::Bool(a), KeyValue::Bool(b)) => a.cmp(b),
            (KeyValue::Int(a), KeyValue::Int(b)) => a.cmp(b),
            (KeyValue::Double(a), KeyValue::Double(b)) => a.total_cmp(b),
            (KeyValue::Text(a), KeyValue::Text(b)) => a.cmp(b),
            (KeyValue::Bytes(a), KeyValue::Bytes(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Text(v.to_owned())
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::Text(v)
    }
}

impl From<bool> for KeyValue {
    fn from(v: bool) -> Self {
        KeyValue::Bool(v)
    }
}

impl From<f64> for KeyValue {
    fn from(v: f64) -> Self {
        KeyValue::Double(v)
    }
}

/// Multi-column key compared column by column; a key sorts before any longer key
/// it prefixes.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct CompositeKey(pub Vec<KeyValue>);

impl CompositeKey {
    /// Creates a key from its columns.
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self(values)
    }

    /// Adds a column.
    pub fn push(mut self, value: impl Into<KeyValue>) -> Self {
        self.0.push(value.into());
        self
    }

    /// Columns of the key.
    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }
}

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_TEXT: u8 = 4;
const TAG_BYTES: u8 = 5;

impl KeySerializer for CompositeKey {
    const TYPE_ID: u8 = 6;

    fn serialize(&self, out: &mut Vec<u8>) -> Result<()> {
        let count = u16::try_from(self.0.len())
            .map_err(|_| StoreError::Invalid("composite key has too many columns"))?;
        out.extend_from_slice(&count.to_le_bytes());
        for value in &self.0 {
            match value {
                KeyValue::Null => out.push(TAG_NULL),
                KeyValue::Bool(v) => {
                    out.push(TAG_BOOL);
                    out.push(u8::from(*v));
                }
                KeyValue::Int(v) => {
                    out.push(TAG_INT);
                    out.extend_from_slice(&v.to_le_bytes());
                }
                KeyValue::Double(v) => {
                    if v.is_nan() {
                        return Err(StoreError::Invalid("NaN cannot be stored in a key"));
                    }
                    out.push(TAG_DOUBLE);
                    out.extend_from_slice(&v.to_le_bytes());
                }
                KeyValue::Text(v) => {
                    out.push(TAG_TEXT);
                    put_len_prefixed(out, v.as_bytes())?;
                }
                KeyValue::Bytes(v) => {
                    out.push(TAG_BYTES);
                    put_len_prefixed(out, v)?;
                }
            }
        }
        Ok(())
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(bytes);
        let count = u16::from_le_bytes(fixed(cur.take(2)?)?);
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let tag = cur.take(1)?[0];
            let value = match tag {
                TAG_NULL => KeyValue::Null,
                TAG_BOOL => KeyValue::Bool(cur.take(1)?[0] != 0),
                TAG_INT => KeyValue::Int(i64::from_le_bytes(fixed(cur.take(8)?)?)),
                TAG_DOUBLE => KeyValue::Double(f64::from_le_bytes(fixed(cur.take(8)?)?)),
                TAG_TEXT => {
                    let len = u16::from_le_bytes(fixed(cur.take(2)?)?) as usize;
                    let text = String::from_utf8(cur.take(len)?.to_vec())
                        .map_err(|_| StoreError::Corruption("composite text is not UTF-8"))?;
                    KeyValue::Text(text)
                }
                TAG_BYTES => {
                    let len = u16::from_le_bytes(fixed(cur.take(2)?)?) as usize;
                    KeyValue::Bytes(cur.take(len)?.to_vec())
                }
                _ => return Err(StoreError::Corruption("unknown composite key tag")),
            };
            values.push(value);
        }
        if cur.remaining() != 0 {
            return Err(StoreError::Corruption("trailing bytes after composite key"));
        }
        Ok(CompositeKey(values))
    }
}

fn put_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| StoreError::Invalid("composite key column too long"))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

pub(crate) fn encode<K: KeySerializer>(key: &K) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    key.serialize(&mut out)?;
    Ok(out)
}
