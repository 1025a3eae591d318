//! Byte-comparable encoding of composite keys.
//!
//! A normalized key orders exactly like the [`CompositeKey`] it encodes when compared
//! as raw bytes, so trees keyed by [`NormalizedKey`] never decode keys while
//! searching.

use std::cmp::Ordering;

use super::codecs::{CompositeKey, KeySerializer, KeyValue};
use crate::primitives::bytes::ord;
use crate::types::{Result, StoreError};

const ABSENT: u8 = 0x00;
const PRESENT: u8 = 0x01;

/// Order-preserving encoder for [`CompositeKey`].
///
/// Each column starts with a flag byte, `0x00` for null and `0x01` otherwise,
/// followed by a type tag and the value: integers big-endian with the sign bit
/// flipped, floats with the IEEE bits flipped, text and bytes escaped and
/// terminated.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyNormalizer;

impl KeyNormalizer {
    /// Appends the normalized form of `key` to `out`.
    pub fn normalize(&self, key: &CompositeKey, out: &mut Vec<u8>) -> Result<()> {
        for value in key.values() {
            if let KeyValue::Null = value {
                out.push(ABSENT);
                continue;
            }
            out.push(PRESENT);
            out.push(value.rank());
            match value {
                KeyValue::Null => {}
                KeyValue::Bool(v) => out.push(u8::from(*v)),
                KeyValue::Int(v) => ord::put_i64_be(out, *v),
                KeyValue::Double(v) => {
                    if v.is_nan() {
                        return Err(StoreError::Invalid("NaN cannot be stored in a key"));
                    }
                    ord::put_f64_be(out, *v);
                }
                KeyValue::Text(v) => ord::put_escaped(out, v.as_bytes()),
                KeyValue::Bytes(v) => ord::put_escaped(out, v),
            }
        }
        Ok(())
    }

    /// Rebuilds the composite key behind a normalized encoding.
    pub fn denormalize(&self, mut bytes: &[u8]) -> Result<CompositeKey> {
        let mut values = Vec::new();
        while let Some((&flag, rest)) = bytes.split_first() {
            if flag == ABSENT {
                values.push(KeyValue::Null);
                bytes = rest;
                continue;
            }
            if flag != PRESENT {
                return Err(StoreError::Corruption("bad null flag in normalized key"));
            }
            let (&tag, rest) = rest
                .split_first()
                .ok_or(StoreError::Corruption("normalized key truncated"))?;
            let (value, used) = match tag {
                1 => {
                    let b = *rest
                        .first()
                        .ok_or(StoreError::Corruption("normalized key truncated"))?;
                    (KeyValue::Bool(b != 0), 1)
                }
                2 => (KeyValue::Int(ord::get_i64_be(rest)?), 8),
                3 => (KeyValue::Double(ord::get_f64_be(rest)?), 8),
                4 => {
                    let (raw, used) = ord::split_escaped(rest)?;
                    let text = String::from_utf8(raw)
                        .map_err(|_| StoreError::Corruption("normalized text is not UTF-8"))?;
                    (KeyValue::Text(text), used)
                }
                5 => {
                    let (raw, used) = ord::split_escaped(rest)?;
                    (KeyValue::Bytes(raw), used)
                }
                _ => return Err(StoreError::Corruption("unknown normalized key tag")),
            };
            values.push(value);
            bytes = &rest[used..];
        }
        Ok(CompositeKey(values))
    }
}

/// Composite key stored in normalized form and compared as raw bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct NormalizedKey(pub CompositeKey);

impl From<CompositeKey> for NormalizedKey {
    fn from(key: CompositeKey) -> Self {
        Self(key)
    }
}

impl KeySerializer for NormalizedKey {
    const TYPE_ID: u8 = 7;

    fn serialize(&self, out: &mut Vec<u8>) -> Result<()> {
        KeyNormalizer.normalize(&self.0, out)
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        KeyNormalizer.denormalize(bytes).map(NormalizedKey)
    }

    fn compare_serialized(a: &[u8], b: &[u8]) -> Result<Ordering> {
        Ok(a.cmp(b))
    }
}
