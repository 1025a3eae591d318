#![forbid(unsafe_code)]
//! Order-preserving encoders and a bounds-checked reader shared by the on-disk formats.

pub mod ord {
    //! Order-preserving encoders for numeric and string keys.
    //!
    //! Every encoder produces bytes whose unsigned lexicographic order matches the
    //! natural order of the input values.

    use crate::types::{Result, StoreError};

    const SIGN_BIT_64: u64 = 1 << 63;
    const ESCAPE: u8 = 0x00;
    const ESCAPED_ZERO: u8 = 0xFF;
    const TERMINATOR: u8 = 0x00;

    /// Appends `v` in big-endian order.
    pub fn put_u64_be(dst: &mut Vec<u8>, v: u64) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Decodes a big-endian u64 from the first 8 bytes of `src`.
    pub fn get_u64_be(src: &[u8]) -> Result<u64> {
        let head: [u8; 8] = src
            .get(..8)
            .and_then(|s| s.try_into().ok())
            .ok_or(StoreError::Corruption("u64 key truncated"))?;
        Ok(u64::from_be_bytes(head))
    }

    /// Appends a signed i64 with its sign bit flipped so negatives sort first.
    pub fn put_i64_be(dst: &mut Vec<u8>, v: i64) {
        put_u64_be(dst, (v as u64) ^ SIGN_BIT_64);
    }

    /// Decodes a value written by [`put_i64_be`].
    pub fn get_i64_be(src: &[u8]) -> Result<i64> {
        Ok((get_u64_be(src)? ^ SIGN_BIT_64) as i64)
    }

    /// Appends an f64 so that byte order matches numeric order (NaN not allowed).
    pub fn put_f64_be(dst: &mut Vec<u8>, v: f64) {
        debug_assert!(!v.is_nan(), "NaN keys are not allowed");
        let bits = v.to_bits();
        let encoded = if bits & SIGN_BIT_64 != 0 {
            !bits
        } else {
            bits ^ SIGN_BIT_64
        };
        put_u64_be(dst, encoded);
    }

    /// Decodes a value written by [`put_f64_be`].
    pub fn get_f64_be(src: &[u8]) -> Result<f64> {
        let encoded = get_u64_be(src)?;
        let bits = if encoded & SIGN_BIT_64 != 0 {
            encoded ^ SIGN_BIT_64
        } else {
            !encoded
        };
        Ok(f64::from_bits(bits))
    }

    /// Appends `bytes` escaped and terminated so that a shorter value sorts
    /// before any value it prefixes.
    ///
    /// `0x00` becomes `0x00 0xFF`; the terminator is `0x00 0x00`.
    pub fn put_escaped(dst: &mut Vec<u8>, bytes: &[u8]) {
        for &b in bytes {
            if b == ESCAPE {
                dst.push(ESCAPE);
                dst.push(ESCAPED_ZERO);
            } else {
                dst.push(b);
            }
        }
        dst.push(ESCAPE);
        dst.push(TERMINATOR);
    }

    /// Decodes a value written by [`put_escaped`], returning it and the bytes consumed.
    pub fn split_escaped(src: &[u8]) -> Result<(Vec<u8>, usize)> {
        let mut out = Vec::new();
        let mut idx = 0;
        while idx < src.len() {
            let b = src[idx];
            if b != ESCAPE {
                out.push(b);
                idx += 1;
                continue;
            }
            match src.get(idx + 1) {
                Some(&TERMINATOR) => return Ok((out, idx + 2)),
                Some(&ESCAPED_ZERO) => {
                    out.push(0);
                    idx += 2;
                }
                _ => return Err(StoreError::Corruption("bad escape in ordered bytes")),
            }
        }
        Err(StoreError::Corruption("ordered bytes not terminated"))
    }
}

pub mod buf {
    //! A slice-backed reader for parsing on-disk records.

    use core::fmt;

    use crate::types::{Result, StoreError};

    /// Reads bytes from a slice with offset tracking; running past the end is corruption.
    pub struct Cursor<'a> {
        buf: &'a [u8],
        off: usize,
    }

    impl<'a> Cursor<'a> {
        /// Creates a cursor starting at offset 0.
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        /// Takes the next `n` bytes.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .filter(|&end| end <= self.buf.len())
                .ok_or(StoreError::Corruption("record truncated"))?;
            let slice = &self.buf[self.off..end];
            self.off = end;
            Ok(slice)
        }

        /// Reads a big-endian u16.
        pub fn u16(&mut self) -> Result<u16> {
            let bytes = self.take(2)?;
            Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
        }

        /// Reads a big-endian u32.
        pub fn u32(&mut self) -> Result<u32> {
            let mut arr = [0u8; 4];
            arr.copy_from_slice(self.take(4)?);
            Ok(u32::from_be_bytes(arr))
        }

        /// Reads a big-endian u64.
        pub fn u64(&mut self) -> Result<u64> {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(self.take(8)?);
            Ok(u64::from_be_bytes(arr))
        }

        /// Current offset.
        pub fn position(&self) -> usize {
            self.off
        }

        /// Number of bytes left.
        pub fn remaining(&self) -> usize {
            self.buf.len().saturating_sub(self.off)
        }
    }

    impl fmt::Debug for Cursor<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Cursor")
                .field("off", &self.off)
                .field("remaining", &self.remaining())
                .finish()
        }
    }
}
