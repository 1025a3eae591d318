#![forbid(unsafe_code)]

use super::page::header;

/// Incremental checksum over byte chunks.
pub trait Checksum {
    /// Clears the accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed since the last reset.
    fn finalize(&self) -> u32;
}

/// CRC32 (IEEE) backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// CRC of a full page image, salted with its address; the crc field itself counts as zero.
pub fn page_crc32(file_id: u32, page_index: u64, page: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&file_id.to_be_bytes());
    hasher.update(&page_index.to_be_bytes());
    if page.len() < header::CRC32.end {
        hasher.update(page);
        return hasher.finalize();
    }
    hasher.update(&page[..header::CRC32.start]);
    hasher.update(&[0u8; 4]);
    hasher.update(&page[header::CRC32.end..]);
    hasher.finalize()
}
