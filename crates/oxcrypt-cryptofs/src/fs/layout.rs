//! Cleartext/ciphertext offset arithmetic.
//!
//! A content file is an 88-byte header followed by chunks. Every chunk but the
//! last holds exactly `chunk_size` cleartext bytes; each costs
//! [`CHUNK_OVERHEAD`] extra bytes (nonce and MAC) on disk.

use crate::crypto::content::{CHUNK_OVERHEAD, HEADER_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    chunk_size: u64,
}

impl ChunkLayout {
    /// `chunk_size` must be non-zero; properties validation guarantees it.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1) as u64,
        }
    }

    #[inline]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    #[inline]
    pub fn ciphertext_chunk_size(&self) -> u64 {
        self.chunk_size + CHUNK_OVERHEAD as u64
    }

    /// Index of the chunk containing cleartext `offset`.
    #[inline]
    pub fn chunk_index(&self, offset: u64) -> u64 {
        offset / self.chunk_size
    }

    /// Cleartext offset of the first byte of chunk `index`.
    #[inline]
    pub fn chunk_start(&self, index: u64) -> u64 {
        index * self.chunk_size
    }

    /// Ciphertext offset of chunk `index`.
    #[inline]
    pub fn ciphertext_offset(&self, index: u64) -> u64 {
        HEADER_SIZE as u64 + index * self.ciphertext_chunk_size()
    }

    /// Number of chunks holding `cleartext_size` bytes.
    #[inline]
    pub fn chunk_count(&self, cleartext_size: u64) -> u64 {
        cleartext_size.div_ceil(self.chunk_size)
    }

    /// Cleartext length of chunk `index` in a file of `cleartext_size` bytes.
    pub fn chunk_len(&self, index: u64, cleartext_size: u64) -> usize {
        let start = self.chunk_start(index);
        // Bounded by chunk_size, which fits in usize
        cleartext_size.saturating_sub(start).min(self.chunk_size) as usize
    }

    /// Exact ciphertext length of a file holding `cleartext_size` bytes.
    pub fn ciphertext_size(&self, cleartext_size: u64) -> u64 {
        HEADER_SIZE as u64
            + cleartext_size
            + self.chunk_count(cleartext_size) * CHUNK_OVERHEAD as u64
    }

    /// Cleartext length of a ciphertext file of `ciphertext_size` bytes.
    ///
    /// A zero-length file has no header yet and counts as empty. Returns
    /// `None` if the length cannot result from any valid file: a truncated
    /// header, or a trailing chunk too short to hold its nonce, MAC and at
    /// least one byte.
    pub fn cleartext_size(&self, ciphertext_size: u64) -> Option<u64> {
        if ciphertext_size == 0 {
            return Some(0);
        }
        let body = ciphertext_size.checked_sub(HEADER_SIZE as u64)?;
        let full_chunks = body / self.ciphertext_chunk_size();
        let remainder = body % self.ciphertext_chunk_size();
        let tail = match remainder {
            0 => 0,
            r if r <= CHUNK_OVERHEAD as u64 => return None,
            r => r - CHUNK_OVERHEAD as u64,
        };
        Some(full_chunks * self.chunk_size + tail)
    }
}
