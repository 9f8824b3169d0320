//! Per-candidate hash state.

use crate::{Error, Result};

/// Words per candidate hash record.
pub const HASH_WORDS: usize = 8;

/// Bytes per candidate hash record.
pub const HASH_BYTES: usize = HASH_WORDS * 4;

/// The 256-bit hash state of one candidate slot.
///
/// Every stage of the chain rewrites this block in place; after a batch
/// retires it holds the terminal stage's output, not any intermediate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct HashRecord {
    pub h: [u32; HASH_WORDS],
}

impl HashRecord {
    pub fn from_words(h: [u32; HASH_WORDS]) -> Self {
        Self { h }
    }

    /// Little-endian byte serialization, word 0 first — the layout the
    /// device buffers use.
    pub fn to_le_bytes(&self) -> [u8; HASH_BYTES] {
        let mut bytes = [0u8; HASH_BYTES];
        for (i, word) in self.h.iter().enumerate() {
            bytes[i * 4..(i + 1) * 4].copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HASH_BYTES {
            return Err(Error::InvalidRecordLength { got: bytes.len() });
        }
        let mut h = [0u32; HASH_WORDS];
        for (i, chunk) in bytes.chunks_exact(4).enumerate() {
            h[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(Self { h })
    }

    /// Upper 64 bits of the digest as the terminal stage compares them:
    /// word 7 high, word 6 low.
    pub fn digest_tail(&self) -> u64 {
        ((self.h[7] as u64) << 32) | self.h[6] as u64
    }
}
