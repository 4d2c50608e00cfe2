// Blocks, block checksums and the persisted fingerprint encoding.

use serde::{Deserialize, Serialize};

use crate::{BlockError, Result};

/// A contiguous, semantically scoped line range of a source file.
///
/// Lines are 1-based and inclusive. `code` is either the raw text of the file
/// or the rendered structural signature of the block's syntax subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub start: usize,
    pub end: usize,
    pub name: String,
    pub code: String,
}

impl Block {
    pub fn new(start: usize, end: usize, name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            start,
            end,
            name: name.into(),
            code: code.into(),
        }
    }

    /// Checksum of this block's code.
    pub fn checksum(&self) -> i32 {
        checksum(self.code.as_bytes())
    }

    /// Whether `line` falls inside this block.
    pub fn contains(&self, line: usize) -> bool {
        self.start <= line && line <= self.end
    }
}

/// 32-bit FNV-1a of `data`, folded into a signed integer.
///
/// Checksums are stored as signed 32-bit values so the fingerprint blob has a
/// fixed width regardless of the hash's top bit.
pub fn checksum(data: &[u8]) -> i32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    #[allow(clippy::cast_possible_wrap)]
    let signed = hash as i32;
    signed
}

// ── Fingerprint ────────────────────────────────────────────────────

/// Ordered checksums of the blocks one test execution touched in one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub Vec<i32>);

impl Fingerprint {
    pub fn new(checksums: Vec<i32>) -> Self {
        Self(checksums)
    }

    pub fn checksums(&self) -> &[i32] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Encode as a blob of little-endian `i32`s.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(self.0.len() * 4);
        for checksum in &self.0 {
            blob.extend_from_slice(&checksum.to_le_bytes());
        }
        blob
    }

    /// Decode a blob produced by [`Fingerprint::to_blob`].
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        if blob.len() % 4 != 0 {
            return Err(BlockError::InvalidBlob { len: blob.len() });
        }
        let checksums = blob
            .chunks_exact(4)
            .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Ok(Self(checksums))
    }
}

impl From<Vec<i32>> for Fingerprint {
    fn from(checksums: Vec<i32>) -> Self {
        Self(checksums)
    }
}
