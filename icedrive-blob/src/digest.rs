//! Incremental SHA-256 over blob content.

use icedrive_protocol::types::BlobId;
use sha2::{Digest, Sha256};

/// Running digest of a byte stream, finalized into a [`BlobId`].
#[derive(Clone, Default)]
pub struct BlobDigest {
    hasher: Sha256,
    len: u64,
}

impl BlobDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next bytes of the stream.
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.len += bytes.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn finalize(self) -> BlobId {
        BlobId(self.hasher.finalize().into())
    }

    /// Digest of a complete buffer.
    pub fn digest(bytes: &[u8]) -> BlobId {
        let mut d = Self::new();
        d.update(bytes);
        d.finalize()
    }
}
