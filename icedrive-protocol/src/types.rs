//! Core identifiers shared across all icedrive crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length in bytes of a SHA-256 digest.
pub const DIGEST_LEN: usize = 32;

/// Content identity of a stored blob: the SHA-256 digest of its bytes.
///
/// Rendered as 64 lowercase hex characters wherever it is used as a key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobId(pub [u8; DIGEST_LEN]);

/// Error returned when a string is not a valid hex-encoded identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid identifier {input:?}: expected {DIGEST_LEN} bytes of lowercase hex")]
pub struct ParseIdError {
    input: String,
}

fn decode_hex32(hex: &str) -> Option<[u8; DIGEST_LEN]> {
    let bytes = data_encoding::HEXLOWER.decode(hex.as_bytes()).ok()?;
    if bytes.len() != DIGEST_LEN {
        return None;
    }
    let mut arr = [0u8; DIGEST_LEN];
    arr.copy_from_slice(&bytes);
    Some(arr)
}

impl BlobId {
    /// Encode the blob ID as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }

    /// Decode a blob ID from a lowercase hex string.
    ///
    /// Returns `None` if the string is not valid hex or not exactly 32 bytes.
    pub fn from_hex(hex: &str) -> Option<Self> {
        decode_hex32(hex).map(Self)
    }

    /// Short prefix used in log lines.
    pub fn short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..6])
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.to_hex())
    }
}

impl FromStr for BlobId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s.trim()).ok_or_else(|| ParseIdError {
            input: s.to_string(),
        })
    }
}

/// Unique identifier for a storage node in the mesh.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Encode the peer ID as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }

    /// Decode a peer ID from a lowercase hex string.
    pub fn from_hex(hex: &str) -> Option<Self> {
        decode_hex32(hex).map(Self)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&data_encoding::HEXLOWER.encode(&self.0[..4]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// Correlation token carried by a federation query and echoed in its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Opaque identity of whoever invoked the local API.
///
/// The storage core never interprets it; it is handed to the identity seam.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerIdentity(pub String);

impl CallerIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_id_hex_roundtrip() {
        let id = BlobId([42; 32]);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        let parsed: BlobId = hex.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn blob_id_from_hex_invalid() {
        // Too short
        assert!(BlobId::from_hex("abcd").is_none());
        // Not hex
        assert!(BlobId::from_hex(&"zz".repeat(32)).is_none());
        // Uppercase is not the canonical key form
        assert!(BlobId::from_hex(&"AB".repeat(32)).is_none());
        // Too long (33 bytes = 66 hex chars)
        assert!(BlobId::from_hex(&"aa".repeat(33)).is_none());
        // Empty
        assert!(BlobId::from_hex("").is_none());
    }

    #[test]
    fn blob_id_parse_error_mentions_input() {
        let err = "nope".parse::<BlobId>().unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn blob_id_display_is_full_hex() {
        let id = BlobId([0x0f; 32]);
        assert_eq!(id.to_string(), "0f".repeat(32));
        assert_eq!(id.short(), "0f".repeat(6));
    }

    #[test]
    fn peer_id_display_is_short() {
        let id = PeerId([0xab; 32]);
        assert_eq!(id.to_string(), "abababab");
        assert_eq!(PeerId::from_hex(&id.to_hex()), Some(id));
    }
}
