//! Service tickets: how a blob node announces where it can be reached.

use data_encoding::BASE32_NOPAD;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::PeerId;

const TICKET_PREFIX: &str = "icedrive1";

/// Everything a node needs to add a blob service to its peer directory.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServiceTicket {
    pub peer_id: PeerId,
    /// Socket address the service listens on, e.g. `10.0.0.1:7400`.
    pub addr: String,
}

/// Errors when parsing a `ServiceTicket` from a string.
#[derive(Debug, Error)]
pub enum TicketError {
    #[error("missing 'icedrive1' prefix")]
    MissingPrefix,
    #[error("invalid base32 encoding: {0}")]
    Base32Decode(#[from] data_encoding::DecodeError),
    #[error("invalid ticket data: {0}")]
    Deserialize(#[from] postcard::Error),
}

/// Derive a node's `PeerId` deterministically from its secret.
pub fn peer_id_from_secret(secret: &[u8; 32]) -> PeerId {
    let hash = Sha256::new()
        .chain_update(b"icedrive-node-v1:")
        .chain_update(secret)
        .finalize();
    let mut id = [0u8; 32];
    id.copy_from_slice(&hash);
    PeerId(id)
}

impl ServiceTicket {
    /// Encode the ticket as an `icedrive1`-prefixed base32 string.
    pub fn to_ticket_string(&self) -> String {
        // A struct of a fixed array and a string cannot fail to serialize.
        let bytes = postcard::to_allocvec(self).unwrap_or_default();
        let encoded = BASE32_NOPAD.encode(&bytes);
        format!("{TICKET_PREFIX}{}", encoded.to_lowercase())
    }

    /// Parse a ticket from an `icedrive1`-prefixed base32 string.
    pub fn from_ticket_str(s: &str) -> Result<Self, TicketError> {
        let b32 = s
            .trim()
            .strip_prefix(TICKET_PREFIX)
            .ok_or(TicketError::MissingPrefix)?;
        let bytes = BASE32_NOPAD.decode(b32.to_uppercase().as_bytes())?;
        let ticket: ServiceTicket = postcard::from_bytes(&bytes)?;
        Ok(ticket)
    }
}

impl std::fmt::Display for ServiceTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_ticket_string())
    }
}

impl std::str::FromStr for ServiceTicket {
    type Err = TicketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_ticket_str(s)
    }
}
