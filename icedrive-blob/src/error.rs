//! Error types for blob storage and transfer sessions.

use std::io;
use std::time::Duration;

use icedrive_protocol::types::BlobId;
use thiserror::Error;

/// Failure of a single transfer session.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer session is closed")]
    Closed,

    #[error("transfer I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("no data within {0:?}")]
    TimedOut(Duration),

    #[error("remote side failed the transfer: {reason}")]
    Remote { reason: String },

    #[error("stream ended before the transfer completed")]
    UnexpectedEof,
}

/// Errors surfaced by the blob store, the federation resolver, and the
/// service facade.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("unknown blob {0}")]
    UnknownBlob(BlobId),

    #[error("failed to read blob content: {0}")]
    ReadFailure(#[from] TransferError),

    #[error("no peer answered for blob {blob_id} within {timeout:?}")]
    ResolutionTimeout { blob_id: BlobId, timeout: Duration },

    #[error("peer sent blob {actual} when {expected} was requested")]
    DigestMismatch { expected: BlobId, actual: BlobId },

    #[error("caller {0:?} is not authorized")]
    Unauthorized(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage I/O failed: {0}")]
    Storage(#[from] io::Error),

    #[error("metadata store failed: {0}")]
    Metadata(#[from] rusqlite::Error),
}

impl BlobError {
    /// Whether the blob could not be found locally or in the mesh.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BlobError::UnknownBlob(_) | BlobError::ResolutionTimeout { .. }
        )
    }
}

pub type Result<T, E = BlobError> = std::result::Result<T, E>;
