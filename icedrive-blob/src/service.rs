//! Local API of a storage node.
//!
//! Callers are checked through an [`IdentityVerifier`]; requests for blobs
//! this node does not hold fall through to the federation resolver.

use std::sync::Arc;

use icedrive_net::directory::PeerDirectory;
use icedrive_protocol::types::{BlobId, CallerIdentity, PeerId};

use crate::error::{BlobError, Result};
use crate::resolver::FederationResolver;
use crate::store::{BlobRecord, BlobStore};
use crate::transfer::{DataTransfer, FileTransfer};

/// A verified caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

/// Decides whether a caller may use the node.
pub trait IdentityVerifier: Send + Sync + 'static {
    fn verify(&self, caller: &CallerIdentity) -> Result<Principal>;
}

/// Admits every caller under its own name.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl IdentityVerifier for AcceptAll {
    fn verify(&self, caller: &CallerIdentity) -> Result<Principal> {
        Ok(Principal {
            name: caller.0.clone(),
        })
    }
}

/// Which link count a link or unlink adjusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The local record; carries the count after the change.
    Local(u64),
    /// The record on this peer.
    Remote(PeerId),
}

pub struct BlobService<D: PeerDirectory, V: IdentityVerifier = AcceptAll> {
    resolver: FederationResolver<D>,
    verifier: V,
}

impl<D: PeerDirectory, V: IdentityVerifier> BlobService<D, V> {
    pub fn new(resolver: FederationResolver<D>, verifier: V) -> Self {
        Self { resolver, verifier }
    }

    pub fn store(&self) -> &Arc<BlobStore> {
        self.resolver.store()
    }

    pub fn resolver(&self) -> &FederationResolver<D> {
        &self.resolver
    }

    fn admit(&self, caller: &CallerIdentity, op: &'static str) -> Result<Principal> {
        let principal = self.verifier.verify(caller).inspect_err(|e| {
            tracing::warn!(caller = %caller.0, op, error = %e, "caller rejected");
        })?;
        tracing::debug!(principal = %principal.name, op, "caller admitted");
        Ok(principal)
    }

    /// Store the content of `source` and return its digest.
    pub async fn upload<S: DataTransfer>(&self, caller: &CallerIdentity, source: S) -> Result<BlobId> {
        self.admit(caller, "upload")?;
        self.store().upload(source).await
    }

    /// Open a session over `blob_id`, fetching it from the mesh if needed.
    pub async fn download(&self, caller: &CallerIdentity, blob_id: BlobId) -> Result<FileTransfer> {
        self.admit(caller, "download")?;
        self.resolver.resolve(blob_id).await
    }

    /// Add a link locally, or on one holding peer if the blob is not local.
    pub async fn link(&self, caller: &CallerIdentity, blob_id: BlobId) -> Result<LinkOutcome> {
        self.admit(caller, "link")?;
        match self.store().link(&blob_id).await {
            Ok(links) => Ok(LinkOutcome::Local(links)),
            Err(BlobError::UnknownBlob(_)) => {
                self.resolver.link_remote(blob_id).await.map(LinkOutcome::Remote)
            }
            Err(e) => Err(e),
        }
    }

    /// Remove a link locally, or on one holding peer if the blob is not local.
    pub async fn unlink(&self, caller: &CallerIdentity, blob_id: BlobId) -> Result<LinkOutcome> {
        self.admit(caller, "unlink")?;
        match self.store().unlink(&blob_id).await {
            Ok(links) => Ok(LinkOutcome::Local(links)),
            Err(BlobError::UnknownBlob(_)) => self
                .resolver
                .unlink_remote(blob_id)
                .await
                .map(LinkOutcome::Remote),
            Err(e) => Err(e),
        }
    }

    /// Blobs held by this node.
    pub fn list(&self, caller: &CallerIdentity) -> Result<Vec<BlobRecord>> {
        self.admit(caller, "list")?;
        self.store().list()
    }
}
