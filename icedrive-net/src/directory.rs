//! Peer discovery: which remote storage nodes a node may consult.

use std::collections::HashMap;
use std::sync::Arc;

use icedrive_protocol::types::PeerId;
use parking_lot::RwLock;

use crate::transport::Transport;

/// A reachable remote node: its identity plus a transport to it.
pub struct PeerHandle<T> {
    pub id: PeerId,
    pub transport: Arc<T>,
}

impl<T> Clone for PeerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            transport: Arc::clone(&self.transport),
        }
    }
}

impl<T> std::fmt::Debug for PeerHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle").field("id", &self.id).finish()
    }
}

/// Source of the current set of known peers.
///
/// The list is a snapshot: peers announced after a call are not part of
/// that call's result.
pub trait PeerDirectory: Send + Sync + 'static {
    type Transport: Transport;

    /// All peers currently known, excluding the local node.
    fn list_peers(&self) -> Vec<PeerHandle<Self::Transport>>;
}

/// Directory backed by an in-memory table, populated from configuration or
/// by explicit announcements.
pub struct StaticDirectory<T> {
    peers: RwLock<HashMap<PeerId, Arc<T>>>,
}

impl<T: Transport> StaticDirectory<T> {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Add or replace a peer. Returns `true` if the peer was not known before.
    ///
    /// Accepts either an owned transport or one already shared with a
    /// listener.
    pub fn announce(&self, id: PeerId, transport: impl Into<Arc<T>>) -> bool {
        let is_new = self.peers.write().insert(id, transport.into()).is_none();
        tracing::debug!(peer = %id, is_new, "peer announced");
        is_new
    }

    /// Remove a peer. Returns `true` if it was known.
    pub fn forget(&self, id: &PeerId) -> bool {
        let removed = self.peers.write().remove(id).is_some();
        if removed {
            tracing::debug!(peer = %id, "peer forgotten");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

impl<T: Transport> Default for StaticDirectory<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> PeerDirectory for StaticDirectory<T> {
    type Transport = T;

    fn list_peers(&self) -> Vec<PeerHandle<T>> {
        self.peers
            .read()
            .iter()
            .map(|(id, transport)| PeerHandle {
                id: *id,
                transport: Arc::clone(transport),
            })
            .collect()
    }
}

impl<D: PeerDirectory> PeerDirectory for Arc<D> {
    type Transport = D::Transport;

    fn list_peers(&self) -> Vec<PeerHandle<Self::Transport>> {
        (**self).list_peers()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::TcpTransport;

    fn peer(n: u8) -> PeerId {
        PeerId([n; 32])
    }

    fn tcp(addr: &str) -> TcpTransport {
        TcpTransport::new(addr.parse().unwrap())
    }

    #[test]
    fn announce_and_forget() {
        let dir: StaticDirectory<TcpTransport> = StaticDirectory::new();
        assert!(dir.is_empty());

        assert!(dir.announce(peer(1), tcp("127.0.0.1:1")));
        assert!(dir.announce(peer(2), tcp("127.0.0.1:2")));
        // Re-announcing replaces the transport, not a new peer.
        assert!(!dir.announce(peer(1), tcp("127.0.0.1:3")));
        assert_eq!(dir.len(), 2);

        assert!(dir.forget(&peer(2)));
        assert!(!dir.forget(&peer(2)));

        let listed = dir.list_peers();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, peer(1));
        assert_eq!(listed[0].transport.addr().port(), 3);
    }

    #[test]
    fn list_is_a_snapshot() {
        let dir: StaticDirectory<TcpTransport> = StaticDirectory::new();
        dir.announce(peer(1), tcp("127.0.0.1:1"));
        let snapshot = dir.list_peers();
        dir.announce(peer(2), tcp("127.0.0.1:2"));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(dir.list_peers().len(), 2);
    }
}
