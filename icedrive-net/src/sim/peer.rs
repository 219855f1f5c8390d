//! Simulated node endpoint wrapping a [`SimTransport`].

use anyhow::Result;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::DuplexStream;

use crate::transport::{Listener, Transport, TransportMetrics};

use super::network::SimPeerId;
use super::transport::SimTransport;

/// Peer metrics are the transport metrics.
pub type PeerMetrics = TransportMetrics;

/// One side of a simulated connection between two nodes.
pub struct SimPeer {
    id: SimPeerId,
    name: String,
    transport: Arc<SimTransport>,
}

impl SimPeer {
    pub(crate) fn new(id: SimPeerId, name: String, transport: SimTransport) -> Self {
        Self {
            id,
            name,
            transport: Arc::new(transport),
        }
    }

    /// Get the peer's identifier.
    pub fn id(&self) -> SimPeerId {
        self.id
    }

    /// Get the peer's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a reliable bidirectional stream to the connected node.
    pub async fn open_bi_stream(&self) -> Result<(DuplexStream, DuplexStream)> {
        self.transport.open_bi_stream().await
    }

    /// Accept a reliable bidirectional stream opened by the connected node.
    pub async fn accept_bi_stream(&self) -> Result<(DuplexStream, DuplexStream)> {
        self.transport.accept_bi_stream().await
    }

    /// Get peer metrics (streams opened, accepted, lost).
    pub fn metrics(&self) -> &PeerMetrics {
        self.transport.transport_metrics()
    }

    /// Get the number of streams opened from this side.
    pub fn streams_opened(&self) -> u64 {
        self.metrics().streams_opened.load(Ordering::Relaxed)
    }

    /// Get the number of streams accepted on this side.
    pub fn streams_accepted(&self) -> u64 {
        self.metrics().streams_accepted.load(Ordering::Relaxed)
    }

    /// Get the number of streams from this side lost by the network.
    pub fn streams_dropped(&self) -> u64 {
        self.metrics().streams_dropped.load(Ordering::Relaxed)
    }

    /// Shared handle to the underlying transport, usable both as a
    /// [`Transport`] and a [`Listener`].
    pub fn transport(&self) -> Arc<SimTransport> {
        Arc::clone(&self.transport)
    }
}
