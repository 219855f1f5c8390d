//! Simulated transport implementing [`Transport`] and [`Listener`].

use anyhow::Result;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};

use crate::transport::{Listener, ListenerClosed, Transport, TransportMetrics};

use super::network::{SimNetworkInner, SimPeerId, StreamPair};

/// Buffer size of each simulated stream direction.
const STREAM_BUFFER: usize = 8192;

/// Simulated transport between two nodes.
///
/// Streams are routed through the [`SimNetwork`](super::SimNetwork), which
/// applies latency, loss, and jitter to their delivery. Bytes inside an
/// accepted stream flow over `tokio::io::DuplexStream`.
pub struct SimTransport {
    pub(crate) local_id: SimPeerId,
    pub(crate) remote_id: SimPeerId,
    pub(crate) network: Arc<SimNetworkInner>,
    pub(crate) stream_rx: Mutex<mpsc::UnboundedReceiver<StreamPair>>,
    pub(crate) metrics: TransportMetrics,
}

impl Transport for SimTransport {
    type SendStream = DuplexStream;
    type RecvStream = DuplexStream;

    async fn open_bi_stream(&self) -> Result<(DuplexStream, DuplexStream)> {
        // Two duplex pairs: one for each direction
        let (a_to_b_write, a_to_b_read) = tokio::io::duplex(STREAM_BUFFER);
        let (b_to_a_write, b_to_a_read) = tokio::io::duplex(STREAM_BUFFER);

        // Deliver the remote end (remote_send, remote_recv) to the peer
        self.network
            .route_stream(
                self.local_id,
                self.remote_id,
                (b_to_a_write, a_to_b_read),
                &self.metrics,
            )
            .await?;

        self.metrics.record_stream_opened();
        tracing::debug!(
            local = self.local_id.0,
            remote = self.remote_id.0,
            "opened sim bi stream"
        );

        // Return the local end (local_send, local_recv)
        Ok((a_to_b_write, b_to_a_read))
    }

    fn transport_metrics(&self) -> &TransportMetrics {
        &self.metrics
    }
}

impl Listener for SimTransport {
    type SendStream = DuplexStream;
    type RecvStream = DuplexStream;

    async fn accept_bi_stream(&self) -> Result<(DuplexStream, DuplexStream)> {
        let mut rx = self.stream_rx.lock().await;
        let (send, recv) = rx.recv().await.ok_or(ListenerClosed)?;
        self.metrics.record_stream_accepted();
        tracing::debug!(
            local = self.local_id.0,
            remote = self.remote_id.0,
            "accepted sim bi stream"
        );
        Ok((send, recv))
    }
}
