//! TCP transport: one connection per bidirectional stream.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::transport::{Listener, Transport, TransportMetrics};

/// Outbound transport to a node listening at `addr`.
pub struct TcpTransport {
    addr: SocketAddr,
    metrics: TransportMetrics,
}

impl TcpTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            metrics: TransportMetrics::new(),
        }
    }

    /// Address of the remote node.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Transport for TcpTransport {
    type SendStream = OwnedWriteHalf;
    type RecvStream = OwnedReadHalf;

    async fn open_bi_stream(&self) -> Result<(OwnedWriteHalf, OwnedReadHalf)> {
        let stream = match TcpStream::connect(self.addr).await {
            Ok(stream) => stream,
            Err(e) => {
                self.metrics.record_open_failure();
                return Err(e).with_context(|| format!("failed to connect to {}", self.addr));
            }
        };
        stream.set_nodelay(true)?;
        self.metrics.record_stream_opened();
        tracing::debug!(remote = %self.addr, "opened tcp stream");
        let (recv, send) = stream.into_split();
        Ok((send, recv))
    }

    fn transport_metrics(&self) -> &TransportMetrics {
        &self.metrics
    }
}

/// Inbound listener accepting one stream per TCP connection.
pub struct TcpAcceptor {
    listener: TcpListener,
    metrics: TransportMetrics,
}

impl TcpAcceptor {
    /// Bind a listener on `addr` (use port 0 for an ephemeral port).
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        tracing::info!(addr = %listener.local_addr()?, "tcp listener bound");
        Ok(Self {
            listener,
            metrics: TransportMetrics::new(),
        })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }
}

impl Listener for TcpAcceptor {
    type SendStream = OwnedWriteHalf;
    type RecvStream = OwnedReadHalf;

    async fn accept_bi_stream(&self) -> Result<(OwnedWriteHalf, OwnedReadHalf)> {
        let (stream, remote) = self
            .listener
            .accept()
            .await
            .context("tcp accept failed")?;
        stream.set_nodelay(true)?;
        self.metrics.record_stream_accepted();
        tracing::debug!(%remote, "accepted tcp stream");
        let (recv, send) = stream.into_split();
        Ok((send, recv))
    }
}
