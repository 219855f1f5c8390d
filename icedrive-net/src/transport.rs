//! Abstract transport traits for node-to-node communication.
//!
//! Defines [`Transport`] (outbound streams to one remote node) and
//! [`Listener`] (inbound streams from remote nodes), implemented by both the
//! TCP transport ([`TcpTransport`](crate::tcp::TcpTransport)) and simulated
//! connections ([`SimTransport`](crate::sim::SimTransport)) for testing.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;

/// Returned by [`Listener::accept_bi_stream`] once the listener can never
/// produce another stream. Any other accept error is transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("listener closed")]
pub struct ListenerClosed;

/// Metrics tracked by a transport implementation.
pub struct TransportMetrics {
    pub streams_opened: AtomicU64,
    pub streams_accepted: AtomicU64,
    pub streams_dropped: AtomicU64,
    pub open_failures: AtomicU64,
}

impl TransportMetrics {
    /// Create new zeroed metrics.
    pub fn new() -> Self {
        Self {
            streams_opened: AtomicU64::new(0),
            streams_accepted: AtomicU64::new(0),
            streams_dropped: AtomicU64::new(0),
            open_failures: AtomicU64::new(0),
        }
    }

    /// Record an opened stream.
    pub fn record_stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an accepted stream.
    pub fn record_stream_accepted(&self) {
        self.streams_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stream lost in transit (it will never be accepted).
    pub fn record_stream_dropped(&self) {
        self.streams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed attempt to open a stream.
    pub fn record_open_failure(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for TransportMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound side of a connection to one remote node.
///
/// Futures are declared `Send` so callers can drive queries from spawned tasks.
pub trait Transport: Send + Sync + 'static {
    /// The send half of a bidirectional stream.
    type SendStream: tokio::io::AsyncWrite + Send + Unpin + 'static;
    /// The receive half of a bidirectional stream.
    type RecvStream: tokio::io::AsyncRead + Send + Unpin + 'static;

    /// Open a reliable bidirectional stream to the remote node.
    fn open_bi_stream(
        &self,
    ) -> impl Future<Output = Result<(Self::SendStream, Self::RecvStream)>> + Send;

    /// Get transport metrics.
    fn transport_metrics(&self) -> &TransportMetrics;
}

/// Inbound side: yields streams opened by remote nodes.
pub trait Listener: Send + Sync + 'static {
    /// The send half of a bidirectional stream.
    type SendStream: tokio::io::AsyncWrite + Send + Unpin + 'static;
    /// The receive half of a bidirectional stream.
    type RecvStream: tokio::io::AsyncRead + Send + Unpin + 'static;

    /// Accept the next reliable bidirectional stream.
    ///
    /// Fails with [`ListenerClosed`] once the listener can produce no more
    /// streams; other errors concern this one accept only.
    fn accept_bi_stream(
        &self,
    ) -> impl Future<Output = Result<(Self::SendStream, Self::RecvStream)>> + Send;
}

impl<T: Transport> Transport for std::sync::Arc<T> {
    type SendStream = T::SendStream;
    type RecvStream = T::RecvStream;

    fn open_bi_stream(
        &self,
    ) -> impl Future<Output = Result<(Self::SendStream, Self::RecvStream)>> + Send {
        (**self).open_bi_stream()
    }

    fn transport_metrics(&self) -> &TransportMetrics {
        (**self).transport_metrics()
    }
}

impl<L: Listener> Listener for std::sync::Arc<L> {
    type SendStream = L::SendStream;
    type RecvStream = L::RecvStream;

    fn accept_bi_stream(
        &self,
    ) -> impl Future<Output = Result<(Self::SendStream, Self::RecvStream)>> + Send {
        (**self).accept_bi_stream()
    }
}
