//! Node-to-node plumbing: transports, framing, peer discovery, and a
//! simulated network for tests.

pub mod directory;
pub mod framing;
pub mod sim;
pub mod tcp;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use directory::{PeerDirectory, PeerHandle, StaticDirectory};
pub use tcp::{TcpAcceptor, TcpTransport};
pub use transport::{Listener, ListenerClosed, Transport, TransportMetrics};
