//! Deterministic in-process network simulation harness for testing.
//!
//! Provides [`SimNetwork`] to create simulated nodes that exchange reliable
//! streams via in-process channels, with configurable delivery latency,
//! stream loss, jitter, and disconnection. Federation tests run without real
//! sockets.
//!
//! # Example
//!
//! ```ignore
//! let mut sim = SimNetwork::new();
//! let (peer_a, peer_b) = sim.create_pair().await;
//! sim.set_latency(Duration::from_millis(50)).await;
//!
//! let (mut send, _recv) = peer_a.open_bi_stream().await?;
//! let (_send, mut recv) = peer_b.accept_bi_stream().await?;
//! ```

mod network;
mod peer;
mod transport;

pub use network::{SimNetwork, SimPeerId};
pub use peer::{PeerMetrics, SimPeer};
pub use transport::SimTransport;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::testing::init_test_tracing;

    // --- streams flow both ways ---

    #[tokio::test]
    async fn two_peers_exchange_over_stream() {
        init_test_tracing();

        let mut sim = SimNetwork::new();
        let (peer_a, peer_b) = sim.create_pair().await;

        let (mut a_send, mut a_recv) = peer_a.open_bi_stream().await.unwrap();
        let (mut b_send, mut b_recv) = peer_b.accept_bi_stream().await.unwrap();

        a_send.write_all(b"query").await.unwrap();
        let mut buf = [0u8; 5];
        b_recv.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"query");

        b_send.write_all(b"reply").await.unwrap();
        a_recv.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        assert_eq!(peer_a.streams_opened(), 1);
        assert_eq!(peer_b.streams_accepted(), 1);
    }

    #[tokio::test]
    async fn either_side_can_open() {
        init_test_tracing();

        let mut sim = SimNetwork::new();
        let (peer_a, peer_b) = sim.create_pair().await;

        let (mut b_send, _b_recv) = peer_b.open_bi_stream().await.unwrap();
        let (_a_send, mut a_recv) = peer_a.accept_bi_stream().await.unwrap();

        b_send.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        a_recv.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }

    // --- latency delays delivery of the stream ---

    #[tokio::test(start_paused = true)]
    async fn latency_delays_accept() {
        init_test_tracing();

        let mut sim = SimNetwork::new();
        let (peer_a, peer_b) = sim.create_pair().await;
        sim.set_latency(Duration::from_millis(100)).await;

        let start = tokio::time::Instant::now();
        let _local = peer_a.open_bi_stream().await.unwrap();
        let _remote = peer_b.accept_bi_stream().await.unwrap();
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(100),
            "stream arrived after {elapsed:?}, expected at least 100ms"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn per_link_latency_overrides_default() {
        init_test_tracing();

        let mut sim = SimNetwork::new();
        let a_id = sim.create_peer("alice");
        let b_id = sim.create_peer("bob");
        let (peer_a, peer_b) = sim.connect(a_id, b_id).await;
        sim.set_latency(Duration::from_millis(10)).await;
        sim.set_latency_between(a_id, b_id, Duration::from_secs(2)).await;

        let _local = peer_a.open_bi_stream().await.unwrap();
        let early = tokio::time::timeout(Duration::from_secs(1), peer_b.accept_bi_stream()).await;
        assert!(early.is_err(), "stream should still be in flight after 1s");

        let late = tokio::time::timeout(Duration::from_secs(2), peer_b.accept_bi_stream()).await;
        assert!(late.is_ok(), "stream should arrive after the link latency");
    }

    // --- loss drops streams silently ---

    #[tokio::test(start_paused = true)]
    async fn full_loss_keeps_opener_waiting() {
        init_test_tracing();

        let mut sim = SimNetwork::new();
        let (peer_a, peer_b) = sim.create_pair().await;
        sim.set_loss_rate(1.0).await;

        let (mut a_send, mut a_recv) = peer_a.open_bi_stream().await.unwrap();
        // Writes are buffered even though nobody will read them.
        a_send.write_all(b"anyone?").await.unwrap();

        let accepted =
            tokio::time::timeout(Duration::from_millis(500), peer_b.accept_bi_stream()).await;
        assert!(accepted.is_err(), "lost stream must never be accepted");

        let mut buf = [0u8; 1];
        let reply = tokio::time::timeout(Duration::from_millis(500), a_recv.read(&mut buf)).await;
        assert!(reply.is_err(), "opener should see silence, not a reset");
        assert_eq!(peer_a.streams_dropped(), 1);
    }

    #[tokio::test]
    async fn loss_rate_drops_approximately_half() {
        init_test_tracing();

        let mut sim = SimNetwork::new();
        let (peer_a, peer_b) = sim.create_pair().await;
        sim.set_loss_rate(0.5).await;

        let total = 400u64;
        let mut opened = Vec::new();
        for _ in 0..total {
            opened.push(peer_a.open_bi_stream().await.unwrap());
        }

        let mut accepted = 0u64;
        while let Ok(Ok(_)) =
            tokio::time::timeout(Duration::from_millis(50), peer_b.accept_bi_stream()).await
        {
            accepted += 1;
        }

        let dropped = peer_a.streams_dropped();
        tracing::info!(total, accepted, dropped, "loss rate test results");

        assert!(
            accepted > 120 && accepted < 280,
            "accepted {accepted}, expected ~200 (tolerance 120-280)"
        );
        assert_eq!(accepted + dropped, total);
    }

    // --- disconnect() refuses streams, reconnect() restores them ---

    #[tokio::test]
    async fn disconnect_refuses_streams() {
        init_test_tracing();

        let mut sim = SimNetwork::new();
        let a_id = sim.create_peer("alice");
        let b_id = sim.create_peer("bob");
        let (peer_a, peer_b) = sim.connect(a_id, b_id).await;

        sim.disconnect(b_id).await;
        assert!(peer_a.open_bi_stream().await.is_err());
        assert!(peer_b.open_bi_stream().await.is_err());
        assert_eq!(peer_a.metrics().open_failures.load(std::sync::atomic::Ordering::Relaxed), 1);

        sim.reconnect(b_id).await;
        let _local = peer_a.open_bi_stream().await.unwrap();
        let _remote = peer_b.accept_bi_stream().await.unwrap();
    }

    #[tokio::test]
    async fn seeded_networks_are_deterministic() {
        init_test_tracing();

        async fn losses(seed: u64) -> u64 {
            let mut sim = SimNetwork::with_seed(seed);
            let (peer_a, _peer_b) = sim.create_pair().await;
            sim.set_loss_rate(0.3).await;
            for _ in 0..50 {
                peer_a.open_bi_stream().await.unwrap();
            }
            peer_a.streams_dropped()
        }

        assert_eq!(losses(7).await, losses(7).await);
    }
}
