//! SimNetwork integration tests: deterministic, no real I/O.
//!
//! These tests use `start_paused = true` for instant deterministic time.

use std::time::Duration;

use icedrive_net::directory::PeerDirectory;
use icedrive_net::framing::{read_frame, write_frame};
use icedrive_net::sim::SimNetwork;
use icedrive_net::testing::{init_test_tracing, SimMesh, TestTimer};
use icedrive_net::transport::{Listener, Transport};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// A sender pushes a multi-chunk payload through a stream whose size exceeds
/// the duplex buffer; the receiver gets every byte in order despite latency.
#[tokio::test(start_paused = true)]
async fn sim_payload_over_reliable_stream() {
    init_test_tracing();
    let mut timer = TestTimer::new("sim_payload_over_reliable_stream");

    let mut sim = SimNetwork::new();
    let (peer_a, peer_b) = sim.create_pair().await;
    sim.set_latency(Duration::from_millis(50)).await;
    timer.phase("network_setup");

    let original: Vec<u8> = (0..10 * 1024).map(|i| (i % 251) as u8).collect();

    let (mut a_send, _a_recv) = peer_a.open_bi_stream().await.unwrap();
    let (_b_send, mut b_recv) = peer_b.accept_bi_stream().await.unwrap();
    timer.phase("stream_open");

    // Send and receive concurrently: the duplex buffer (8KB) is smaller than
    // the payload (10KB), so send-then-receive would deadlock.
    let (_, received) = tokio::join!(
        async {
            for chunk in original.chunks(1024) {
                a_send.write_all(chunk).await.unwrap();
            }
            a_send.shutdown().await.unwrap();
        },
        async {
            let mut received = Vec::new();
            b_recv.read_to_end(&mut received).await.unwrap();
            received
        }
    );
    timer.phase("transfer_complete");

    assert_eq!(received, original, "data integrity check failed");
}

/// Framed request/response exchange across the simulated link.
#[tokio::test(start_paused = true)]
async fn sim_framed_request_response() {
    init_test_tracing();

    let mut sim = SimNetwork::new();
    let (client, server) = sim.create_pair().await;
    sim.set_latency(Duration::from_millis(20)).await;

    let server_task = tokio::spawn(async move {
        let (mut send, mut recv) = server.accept_bi_stream().await.unwrap();
        let request: String = read_frame(&mut recv).await.unwrap().unwrap();
        write_frame(&mut send, &format!("echo:{request}")).await.unwrap();
        // The client closes its side after the reply.
        let end: Option<String> = read_frame(&mut recv).await.unwrap();
        assert!(end.is_none());
    });

    let (mut send, mut recv) = client.open_bi_stream().await.unwrap();
    write_frame(&mut send, &"ping".to_string()).await.unwrap();
    let reply: String = read_frame(&mut recv).await.unwrap().unwrap();
    assert_eq!(reply, "echo:ping");
    send.shutdown().await.unwrap();

    server_task.await.unwrap();
}

/// A node that goes offline refuses streams; back online, streams flow again.
#[tokio::test(start_paused = true)]
async fn sim_disconnect_reconnect_with_latency() {
    init_test_tracing();

    let mut sim = SimNetwork::new();
    let a_id = sim.create_peer("alice");
    let b_id = sim.create_peer("bob");
    let (peer_a, peer_b) = sim.connect(a_id, b_id).await;
    sim.set_latency(Duration::from_millis(25)).await;

    for _ in 0..3 {
        peer_a.open_bi_stream().await.unwrap();
        peer_b.accept_bi_stream().await.unwrap();
    }

    sim.disconnect(a_id).await;
    for _ in 0..3 {
        assert!(peer_a.open_bi_stream().await.is_err());
    }
    let nothing = tokio::time::timeout(Duration::from_millis(100), peer_b.accept_bi_stream()).await;
    assert!(nothing.is_err(), "no stream should arrive while disconnected");

    sim.reconnect(a_id).await;
    peer_a.open_bi_stream().await.unwrap();
    peer_b.accept_bi_stream().await.unwrap();

    assert_eq!(peer_a.streams_opened(), 4);
    assert_eq!(peer_b.streams_accepted(), 4);
}

/// Every mesh node sees every other node and can reach it.
#[tokio::test(start_paused = true)]
async fn sim_mesh_is_fully_connected() {
    init_test_tracing();

    let mesh = SimMesh::new(3).await;
    for node in &mesh.nodes {
        let peers = node.directory.list_peers();
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().all(|p| p.id != node.peer_id));
        assert_eq!(node.listeners.len(), 2);
    }

    // Node 0 opens to node 2; node 2 accepts on its link from node 0.
    let to_two = mesh.nodes[0]
        .directory
        .list_peers()
        .into_iter()
        .find(|p| p.id == mesh.nodes[2].peer_id)
        .unwrap();
    let (mut send, _recv) = to_two.transport.open_bi_stream().await.unwrap();
    send.write_all(b"hi").await.unwrap();

    let (_, from_zero) = mesh.nodes[2]
        .listeners
        .iter()
        .find(|(id, _)| *id == mesh.nodes[0].peer_id)
        .unwrap();
    let (_send, mut recv) = from_zero.accept_bi_stream().await.unwrap();
    let mut buf = [0u8; 2];
    recv.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");
}
