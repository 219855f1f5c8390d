//! Shared helpers for node integration tests.
//!
//! Tracing and timing come from `icedrive_net::testing`.


use icedrive_node::{Node, RunningServer, Settings};
use icedrive_protocol::ticket::ServiceTicket;
use tempfile::TempDir;

pub use icedrive_net::testing::{init_test_tracing, TestTimer};

/// A node with its own storage directory and a running query server.
pub struct TestNode {
    pub node: Node,
    pub running: RunningServer,
    pub _dir: TempDir,
}

impl TestNode {
    pub fn ticket(&self) -> ServiceTicket {
        self.running.ticket().clone()
    }
}

/// Start a node on an ephemeral loopback port that knows `peers`.
pub async fn start_node(peers: &[ServiceTicket]) -> TestNode {
    let dir = TempDir::new().unwrap();
    let settings = Settings {
        storage_dir: dir.path().join("data"),
        listen_addr: "127.0.0.1:0".into(),
        peers: peers.iter().map(ToString::to_string).collect(),
        query_timeout_ms: 2_000,
        read_timeout_ms: 2_000,
        ..Settings::default()
    };
    let node = Node::open(&settings).unwrap();
    let running = node
        .spawn_server(settings.listen_addr.parse().unwrap())
        .await
        .unwrap();
    TestNode {
        node,
        running,
        _dir: dir,
    }
}

/// Make two started nodes aware of each other.
pub fn introduce(a: &TestNode, b: &TestNode) {
    assert!(a.node.add_peer(&b.ticket()).unwrap());
    assert!(b.node.add_peer(&a.ticket()).unwrap());
}

