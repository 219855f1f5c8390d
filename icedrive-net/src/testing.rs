//! Shared test utilities for icedrive tests.
//!
//! Available behind the `test-util` feature or in `#[cfg(test)]` within
//! icedrive-net. Provides tracing setup, phase timing instrumentation, and a
//! helper for wiring simulated nodes into a peer directory.

use std::sync::Arc;
use std::time::Duration;

use icedrive_protocol::types::PeerId;

use crate::directory::StaticDirectory;
use crate::sim::{SimNetwork, SimPeerId, SimTransport};

/// Initialise a tracing subscriber for tests.
///
/// Respects the `RUST_LOG` environment variable, defaults to `debug`.
/// Uses `with_test_writer()` to integrate with `cargo test` output capture.
/// Safe to call multiple times; later calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Timing instrumentation for test phases.
///
/// Records the duration of each named phase and logs a summary on drop.
///
/// # Example
///
/// ```ignore
/// let mut timer = TestTimer::new("resolve_from_single_holder");
/// let mesh = SimMesh::new(3).await;
/// timer.phase("mesh_setup");
/// // ...
/// timer.phase("resolve");
/// // timer logs summary on drop
/// ```
pub struct TestTimer {
    test_name: String,
    start: std::time::Instant,
    last: std::time::Instant,
    phases: Vec<(String, Duration)>,
}

impl TestTimer {
    /// Create a new timer for a test.
    pub fn new(test_name: &str) -> Self {
        let now = std::time::Instant::now();
        tracing::info!(target: "icedrive_test::timer", test = test_name, "test started");
        Self {
            test_name: test_name.to_string(),
            start: now,
            last: now,
            phases: Vec::new(),
        }
    }

    /// Record the end of a named phase.
    pub fn phase(&mut self, name: &str) {
        let now = std::time::Instant::now();
        let duration = now - self.last;
        tracing::info!(
            target: "icedrive_test::timer",
            test = %self.test_name,
            phase = name,
            duration_ms = duration.as_millis() as u64,
            elapsed_ms = (now - self.start).as_millis() as u64,
            "phase complete"
        );
        self.phases.push((name.to_string(), duration));
        self.last = now;
    }
}

impl Drop for TestTimer {
    fn drop(&mut self) {
        tracing::info!(
            target: "icedrive_test::timer",
            test = %self.test_name,
            total_ms = self.start.elapsed().as_millis() as u64,
            phase_count = self.phases.len(),
            "test timing summary"
        );
    }
}

/// Deterministic node identity for simulated node number `n`.
pub fn sim_peer_id(n: u64) -> PeerId {
    let mut id = [0u8; 32];
    id[..8].copy_from_slice(&n.to_be_bytes());
    PeerId(id)
}

/// One node of a [`SimMesh`].
pub struct SimNode {
    /// Identity the other nodes know this node by.
    pub peer_id: PeerId,
    /// Outbound transports to every other node.
    pub directory: Arc<StaticDirectory<SimTransport>>,
    /// Inbound side of each link, paired with the remote node's identity.
    pub listeners: Vec<(PeerId, Arc<SimTransport>)>,
}

/// A fully connected mesh of simulated nodes.
pub struct SimMesh {
    pub network: SimNetwork,
    pub sim_ids: Vec<SimPeerId>,
    pub nodes: Vec<SimNode>,
}

impl SimMesh {
    /// Create `count` nodes and connect every pair.
    pub async fn new(count: usize) -> Self {
        let mut network = SimNetwork::new();
        let sim_ids: Vec<SimPeerId> = (0..count)
            .map(|i| network.create_peer(&format!("node-{i}")))
            .collect();
        let mut nodes: Vec<SimNode> = (0..count)
            .map(|i| SimNode {
                peer_id: sim_peer_id(i as u64),
                directory: Arc::new(StaticDirectory::new()),
                listeners: Vec::new(),
            })
            .collect();

        for i in 0..count {
            for j in (i + 1)..count {
                let (side_i, side_j) = network.connect(sim_ids[i], sim_ids[j]).await;
                let (pi, pj) = (nodes[i].peer_id, nodes[j].peer_id);
                nodes[i].directory.announce(pj, side_i.transport());
                nodes[i].listeners.push((pj, side_i.transport()));
                nodes[j].directory.announce(pi, side_j.transport());
                nodes[j].listeners.push((pi, side_j.transport()));
            }
        }

        Self {
            network,
            sim_ids,
            nodes,
        }
    }
}
