//! Simulation network controller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::transport::TransportMetrics;

use super::peer::SimPeer;
use super::transport::SimTransport;

/// Unique identifier for a simulated node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimPeerId(pub u64);

/// One end of a simulated bidirectional stream: (send half, recv half).
pub(crate) type StreamPair = (DuplexStream, DuplexStream);

/// Configuration for a single network link direction.
#[derive(Debug, Clone, Default)]
struct LinkConfig {
    latency: Option<Duration>,
    loss_rate: Option<f64>,
    jitter: Option<Duration>,
}

/// Shared interior of the simulation network.
pub(crate) struct SimNetworkInner {
    /// Per-link configuration overrides.
    link_configs: RwLock<HashMap<(SimPeerId, SimPeerId), LinkConfig>>,
    /// Default one-way latency before a stream reaches the remote accept queue.
    default_latency: RwLock<Duration>,
    /// Default probability (0.0–1.0) that an opened stream never arrives.
    default_loss_rate: RwLock<f64>,
    /// Default maximum jitter.
    default_jitter: RwLock<Duration>,
    /// Set of disconnected peers.
    disconnected: RwLock<HashSet<SimPeerId>>,
    /// Accept queues keyed by (local_peer, remote_peer).
    delivery: RwLock<HashMap<(SimPeerId, SimPeerId), mpsc::UnboundedSender<StreamPair>>>,
    /// Remote ends of lost streams, held open so the opener sees silence
    /// rather than a reset.
    lost: Mutex<Vec<StreamPair>>,
    /// Seeded RNG for deterministic loss/jitter.
    rng: Mutex<StdRng>,
}

impl SimNetworkInner {
    /// Deliver the remote end of a stream from `from` to `to`, applying
    /// disconnection, loss, latency, and jitter.
    pub(crate) async fn route_stream(
        &self,
        from: SimPeerId,
        to: SimPeerId,
        remote_end: StreamPair,
        sender_metrics: &TransportMetrics,
    ) -> Result<()> {
        {
            let disconnected = self.disconnected.read().await;
            if disconnected.contains(&from) || disconnected.contains(&to) {
                sender_metrics.record_open_failure();
                tracing::trace!(from = from.0, to = to.0, "stream refused: peer disconnected");
                anyhow::bail!("sim peer {} unreachable from {}", to.0, from.0);
            }
        }

        let (latency, loss_rate, jitter) = self.effective_link_config(from, to).await;

        let should_drop = if loss_rate > 0.0 {
            let mut rng = self.rng.lock().await;
            rng.random_bool(loss_rate.clamp(0.0, 1.0))
        } else {
            false
        };

        if should_drop {
            sender_metrics.record_stream_dropped();
            tracing::trace!(from = from.0, to = to.0, "stream lost by loss simulation");
            self.lost.lock().await.push(remote_end);
            return Ok(());
        }

        let delay = if jitter > Duration::ZERO {
            let mut rng = self.rng.lock().await;
            let jitter_ns = rng.random_range(0..jitter.as_nanos() as u64);
            latency + Duration::from_nanos(jitter_ns)
        } else {
            latency
        };

        // Delivering to the transport at (to, from)
        let tx = {
            let delivery = self.delivery.read().await;
            delivery
                .get(&(to, from))
                .context("no delivery channel for peer pair (stream)")?
                .clone()
        };

        if delay > Duration::ZERO {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(remote_end);
            });
        } else {
            tx.send(remote_end)
                .map_err(|_| anyhow::anyhow!("stream delivery channel closed"))?;
        }

        Ok(())
    }

    /// Get the effective latency, loss rate, and jitter for a link.
    async fn effective_link_config(
        &self,
        from: SimPeerId,
        to: SimPeerId,
    ) -> (Duration, f64, Duration) {
        let configs = self.link_configs.read().await;
        let config = configs.get(&(from, to));
        let default_latency = *self.default_latency.read().await;
        let default_loss_rate = *self.default_loss_rate.read().await;
        let default_jitter = *self.default_jitter.read().await;

        (
            config.and_then(|c| c.latency).unwrap_or(default_latency),
            config
                .and_then(|c| c.loss_rate)
                .unwrap_or(default_loss_rate),
            config.and_then(|c| c.jitter).unwrap_or(default_jitter),
        )
    }
}

/// Simulation network controller.
///
/// Creates simulated nodes, manages connections between them, and controls
/// network conditions (latency, loss, jitter, disconnection).
pub struct SimNetwork {
    inner: Arc<SimNetworkInner>,
    next_id: u64,
}

impl SimNetwork {
    /// Create a new simulation network with default seed (42).
    pub fn new() -> Self {
        Self::with_seed(42)
    }

    /// Create a new simulation network with a specific RNG seed.
    pub fn with_seed(seed: u64) -> Self {
        tracing::info!(seed, "created sim network");
        Self {
            inner: Arc::new(SimNetworkInner {
                link_configs: RwLock::new(HashMap::new()),
                default_latency: RwLock::new(Duration::ZERO),
                default_loss_rate: RwLock::new(0.0),
                default_jitter: RwLock::new(Duration::ZERO),
                disconnected: RwLock::new(HashSet::new()),
                delivery: RwLock::new(HashMap::new()),
                lost: Mutex::new(Vec::new()),
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
            }),
            next_id: 0,
        }
    }

    /// Create a new node identity (not yet connected to anyone).
    pub fn create_peer(&mut self, name: &str) -> SimPeerId {
        let id = SimPeerId(self.next_id);
        self.next_id += 1;
        tracing::info!(peer_id = id.0, name, "created sim peer");
        id
    }

    /// Connect two nodes, returning a `SimPeer` for each side.
    ///
    /// The `SimPeer` for `a` opens streams towards `b` and accepts the
    /// streams `b` opens, and vice versa.
    pub async fn connect(&self, a: SimPeerId, b: SimPeerId) -> (SimPeer, SimPeer) {
        let (a_stream_tx, a_stream_rx) = mpsc::unbounded_channel();
        let (b_stream_tx, b_stream_rx) = mpsc::unbounded_channel();

        // (a, b) = transport A (local=a, remote=b) accepts streams here
        // (b, a) = transport B (local=b, remote=a) accepts streams here
        {
            let mut delivery = self.inner.delivery.write().await;
            delivery.insert((a, b), a_stream_tx);
            delivery.insert((b, a), b_stream_tx);
        }

        let transport_a = SimTransport {
            local_id: a,
            remote_id: b,
            network: self.inner.clone(),
            stream_rx: Mutex::new(a_stream_rx),
            metrics: TransportMetrics::new(),
        };

        let transport_b = SimTransport {
            local_id: b,
            remote_id: a,
            network: self.inner.clone(),
            stream_rx: Mutex::new(b_stream_rx),
            metrics: TransportMetrics::new(),
        };

        tracing::info!(peer_a = a.0, peer_b = b.0, "connected sim peers");

        (
            SimPeer::new(a, format!("peer-{}", a.0), transport_a),
            SimPeer::new(b, format!("peer-{}", b.0), transport_b),
        )
    }

    /// Shorthand: create two nodes and connect them.
    pub async fn create_pair(&mut self) -> (SimPeer, SimPeer) {
        let a = self.create_peer("peer-a");
        let b = self.create_peer("peer-b");
        self.connect(a, b).await
    }

    /// Set the default one-way latency for all links.
    pub async fn set_latency(&self, duration: Duration) {
        *self.inner.default_latency.write().await = duration;
        tracing::debug!(?duration, "set default latency");
    }

    /// Set latency for a specific link (bidirectional).
    pub async fn set_latency_between(&self, a: SimPeerId, b: SimPeerId, duration: Duration) {
        let mut configs = self.inner.link_configs.write().await;
        configs.entry((a, b)).or_default().latency = Some(duration);
        configs.entry((b, a)).or_default().latency = Some(duration);
        tracing::debug!(a = a.0, b = b.0, ?duration, "set link latency");
    }

    /// Set the default stream loss rate for all links (0.0–1.0).
    pub async fn set_loss_rate(&self, rate: f64) {
        *self.inner.default_loss_rate.write().await = rate;
        tracing::debug!(rate, "set default loss rate");
    }

    /// Set loss rate for a specific link (bidirectional).
    pub async fn set_loss_rate_between(&self, a: SimPeerId, b: SimPeerId, rate: f64) {
        let mut configs = self.inner.link_configs.write().await;
        configs.entry((a, b)).or_default().loss_rate = Some(rate);
        configs.entry((b, a)).or_default().loss_rate = Some(rate);
        tracing::debug!(a = a.0, b = b.0, rate, "set link loss rate");
    }

    /// Set the default maximum jitter for all links.
    pub async fn set_jitter(&self, max_jitter: Duration) {
        *self.inner.default_jitter.write().await = max_jitter;
        tracing::debug!(?max_jitter, "set default jitter");
    }

    /// Simulate a node going offline (opening streams to or from it fails).
    pub async fn disconnect(&self, peer: SimPeerId) {
        self.inner.disconnected.write().await.insert(peer);
        tracing::info!(peer = peer.0, "sim peer disconnected");
    }

    /// Simulate a node coming back online.
    pub async fn reconnect(&self, peer: SimPeerId) {
        self.inner.disconnected.write().await.remove(&peer);
        tracing::info!(peer = peer.0, "sim peer reconnected");
    }

    /// Advance simulated time.
    ///
    /// When used with `tokio::time::pause()`, this advances the simulated clock,
    /// causing pending `sleep` futures (used for latency simulation) to resolve.
    pub async fn advance(&self, duration: Duration) {
        tokio::time::advance(duration).await;
    }
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}
