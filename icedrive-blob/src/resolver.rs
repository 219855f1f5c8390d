//! Outbound half of federation: resolves blobs this node does not hold by
//! asking every known peer.
//!
//! A query goes to all peers at once, one task per peer. The first positive
//! answer fills the pending query's reply slot; later answers are dropped,
//! which also closes any transfer session they opened. The caller waits at
//! most `query_timeout` for that first answer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use icedrive_net::directory::{PeerDirectory, PeerHandle};
use icedrive_net::framing::{read_frame, write_frame};
use icedrive_net::transport::Transport;
use icedrive_protocol::query::{BlobQuery, BlobQueryResponse, QueryKind, QueryOutcome};
use icedrive_protocol::types::{BlobId, PeerId};

use crate::error::{BlobError, Result};
use crate::pending::{PendingQueries, QueryState};
use crate::remote::RemoteTransfer;
use crate::store::BlobStore;
use crate::transfer::FileTransfer;

/// Default bound on one resolution attempt.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on one remote read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeouts applied to federation traffic.
#[derive(Debug, Clone, Copy)]
pub struct ResolverConfig {
    /// How long to wait for the first positive answer.
    pub query_timeout: Duration,
    /// How long a single chunk of a remote transfer may take.
    pub read_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Counters for outbound federation traffic.
#[derive(Debug, Default)]
pub struct FederationMetrics {
    pub queries_sent: AtomicU64,
    pub positive_replies: AtomicU64,
    pub late_replies_discarded: AtomicU64,
    pub peer_failures: AtomicU64,
    pub timeouts: AtomicU64,
    pub resolved: AtomicU64,
}

type StreamsOf<D> = (
    <<D as PeerDirectory>::Transport as Transport>::SendStream,
    <<D as PeerDirectory>::Transport as Transport>::RecvStream,
);

type RemoteSession<D> = RemoteTransfer<
    <<D as PeerDirectory>::Transport as Transport>::SendStream,
    <<D as PeerDirectory>::Transport as Transport>::RecvStream,
>;

type Holder<D> = PeerHandle<<D as PeerDirectory>::Transport>;

/// Resolves blobs across the mesh described by a [`PeerDirectory`].
pub struct FederationResolver<D: PeerDirectory> {
    store: Arc<BlobStore>,
    directory: D,
    config: ResolverConfig,
    downloads: Arc<PendingQueries<RemoteSession<D>>>,
    lookups: Arc<PendingQueries<Holder<D>>>,
    metrics: Arc<FederationMetrics>,
}

impl<D: PeerDirectory> FederationResolver<D> {
    pub fn new(store: Arc<BlobStore>, directory: D, config: ResolverConfig) -> Self {
        Self {
            store,
            directory,
            config,
            downloads: Arc::new(PendingQueries::new()),
            lookups: Arc::new(PendingQueries::new()),
            metrics: Arc::new(FederationMetrics::default()),
        }
    }

    pub fn store(&self) -> &Arc<BlobStore> {
        &self.store
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn config(&self) -> ResolverConfig {
        self.config
    }

    pub fn metrics(&self) -> &FederationMetrics {
        &self.metrics
    }

    /// Number of queries still waiting for an answer.
    pub fn pending(&self) -> usize {
        self.downloads.len() + self.lookups.len()
    }

    /// Open a session over `blob_id`, fetching it from a peer first if it is
    /// not held locally.
    ///
    /// A fetched blob is committed locally with its own link count of one
    /// (or gains a link if a concurrent fetch committed it first).
    pub async fn resolve(&self, blob_id: BlobId) -> Result<FileTransfer> {
        match self.store.download(&blob_id).await {
            Err(BlobError::UnknownBlob(_)) => {}
            local => return local,
        }

        let read_timeout = self.config.read_timeout;
        let (peer, session) = self
            .fan_out(
                &self.downloads,
                blob_id,
                QueryKind::DownloadBlob,
                move |_, (send, recv)| RemoteTransfer::new(send, recv, read_timeout),
            )
            .await?;

        let received = self.store.insert_from_remote(session).await?;
        if received != blob_id {
            tracing::warn!(
                expected = %blob_id,
                actual = %received,
                peer = %peer,
                "peer sent different content than requested"
            );
            self.store.unlink(&received).await?;
            return Err(BlobError::DigestMismatch {
                expected: blob_id,
                actual: received,
            });
        }

        self.metrics.resolved.fetch_add(1, Ordering::Relaxed);
        tracing::info!(blob_id = %blob_id, peer = %peer, "blob resolved from peer");
        self.store.download(&blob_id).await
    }

    /// Find one peer holding `blob_id`.
    pub async fn locate(&self, blob_id: BlobId) -> Result<PeerId> {
        self.locate_holder(blob_id).await.map(|holder| holder.id)
    }

    /// Add a link to `blob_id` on exactly one peer that holds it.
    pub async fn link_remote(&self, blob_id: BlobId) -> Result<PeerId> {
        self.adjust_remote(blob_id, QueryKind::LinkBlob).await
    }

    /// Remove a link from `blob_id` on exactly one peer that holds it.
    pub async fn unlink_remote(&self, blob_id: BlobId) -> Result<PeerId> {
        self.adjust_remote(blob_id, QueryKind::UnlinkBlob).await
    }

    async fn locate_holder(&self, blob_id: BlobId) -> Result<Holder<D>> {
        let (_, holder) = self
            .fan_out(
                &self.lookups,
                blob_id,
                QueryKind::DoesBlobExist,
                |peer: &Holder<D>, _streams| peer.clone(),
            )
            .await?;
        Ok(holder)
    }

    async fn adjust_remote(&self, blob_id: BlobId, kind: QueryKind) -> Result<PeerId> {
        let holder = self.locate_holder(blob_id).await?;
        let query = BlobQuery {
            query_id: self.lookups.next_id(),
            blob_id,
            kind,
        };
        self.metrics.queries_sent.fetch_add(1, Ordering::Relaxed);

        let answer =
            tokio::time::timeout(self.config.query_timeout, ask_peer(&*holder.transport, &query))
                .await;
        match answer {
            Ok(Ok(Some(_))) => {
                tracing::info!(blob_id = %blob_id, peer = %holder.id, kind = ?kind, "remote link count adjusted");
                Ok(holder.id)
            }
            // Reclaimed on the holder between locate and the adjustment.
            Ok(Ok(None)) => Err(BlobError::UnknownBlob(blob_id)),
            Ok(Err(e)) => {
                self.metrics.peer_failures.fetch_add(1, Ordering::Relaxed);
                Err(BlobError::Protocol(format!("peer {}: {e:#}", holder.id)))
            }
            Err(_) => {
                self.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(BlobError::ResolutionTimeout {
                    blob_id,
                    timeout: self.config.query_timeout,
                })
            }
        }
    }

    /// Send `kind` for `blob_id` to every peer and wait for the first
    /// positive answer, which `wrap` turns into the payload handed back.
    async fn fan_out<P, W>(
        &self,
        registry: &Arc<PendingQueries<P>>,
        blob_id: BlobId,
        kind: QueryKind,
        wrap: W,
    ) -> Result<(PeerId, P)>
    where
        P: Send + 'static,
        W: Fn(&Holder<D>, StreamsOf<D>) -> P + Clone + Send + Sync + 'static,
    {
        let peers = self.directory.list_peers();
        if peers.is_empty() {
            tracing::debug!(blob_id = %blob_id.short(), "no peers to ask");
            return Err(BlobError::UnknownBlob(blob_id));
        }

        let timeout = self.config.query_timeout;
        let (query_id, reply) = registry.register(blob_id, peers.len());
        let _guard = registry.guard(query_id);
        tracing::debug!(
            query_id = %query_id,
            blob_id = %blob_id.short(),
            kind = ?kind,
            peers = peers.len(),
            "fanning out query"
        );

        for peer in peers {
            let query = BlobQuery {
                query_id,
                blob_id,
                kind,
            };
            let registry = Arc::clone(registry);
            let metrics = Arc::clone(&self.metrics);
            let wrap = wrap.clone();
            self.metrics.queries_sent.fetch_add(1, Ordering::Relaxed);

            tokio::spawn(async move {
                let answer =
                    tokio::time::timeout(timeout, ask_peer(&*peer.transport, &query)).await;
                match answer {
                    Ok(Ok(Some(streams))) => {
                        let payload = wrap(&peer, streams);
                        match registry.complete(query_id, peer.id, payload) {
                            Ok(()) => {
                                metrics.positive_replies.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(_late) => {
                                metrics
                                    .late_replies_discarded
                                    .fetch_add(1, Ordering::Relaxed);
                                tracing::debug!(%query_id, peer = %peer.id, "discarding late reply");
                            }
                        }
                    }
                    Ok(Ok(None)) => {
                        tracing::debug!(%query_id, peer = %peer.id, "peer does not hold blob");
                        registry.decline(query_id);
                    }
                    Ok(Err(e)) => {
                        metrics.peer_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(%query_id, peer = %peer.id, error = %format!("{e:#}"), "peer query failed");
                        registry.decline(query_id);
                    }
                    // Silence is not a decline: the waiter's own deadline
                    // turns it into a timeout, and its guard removes the query.
                    Err(_) => {
                        tracing::debug!(%query_id, peer = %peer.id, "peer did not answer in time");
                    }
                }
            });
        }
        registry.mark_fanned_out(query_id);

        let (state, result) = match tokio::time::timeout(timeout, reply).await {
            Ok(Ok((peer, payload))) => (QueryState::Resolved, Ok((peer, payload))),
            Ok(Err(_)) => (QueryState::Declined, Err(BlobError::UnknownBlob(blob_id))),
            Err(_) => {
                self.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                (
                    QueryState::TimedOut,
                    Err(BlobError::ResolutionTimeout { blob_id, timeout }),
                )
            }
        };
        tracing::debug!(%query_id, blob_id = %blob_id.short(), ?state, "query finished");
        result
    }
}

/// Send one query on a fresh stream to `transport`.
///
/// Returns the stream halves when the peer answered positively, `None` when
/// it does not hold the blob.
async fn ask_peer<T: Transport>(
    transport: &T,
    query: &BlobQuery,
) -> anyhow::Result<Option<(T::SendStream, T::RecvStream)>> {
    let (mut send, mut recv) = transport
        .open_bi_stream()
        .await
        .context("failed to open query stream")?;
    write_frame(&mut send, query)
        .await
        .context("failed to send query")?;
    let response: BlobQueryResponse = read_frame(&mut recv)
        .await
        .context("failed to read query response")?
        .context("peer closed the stream without answering")?;

    if response.query_id != query.query_id {
        anyhow::bail!(
            "response for {} arrived on the stream of {}",
            response.query_id,
            query.query_id
        );
    }
    if response.answers(query) {
        return Ok(Some((send, recv)));
    }
    match response.outcome {
        QueryOutcome::UnknownBlob => Ok(None),
        QueryOutcome::Failed { reason } => anyhow::bail!("peer failed the query: {reason}"),
        other => anyhow::bail!("unexpected answer {other:?} to {:?}", query.kind),
    }
}
