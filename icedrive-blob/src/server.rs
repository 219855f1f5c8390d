//! Inbound half of federation: answers peer queries from the local store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use icedrive_net::framing::{read_frame, write_frame};
use icedrive_net::transport::{Listener, ListenerClosed};
use icedrive_protocol::query::{BlobQuery, BlobQueryResponse, QueryKind, QueryOutcome};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::BlobError;
use crate::remote::serve_session;
use crate::resolver::DEFAULT_READ_TIMEOUT;
use crate::store::BlobStore;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(50);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Counters for queries answered on behalf of peers.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub queries_answered: AtomicU64,
    pub positive_answers: AtomicU64,
    pub sessions_served: AtomicU64,
    pub bytes_served: AtomicU64,
    pub stream_errors: AtomicU64,
    pub accept_errors: AtomicU64,
}

/// Serves [`BlobQuery`] streams opened by peers.
pub struct QueryServer {
    store: Arc<BlobStore>,
    idle_timeout: Duration,
    metrics: ServerMetrics,
}

impl QueryServer {
    pub fn new(store: Arc<BlobStore>) -> Self {
        Self {
            store,
            idle_timeout: DEFAULT_READ_TIMEOUT,
            metrics: ServerMetrics::default(),
        }
    }

    /// How long a peer may leave a stream silent before it is dropped, both
    /// before its query and between the reads of a transfer session.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Accept streams from `listener` until it closes, answering each one on
    /// its own task.
    ///
    /// A failed accept is logged and retried after a short backoff; only
    /// [`ListenerClosed`] ends the loop.
    pub async fn serve<L: Listener>(self: Arc<Self>, listener: L) -> Result<()> {
        let mut backoff = ACCEPT_BACKOFF_MIN;
        loop {
            let (send, recv) = match listener.accept_bi_stream().await {
                Ok(streams) => {
                    backoff = ACCEPT_BACKOFF_MIN;
                    streams
                }
                Err(e) if e.downcast_ref::<ListenerClosed>().is_some() => {
                    tracing::info!("query listener closed");
                    return Ok(());
                }
                Err(e) => {
                    self.metrics.accept_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %format!("{e:#}"), retry_in = ?backoff, "failed to accept peer stream");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    continue;
                }
            };
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_stream(send, recv).await {
                    server.metrics.stream_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "failed to serve peer query");
                }
            });
        }
    }

    /// Answer the single query carried by one stream.
    pub async fn handle_stream<S, R>(&self, mut send: S, mut recv: R) -> Result<()>
    where
        S: AsyncWrite + Send + Unpin,
        R: AsyncRead + Send + Unpin,
    {
        let Some(query) = tokio::time::timeout(self.idle_timeout, read_frame::<_, BlobQuery>(&mut recv))
            .await
            .context("peer opened a stream but sent no query")?
            .context("failed to read peer query")?
        else {
            return Ok(());
        };
        tracing::debug!(
            query_id = %query.query_id,
            blob_id = %query.blob_id.short(),
            kind = ?query.kind,
            "peer query received"
        );

        let (outcome, session) = self.answer(&query).await;
        self.metrics.queries_answered.fetch_add(1, Ordering::Relaxed);
        if outcome == query.kind.positive_outcome() {
            self.metrics.positive_answers.fetch_add(1, Ordering::Relaxed);
        }

        let response = BlobQueryResponse {
            query_id: query.query_id,
            outcome,
        };
        write_frame(&mut send, &response)
            .await
            .context("failed to write query response")?;

        if let Some(session) = session {
            self.metrics.sessions_served.fetch_add(1, Ordering::Relaxed);
            let sent = serve_session(session, &mut send, &mut recv, self.idle_timeout)
                .await
                .context("transfer session to peer failed")?;
            self.metrics.bytes_served.fetch_add(sent, Ordering::Relaxed);
            tracing::debug!(
                query_id = %query.query_id,
                blob_id = %query.blob_id.short(),
                bytes = sent,
                "transfer session to peer finished"
            );
        }
        // The peer may already be gone; nothing more to tell it.
        let _ = send.shutdown().await;
        Ok(())
    }

    async fn answer(&self, query: &BlobQuery) -> (QueryOutcome, Option<crate::transfer::FileTransfer>) {
        let id = &query.blob_id;
        let result = match query.kind {
            QueryKind::DoesBlobExist => self.store.contains(id).map(|held| {
                if held {
                    QueryOutcome::BlobExists
                } else {
                    QueryOutcome::UnknownBlob
                }
            }),
            QueryKind::DownloadBlob => match self.store.download(id).await {
                Ok(session) => return (QueryOutcome::DownloadBlobResponse, Some(session)),
                Err(e) => Err(e),
            },
            QueryKind::LinkBlob => self.store.link(id).await.map(|links| {
                tracing::info!(blob_id = %id, links, "blob linked on behalf of peer");
                QueryOutcome::BlobLinked
            }),
            QueryKind::UnlinkBlob => self.store.unlink(id).await.map(|links| {
                tracing::info!(blob_id = %id, links, "blob unlinked on behalf of peer");
                QueryOutcome::BlobUnlinked
            }),
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(BlobError::UnknownBlob(_)) => QueryOutcome::UnknownBlob,
            Err(e) => {
                tracing::warn!(blob_id = %id, kind = ?query.kind, error = %e, "peer query failed locally");
                QueryOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };
        (outcome, None)
    }
}
