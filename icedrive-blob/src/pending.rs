//! Registry of in-flight federation queries.
//!
//! Each query fans out to several peers. The registry holds one
//! single-assignment reply slot per query: the first peer to answer
//! positively fills it, and every later answer is handed back to its sender
//! to be discarded. When every peer has declined, the slot is dropped so the
//! waiting caller learns early that nobody holds the blob.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use icedrive_protocol::types::{BlobId, PeerId, QueryId};
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Where a query is in its lifetime, as seen by the asking node.
///
/// Live queries are `Init` or `FannedOut`; the other states are terminal and
/// reported by the resolver once the query has left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Registered, not yet sent.
    Init,
    /// Sent to every peer; waiting for the first positive answer.
    FannedOut,
    /// A peer answered positively.
    Resolved,
    /// The deadline passed without a positive answer.
    TimedOut,
    /// Every peer answered without the blob.
    Declined,
}

struct PendingQuery<T> {
    blob_id: BlobId,
    reply: oneshot::Sender<(PeerId, T)>,
    outstanding: usize,
    state: QueryState,
}

/// In-flight queries keyed by correlation token.
pub struct PendingQueries<T> {
    next_id: AtomicU64,
    entries: Mutex<HashMap<QueryId, PendingQuery<T>>>,
}

impl<T> PendingQueries<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh correlation token without registering a query.
    pub fn next_id(&self) -> QueryId {
        QueryId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a query for `blob_id` that will be sent to `peers` peers.
    ///
    /// Returns the fresh correlation token and the receiver the caller waits
    /// on. The receiver errors if every peer declines.
    pub fn register(&self, blob_id: BlobId, peers: usize) -> (QueryId, oneshot::Receiver<(PeerId, T)>) {
        let query_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.entries.lock().insert(
            query_id,
            PendingQuery {
                blob_id,
                reply: tx,
                outstanding: peers,
                state: QueryState::Init,
            },
        );
        tracing::trace!(%query_id, blob_id = %blob_id.short(), peers, "query registered");
        (query_id, rx)
    }

    /// Record that the query has been handed to every peer.
    pub fn mark_fanned_out(&self, query_id: QueryId) {
        if let Some(entry) = self.entries.lock().get_mut(&query_id) {
            entry.state = QueryState::FannedOut;
        }
    }

    /// Offer a positive answer from `peer`.
    ///
    /// The first offer for a live query is delivered and the query is
    /// removed. Any other offer is returned so the caller can discard it.
    pub fn complete(&self, query_id: QueryId, peer: PeerId, value: T) -> Result<(), T> {
        let Some(entry) = self.entries.lock().remove(&query_id) else {
            return Err(value);
        };
        tracing::trace!(%query_id, blob_id = %entry.blob_id.short(), %peer, "query resolved");
        entry.reply.send((peer, value)).map_err(|(_, value)| value)
    }

    /// Record that a peer answered without the blob, or failed to answer.
    ///
    /// Returns `true` if this was the last outstanding peer, in which case the
    /// query is removed and its waiter sees the reply slot close.
    pub fn decline(&self, query_id: QueryId) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&query_id) else {
            return false;
        };
        entry.outstanding = entry.outstanding.saturating_sub(1);
        if entry.outstanding > 0 {
            return false;
        }
        if let Some(entry) = entries.remove(&query_id) {
            tracing::trace!(%query_id, blob_id = %entry.blob_id.short(), "every peer declined");
        }
        true
    }

    /// Drop a query whose deadline passed. Later answers are discarded.
    pub fn expire(&self, query_id: QueryId) {
        if let Some(entry) = self.entries.lock().remove(&query_id) {
            tracing::trace!(%query_id, blob_id = %entry.blob_id.short(), outstanding = entry.outstanding, "query expired");
        }
    }

    /// Expire `query_id` when the returned guard drops, so a waiter that is
    /// cancelled mid-wait does not leave its query behind.
    pub fn guard(&self, query_id: QueryId) -> QueryGuard<'_, T> {
        QueryGuard {
            registry: self,
            query_id,
        }
    }

    /// State of a live query; `None` once it reached a terminal state.
    pub fn state(&self, query_id: QueryId) -> Option<QueryState> {
        self.entries.lock().get(&query_id).map(|e| e.state)
    }

    /// Number of live queries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Removes its query from the registry on drop. A no-op for queries that
/// already completed, were declined, or expired.
pub struct QueryGuard<'a, T> {
    registry: &'a PendingQueries<T>,
    query_id: QueryId,
}

impl<T> Drop for QueryGuard<'_, T> {
    fn drop(&mut self) {
        self.registry.expire(self.query_id);
    }
}

impl<T> Default for PendingQueries<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob() -> BlobId {
        BlobId([9; 32])
    }

    fn peer(n: u8) -> PeerId {
        PeerId([n; 32])
    }

    #[tokio::test]
    async fn first_answer_wins() {
        let pending: PendingQueries<&'static str> = PendingQueries::new();
        let (qid, rx) = pending.register(blob(), 3);
        pending.mark_fanned_out(qid);
        assert_eq!(pending.state(qid), Some(QueryState::FannedOut));

        assert!(pending.complete(qid, peer(1), "first").is_ok());
        assert_eq!(pending.complete(qid, peer(2), "second"), Err("second"));

        assert_eq!(rx.await.unwrap(), (peer(1), "first"));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn decline_from_every_peer_closes_slot() {
        let pending: PendingQueries<()> = PendingQueries::new();
        let (qid, rx) = pending.register(blob(), 2);

        assert!(!pending.decline(qid));
        assert_eq!(pending.len(), 1);
        assert!(pending.decline(qid));
        assert!(pending.is_empty());
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn decline_then_positive_still_resolves() {
        let pending: PendingQueries<u32> = PendingQueries::new();
        let (qid, rx) = pending.register(blob(), 2);
        assert!(!pending.decline(qid));
        assert!(pending.complete(qid, peer(2), 42).is_ok());
        assert_eq!(rx.await.unwrap(), (peer(2), 42));
        // A straggler decline on a removed query is ignored.
        assert!(!pending.decline(qid));
    }

    #[tokio::test]
    async fn expired_query_discards_late_answers() {
        let pending: PendingQueries<u32> = PendingQueries::new();
        let (qid, _rx) = pending.register(blob(), 1);
        pending.expire(qid);
        assert_eq!(pending.state(qid), None);
        assert_eq!(pending.complete(qid, peer(1), 7), Err(7));
    }

    #[tokio::test]
    async fn answer_after_waiter_gave_up_is_returned() {
        let pending: PendingQueries<u32> = PendingQueries::new();
        let (qid, rx) = pending.register(blob(), 1);
        drop(rx);
        assert_eq!(pending.complete(qid, peer(1), 5), Err(5));
    }

    #[tokio::test]
    async fn abandoned_wait_removes_query() {
        let pending: PendingQueries<u32> = PendingQueries::new();
        let (qid, rx) = pending.register(blob(), 2);
        pending.mark_fanned_out(qid);
        {
            let _guard = pending.guard(qid);
            let waited = tokio::time::timeout(std::time::Duration::from_millis(10), rx).await;
            assert!(waited.is_err());
            assert_eq!(pending.len(), 1);
        }
        assert!(pending.is_empty());
        assert_eq!(pending.complete(qid, peer(1), 3), Err(3));
    }

    #[tokio::test]
    async fn guard_after_completion_is_harmless() {
        let pending: PendingQueries<u32> = PendingQueries::new();
        let (qid, rx) = pending.register(blob(), 1);
        let guard = pending.guard(qid);
        pending.complete(qid, peer(4), 8).unwrap();
        let (qid_b, _rx_b) = pending.register(blob(), 1);
        drop(guard);
        assert_eq!(rx.await.unwrap(), (peer(4), 8));
        assert_eq!(pending.state(qid_b), Some(QueryState::Init));
    }

    #[test]
    fn query_ids_are_unique() {
        let pending: PendingQueries<()> = PendingQueries::new();
        let (a, _ra) = pending.register(blob(), 1);
        let (b, _rb) = pending.register(blob(), 1);
        let c = pending.next_id();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(pending.len(), 2);
    }
}
