//! Federation query protocol between blob storage nodes.
//!
//! Every query travels on its own bidirectional stream: the asking node writes
//! one [`BlobQuery`], the answering node writes one [`BlobQueryResponse`]
//! echoing the [`QueryId`]. A positive answer to [`QueryKind::DownloadBlob`]
//! turns the rest of the stream into a transfer session driven by
//! [`TransferRequest`] / [`TransferReply`] frames.

use serde::{Deserialize, Serialize};

use crate::types::{BlobId, QueryId};

/// Which question a query asks about a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryKind {
    /// Does the peer hold the blob?
    DoesBlobExist,
    /// Open a transfer session over the peer's copy of the blob.
    DownloadBlob,
    /// Add one link to the peer's copy of the blob.
    LinkBlob,
    /// Remove one link from the peer's copy of the blob.
    UnlinkBlob,
}

impl QueryKind {
    /// The outcome a peer that holds the blob answers with.
    pub fn positive_outcome(self) -> QueryOutcome {
        match self {
            QueryKind::DoesBlobExist => QueryOutcome::BlobExists,
            QueryKind::DownloadBlob => QueryOutcome::DownloadBlobResponse,
            QueryKind::LinkBlob => QueryOutcome::BlobLinked,
            QueryKind::UnlinkBlob => QueryOutcome::BlobUnlinked,
        }
    }

    /// Whether answering this query mutates the answering node's link count.
    pub fn mutates(self) -> bool {
        matches!(self, QueryKind::LinkBlob | QueryKind::UnlinkBlob)
    }
}

/// A query directed at a peer's blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobQuery {
    pub query_id: QueryId,
    pub blob_id: BlobId,
    pub kind: QueryKind,
}

/// How a peer answered a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryOutcome {
    BlobExists,
    /// The stream now carries a transfer session over the blob.
    DownloadBlobResponse,
    BlobLinked,
    BlobUnlinked,
    /// The peer does not hold the blob.
    UnknownBlob,
    /// The peer holds the blob but could not serve the query.
    Failed { reason: String },
}

/// Response to a [`BlobQuery`], correlated by `query_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobQueryResponse {
    pub query_id: QueryId,
    pub outcome: QueryOutcome,
}

impl BlobQueryResponse {
    /// Whether this response is the positive answer to `query`.
    pub fn answers(&self, query: &BlobQuery) -> bool {
        self.query_id == query.query_id && self.outcome == query.kind.positive_outcome()
    }
}

/// Client side of a transfer session carried on a download stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferRequest {
    /// Read up to `max_size` bytes from the session.
    Read { max_size: u32 },
    /// Release the session; no further frames follow.
    Close,
}

/// Server side of a transfer session carried on a download stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferReply {
    /// Next bytes of the blob. Empty means end of stream.
    Data(Vec<u8>),
    /// The server could not read its copy; the session is over.
    Failed { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(kind: QueryKind) -> BlobQuery {
        BlobQuery {
            query_id: QueryId(7),
            blob_id: BlobId([0xAA; 32]),
            kind,
        }
    }

    #[test]
    fn positive_outcomes_are_distinct_per_kind() {
        let kinds = [
            QueryKind::DoesBlobExist,
            QueryKind::DownloadBlob,
            QueryKind::LinkBlob,
            QueryKind::UnlinkBlob,
        ];
        for (i, a) in kinds.iter().enumerate() {
            for b in &kinds[i + 1..] {
                assert_ne!(a.positive_outcome(), b.positive_outcome());
            }
        }
    }

    #[test]
    fn only_link_queries_mutate() {
        assert!(!QueryKind::DoesBlobExist.mutates());
        assert!(!QueryKind::DownloadBlob.mutates());
        assert!(QueryKind::LinkBlob.mutates());
        assert!(QueryKind::UnlinkBlob.mutates());
    }

    #[test]
    fn response_answers_requires_matching_id_and_outcome() {
        let q = query(QueryKind::LinkBlob);

        let ok = BlobQueryResponse {
            query_id: QueryId(7),
            outcome: QueryOutcome::BlobLinked,
        };
        assert!(ok.answers(&q));

        let wrong_id = BlobQueryResponse {
            query_id: QueryId(8),
            outcome: QueryOutcome::BlobLinked,
        };
        assert!(!wrong_id.answers(&q));

        let unknown = BlobQueryResponse {
            query_id: QueryId(7),
            outcome: QueryOutcome::UnknownBlob,
        };
        assert!(!unknown.answers(&q));

        let other_kind = BlobQueryResponse {
            query_id: QueryId(7),
            outcome: QueryOutcome::BlobExists,
        };
        assert!(!other_kind.answers(&q));
    }

    #[test]
    fn query_encodes_compactly() {
        let encoded = postcard::to_allocvec(&query(QueryKind::DownloadBlob)).unwrap();
        // varint id + 32 digest bytes + enum tag
        assert_eq!(encoded.len(), 1 + 32 + 1);
        let decoded: BlobQuery = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(decoded.kind, QueryKind::DownloadBlob);
    }
}
