use std::sync::atomic::Ordering;
use std::time::Duration;

use icedrive_blob::{BlobError, LinkOutcome, MemoryTransfer};
use icedrive_node::save_session;
use icedrive_protocol::ticket::ServiceTicket;
use icedrive_protocol::types::{BlobId, CallerIdentity, PeerId};
use tempfile::TempDir;

use crate::helpers::{init_test_tracing, introduce, start_node, TestTimer};

fn caller() -> CallerIdentity {
    CallerIdentity::new("integration")
}

#[tokio::test]
async fn download_fetches_from_peer_over_tcp() {
    init_test_tracing();
    let mut timer = TestTimer::new("download_fetches_from_peer_over_tcp");
    let a = start_node(&[]).await;
    let b = start_node(&[a.ticket()]).await;
    timer.phase("nodes_started");

    let data: Vec<u8> = (0..250_000u32).map(|i| (i % 251) as u8).collect();
    let id = a
        .node
        .service()
        .upload(&caller(), MemoryTransfer::new(data.clone()))
        .await
        .unwrap();
    timer.phase("upload");

    let session = b.node.service().download(&caller(), id).await.unwrap();
    let out_dir = TempDir::new().unwrap();
    let out = out_dir.path().join("fetched.bin");
    let written = save_session(session, &out, 16 * 1024).await.unwrap();
    timer.phase("download");

    assert_eq!(written, data.len() as u64);
    assert_eq!(std::fs::read(&out).unwrap(), data);
    assert_eq!(b.node.store().link_count(&id).unwrap(), Some(1));
    assert_eq!(a.node.store().link_count(&id).unwrap(), Some(1));
    assert_eq!(
        a.running.server().metrics().sessions_served.load(Ordering::Relaxed),
        1
    );
    assert_eq!(a.running.server().idle_timeout(), Duration::from_millis(2_000));
}

#[tokio::test]
async fn missing_blob_is_unknown_across_nodes() {
    init_test_tracing();
    let a = start_node(&[]).await;
    let b = start_node(&[]).await;
    introduce(&a, &b);

    let err = b
        .node
        .service()
        .download(&caller(), BlobId([0x5A; 32]))
        .await
        .unwrap_err();
    assert!(matches!(err, BlobError::UnknownBlob(_)), "got {err:?}");
}

#[tokio::test]
async fn remote_link_and_unlink_over_tcp() {
    init_test_tracing();
    let a = start_node(&[]).await;
    let b = start_node(&[a.ticket()]).await;

    let id = a
        .node
        .service()
        .upload(&caller(), MemoryTransfer::new(&b"linked from afar"[..]))
        .await
        .unwrap();

    let outcome = b.node.service().link(&caller(), id).await.unwrap();
    assert_eq!(outcome, LinkOutcome::Remote(a.node.peer_id()));
    assert_eq!(a.node.store().link_count(&id).unwrap(), Some(2));
    assert_eq!(b.node.store().link_count(&id).unwrap(), None);

    for _ in 0..2 {
        let outcome = b.node.service().unlink(&caller(), id).await.unwrap();
        assert_eq!(outcome, LinkOutcome::Remote(a.node.peer_id()));
    }
    assert_eq!(a.node.store().link_count(&id).unwrap(), None);
    assert!(!a.node.store().blob_path(&id).exists());
}

#[tokio::test]
async fn unreachable_peer_does_not_block_resolution() {
    init_test_tracing();
    let holder = start_node(&[]).await;

    // An address nothing listens on any more.
    let dead_addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let dead = ServiceTicket {
        peer_id: PeerId([0xDD; 32]),
        addr: dead_addr.to_string(),
    };
    let asker = start_node(&[dead, holder.ticket()]).await;
    assert_eq!(asker.node.directory().len(), 2);

    let id = holder
        .node
        .service()
        .upload(&caller(), MemoryTransfer::new(&b"still reachable"[..]))
        .await
        .unwrap();

    let mut session = asker.node.service().download(&caller(), id).await.unwrap();
    assert_eq!(session.read_to_vec(4).await.unwrap(), b"still reachable");
}
