//! Multi-node integration tests.
//!
//! Nodes run on loopback with ephemeral ports; the second node of each
//! pair dials the first directly through its record.

use std::time::Duration;

use sentinel_network::{
    GoodbyeReason, GossipObject, GossipTopic, MetadataV2, Ping, ProtocolId, RpcError, RpcMethod, RpcRequest,
    StatusMessage,
};
use sentinel_tests::helpers::*;

#[tokio::test]
async fn block_published_on_a_arrives_decoded_on_b() {
    let (a, b) = connected_pair().await;
    let blocks = b.gossip_channel(GossipTopic::BeaconBlock).unwrap();

    let block = sample_block(42);
    publish_when_ready(Duration::from_secs(10), || a.publish(&block)).await;

    let received = tokio::time::timeout(Duration::from_secs(10), blocks.recv()).await.unwrap().unwrap();
    let GossipObject::BeaconBlock(signed) = received else { panic!("wrong variant: {received:?}") };
    assert_eq!(signed.block.slot, 42);
    assert_eq!(signed.block.body.graffiti_str(), "sentinel");

    // Nothing is delivered twice.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(blocks.try_recv().is_none());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn republishing_same_content_is_duplicate() {
    let (a, b) = connected_pair().await;
    let block = sample_block(7);
    publish_when_ready(Duration::from_secs(10), || a.publish(&block)).await;
    assert_eq!(a.publish(&block).await, Err(sentinel_network::GossipError::Duplicate));
    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn ping_and_metadata_between_nodes() {
    let (a, b) = connected_pair().await;

    let pong = b.ping(a.local_peer_id()).await.unwrap();
    assert_eq!(pong.seq_number, a.record().seq);

    let md: MetadataV2 = b.metadata(a.local_peer_id()).await.unwrap();
    assert_eq!(md.attnets, a.record().attnets);
    let v1 = b.metadata_v1(a.local_peer_id()).await.unwrap();
    assert_eq!(v1.seq_number, md.seq_number);

    // With exactly one peer, the random-peer requests target it.
    assert_eq!(b.send_ping_req_v1().await.unwrap(), pong);
    assert_eq!(b.send_metadata_req_v1().await.unwrap(), v1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn status_served_from_driver() {
    let (a, b) = connected_pair().await;
    let theirs = b.status(a.local_peer_id()).await.unwrap();
    assert_eq!(theirs.head_slot, 0);

    let updated = StatusMessage { head_slot: 1234, finalized_epoch: 38, ..theirs };
    a.set_status(updated).await.unwrap();
    assert_eq!(b.status(a.local_peer_id()).await.unwrap(), updated);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn goodbye_disconnects_both_sides() {
    let (a, b) = connected_pair().await;
    b.disconnect(a.local_peer_id(), GoodbyeReason::ClientShutdown).await.unwrap();
    wait_until(Duration::from_secs(5), || a.peers_count() == 0 && b.peers_count() == 0).await;
    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn peer_count_tracks_connects_and_disconnects() {
    let hub = start_node().await;
    let mut spokes = Vec::new();
    for expected in 1..=3 {
        let spoke = start_node().await;
        spoke.dial(hub.record()).await.unwrap();
        wait_until(Duration::from_secs(5), || hub.peers_count() == expected).await;
        spokes.push(spoke);
    }
    assert_eq!(hub.connected_peers().len(), 3);

    let mut expected = 3;
    while let Some(spoke) = spokes.pop() {
        spoke.stop().await;
        expected -= 1;
        wait_until(Duration::from_secs(5), || hub.peers_count() == expected).await;
    }
    assert_eq!(hub.send_ping_req_v1().await, Err(RpcError::NoPeers));
    hub.stop().await;
}

#[tokio::test]
async fn duplicate_dial_rejected() {
    let (a, b) = connected_pair().await;
    let err = b.dial(a.record()).await.unwrap_err();
    assert_eq!(err, sentinel_network::ConnectionError::AlreadyConnected);
    assert_eq!(b.peers_count(), 1);
    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn peer_limit_refuses_extra_dials() {
    let mut config = sentinel_network::SentinelConfig::local_testing();
    config.max_peers = 1;
    config.target_peers = 1;
    let hub = start_with(config).await;
    let first = start_node().await;
    let second = start_node().await;

    first.dial(hub.record()).await.unwrap();
    wait_until(Duration::from_secs(5), || hub.peers_count() == 1).await;

    // The hub refuses the connection; the dialer sees it fail or close.
    let _ = second.dial(hub.record()).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(hub.peers_count(), 1);
    assert_eq!(second.peers_count(), 0);

    for node in [hub, first, second] {
        node.stop().await;
    }
}

#[tokio::test]
async fn unsupported_version_fails_immediately() {
    let (a, b) = connected_pair().await;
    let ping_v2 = ProtocolId { method: RpcMethod::Ping, version: 2 };

    let started = tokio::time::Instant::now();
    let err = b.send_request(a.local_peer_id(), ping_v2, RpcRequest::Ping(Ping::default())).await.unwrap_err();
    assert!(matches!(err, RpcError::UnsupportedVersion { version: 2, .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(1));

    // Supported versions on the same connection are unaffected.
    b.ping(a.local_peer_id()).await.unwrap();
    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn mismatched_request_body_is_a_local_error() {
    let (a, b) = connected_pair().await;
    let peer = a.local_peer_id();
    let before = b.peer_score(&peer);

    for _ in 0..10 {
        let err = b.send_request(peer, ProtocolId::PING_V1, RpcRequest::MetaData).await.unwrap_err();
        assert!(matches!(err, RpcError::Encode(_)), "{err}");
    }
    assert_eq!(b.peer_score(&peer), before);
    assert_eq!(b.peers_count(), 1);
    b.ping(peer).await.unwrap();

    a.stop().await;
    b.stop().await;
}
