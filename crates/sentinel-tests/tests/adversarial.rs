//! Hostile-peer tests: malformed gossip, unresponsive peers and capacity.

use std::time::{Duration, Instant};

use sentinel_network::{GossipTopic, RpcError};
use sentinel_tests::helpers::*;
use tokio::net::TcpListener;

#[tokio::test]
async fn malformed_gossip_is_dropped_and_sender_disconnected() {
    let (a, b) = connected_pair().await;
    let blocks = b.gossip_channel(GossipTopic::BeaconBlock).unwrap();
    let topic = format!("/eth2/{}/beacon_block/bincode", a.record().eth2.fork_digest);

    publish_when_ready(Duration::from_secs(10), || a.publish_raw(&topic, vec![0xFF; 64])).await;

    wait_until(Duration::from_secs(10), || b.peers_count() == 0).await;
    assert!(blocks.try_recv().is_none());
    assert_eq!(b.gossip_dropped(GossipTopic::BeaconBlock), 0);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn ping_to_black_hole_times_out() {
    // Accepts TCP connections and never speaks.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hole = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let node = start_node().await;
    let record = record_at(port);
    let peer = record.peer_id().unwrap();
    node.add_peer_record(record);

    let started = Instant::now();
    let err = node.ping(peer).await.unwrap_err();
    assert_eq!(err, RpcError::Timeout);
    // Deadline is two request timeouts in the test preset.
    assert!(started.elapsed() < Duration::from_secs(8));

    node.stop().await;
    hole.abort();
}

#[tokio::test]
async fn stop_cancels_in_flight_requests() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hole = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let node = std::sync::Arc::new(start_node().await);
    let record = record_at(port);
    let peer = record.peer_id().unwrap();
    node.add_peer_record(record);

    let pinger = {
        let node = node.clone();
        tokio::spawn(async move { node.ping(peer).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The waiting ping must resolve promptly rather than run into its deadline.
    let started = Instant::now();
    node.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(3), pinger).await.unwrap().unwrap();
    assert_eq!(result, Err(RpcError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(3));
    hole.abort();
}
