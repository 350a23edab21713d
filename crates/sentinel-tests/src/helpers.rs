//! Shared helpers for the multi-node tests.

use libp2p::identity::Keypair;
use sentinel_core::beacon::{BeaconBlock, SignedBeaconBlock};
use sentinel_core::types::Root;
use sentinel_network::{Endpoint, Eth2Field, GossipError, GossipObject, NodeIdentity, NodeRecord, Sentinel, SentinelConfig};
use std::future::Future;
use std::time::Duration;

/// Start a node with the loopback test preset.
pub async fn start_node() -> Sentinel {
    start_with(SentinelConfig::local_testing()).await
}

pub async fn start_with(config: SentinelConfig) -> Sentinel {
    Sentinel::start(config).await.unwrap()
}

/// Two nodes, the second connected to the first.
pub async fn connected_pair() -> (Sentinel, Sentinel) {
    let a = start_node().await;
    let b = start_node().await;
    let peer = b.dial(a.record()).await.unwrap();
    assert_eq!(peer, a.local_peer_id());
    wait_until(Duration::from_secs(5), || a.peers_count() == 1 && b.peers_count() == 1).await;
    (a, b)
}

/// Poll `cond` every 20 ms until it holds; panic after `timeout`.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Retry `publish` while gossipsub has not yet learned the remote
/// subscription.
pub async fn publish_when_ready<F, Fut>(timeout: Duration, mut publish: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), GossipError>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match publish().await {
            Ok(()) => return,
            Err(GossipError::InsufficientPeers) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => panic!("publish failed: {e}"),
        }
    }
}

pub fn sample_block(slot: u64) -> GossipObject {
    let mut block = SignedBeaconBlock {
        block: BeaconBlock {
            slot,
            proposer_index: 7,
            parent_root: Root([0x11; 32]),
            state_root: Root([0x22; 32]),
            ..BeaconBlock::default()
        },
        ..SignedBeaconBlock::default()
    };
    block.block.body.graffiti[..8].copy_from_slice(b"sentinel");
    GossipObject::BeaconBlock(Box::new(block))
}

/// A validly signed record for a fresh key at `127.0.0.1:tcp_port`.
pub fn record_at(tcp_port: u16) -> NodeRecord {
    let endpoint = Endpoint { ip: "127.0.0.1".parse().unwrap(), udp_port: 9, tcp_port };
    NodeIdentity::new(Keypair::generate_ed25519(), endpoint, Eth2Field::default(), [0; 8])
        .unwrap()
        .record()
        .clone()
}
