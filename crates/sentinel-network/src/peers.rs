//! Peer table shared by discovery and the connection manager.
//!
//! Every peer the node knows about has one [`PeerEntry`] carrying both its
//! discovery state (`Unknown -> Pinged -> Verified -> Stale`) and its
//! connection state. A single [`parking_lot::Mutex`] guards the whole table,
//! so a peer can never be evicted by discovery while the connection manager
//! is dialing it.
//!
//! Entries learned from records are bounded per log-distance bucket.
//! Entries created for inbound connections carry no record and do not count
//! towards a bucket; they are dropped when the connection closes.

use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use sentinel_core::types::ForkDigest;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::identity::{NodeId, NodeRecord};
use crate::peer_scoring::PeerScoreBoard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    /// Was connected or dialed; eligible for rediscovery after backoff.
    Disconnected,
}

impl ConnectionState {
    /// Connecting or connected peers occupy a slot and are never evicted.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Unknown,
    Pinged,
    Verified,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    pub node_id: NodeId,
    pub record: Option<NodeRecord>,
    pub addr: Option<Multiaddr>,
    pub last_seen: Instant,
    pub connection: ConnectionState,
    pub discovery: DiscoveryState,
    pub direction: Option<Direction>,
    /// Consecutive failed discovery exchanges.
    pub failures: u32,
    /// Consecutive failed dials; drives the backoff.
    pub dial_failures: u32,
    pub backoff_until: Option<Instant>,
}

impl PeerEntry {
    fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            node_id: NodeId::from_peer_id(&peer_id),
            record: None,
            addr: None,
            last_seen: Instant::now(),
            connection: ConnectionState::Unconnected,
            discovery: DiscoveryState::Unknown,
            direction: None,
            failures: 0,
            dial_failures: 0,
            backoff_until: None,
        }
    }

    fn backing_off(&self, now: Instant) -> bool {
        self.backoff_until.is_some_and(|until| until > now)
    }
}

/// Result of offering a record to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Added,
    /// Replaced an older record of the same peer.
    Updated,
    /// Same sequence number as the held record.
    Unchanged,
    SelfRecord,
    /// Older sequence number than the held record.
    Stale,
    BucketFull,
    /// The record's key does not decode.
    Invalid,
}

#[derive(Debug)]
pub struct PeerTable {
    local: NodeId,
    pub(crate) peers: HashMap<PeerId, PeerEntry>,
    bucket_size: usize,
    max_failures: u32,
    pub scores: PeerScoreBoard,
}

pub type SharedPeerTable = Arc<Mutex<PeerTable>>;

impl PeerTable {
    pub fn new(local: NodeId, bucket_size: usize, max_failures: u32) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            bucket_size,
            max_failures: max_failures.max(1),
            scores: PeerScoreBoard::new(),
        }
    }

    pub fn shared(self) -> SharedPeerTable {
        Arc::new(Mutex::new(self))
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerEntry> {
        self.peers.get(peer)
    }

    pub(crate) fn entry_mut(&mut self, peer: PeerId) -> &mut PeerEntry {
        self.peers.entry(peer).or_insert_with(|| PeerEntry::new(peer))
    }

    pub(crate) fn remove(&mut self, peer: &PeerId) -> Option<PeerEntry> {
        self.peers.remove(peer)
    }

    fn bucket_len(&self, distance: u32) -> usize {
        self.peers
            .values()
            .filter(|e| e.record.is_some() && self.local.log_distance(&e.node_id) == Some(distance))
            .count()
    }

    /// Offer a verified record to the table.
    pub fn insert_record(&mut self, record: NodeRecord) -> InsertOutcome {
        let Ok(peer_id) = record.peer_id() else {
            return InsertOutcome::Invalid;
        };
        let addr = record.tcp_multiaddr().ok();

        if let Some(entry) = self.peers.get_mut(&peer_id) {
            let held = entry.record.as_ref().map(|r| r.seq);
            return match held {
                Some(seq) if record.seq < seq => InsertOutcome::Stale,
                Some(seq) if record.seq == seq => InsertOutcome::Unchanged,
                _ => {
                    entry.record = Some(record);
                    if addr.is_some() {
                        entry.addr = addr;
                    }
                    InsertOutcome::Updated
                }
            };
        }

        let node_id = NodeId::from_peer_id(&peer_id);
        let Some(distance) = self.local.log_distance(&node_id) else {
            return InsertOutcome::SelfRecord;
        };

        if self.bucket_len(distance) >= self.bucket_size && !self.evict_stale_in(distance) {
            debug!(%peer_id, distance, "peers: bucket full, record refused");
            return InsertOutcome::BucketFull;
        }

        let mut entry = PeerEntry::new(peer_id);
        entry.record = Some(record);
        entry.addr = addr;
        self.peers.insert(peer_id, entry);
        InsertOutcome::Added
    }

    /// Evict one stale, inactive entry at `distance`. `true` if one was removed.
    fn evict_stale_in(&mut self, distance: u32) -> bool {
        let local = self.local;
        let victim = self
            .peers
            .values()
            .filter(|e| e.record.is_some() && local.log_distance(&e.node_id) == Some(distance))
            .find(|e| e.discovery == DiscoveryState::Stale && !e.connection.is_active())
            .map(|e| e.peer_id);
        match victim {
            Some(peer) => {
                self.peers.remove(&peer);
                true
            }
            None => false,
        }
    }

    /// Make sure an explicitly dialed record is present, bypassing bucket
    /// limits. Returns the peer id.
    pub fn upsert_dialed(&mut self, record: NodeRecord) -> Option<PeerId> {
        let peer_id = record.peer_id().ok()?;
        if self.insert_record(record.clone()) == InsertOutcome::BucketFull {
            let entry = self.entry_mut(peer_id);
            entry.addr = record.tcp_multiaddr().ok();
            entry.record = Some(record);
        }
        Some(peer_id)
    }

    pub fn mark_pinged(&mut self, peer: &PeerId) {
        if let Some(entry) = self.peers.get_mut(peer) {
            if entry.discovery == DiscoveryState::Unknown {
                entry.discovery = DiscoveryState::Pinged;
            }
        }
    }

    /// A valid reply came back: the entry is live.
    pub fn mark_verified(&mut self, peer: &PeerId) {
        if let Some(entry) = self.peers.get_mut(peer) {
            entry.discovery = DiscoveryState::Verified;
            entry.failures = 0;
            entry.last_seen = Instant::now();
        }
    }

    /// Count a failed exchange. After `max_failures` the entry goes stale and,
    /// unless a connection holds it, is evicted. Returns `true` on eviction.
    pub fn record_failure(&mut self, peer: &PeerId) -> bool {
        let Some(entry) = self.peers.get_mut(peer) else {
            return false;
        };
        entry.failures = entry.failures.saturating_add(1);
        if entry.failures < self.max_failures {
            return false;
        }
        entry.discovery = DiscoveryState::Stale;
        if entry.connection.is_active() {
            return false;
        }
        debug!(%peer, failures = entry.failures, "peers: evicting unreachable entry");
        self.peers.remove(peer);
        true
    }

    fn records_where(&self, pred: impl Fn(&PeerEntry) -> bool) -> Vec<NodeRecord> {
        self.peers
            .values()
            .filter(|e| pred(e))
            .filter_map(|e| e.record.clone())
            .collect()
    }

    pub fn unknown_records(&self) -> Vec<NodeRecord> {
        self.records_where(|e| e.discovery == DiscoveryState::Unknown)
    }

    pub fn verified_records(&self) -> Vec<NodeRecord> {
        self.records_where(|e| e.discovery == DiscoveryState::Verified)
    }

    pub fn verified_count(&self) -> usize {
        self.peers.values().filter(|e| e.discovery == DiscoveryState::Verified).count()
    }

    /// Verified entries not heard from within `after`.
    pub fn needs_revalidation(&self, after: Duration) -> Vec<NodeRecord> {
        self.records_where(|e| e.discovery == DiscoveryState::Verified && e.last_seen.elapsed() >= after)
    }

    fn closest_where(&self, target: &NodeId, n: usize, pred: impl Fn(&PeerEntry) -> bool) -> Vec<NodeRecord> {
        let mut found: Vec<(&PeerEntry, [u8; 32])> = self
            .peers
            .values()
            .filter(|e| e.record.is_some() && pred(e))
            .map(|e| (e, e.node_id.distance(target)))
            .collect();
        found.sort_by(|a, b| a.1.cmp(&b.1));
        found.into_iter().take(n).filter_map(|(e, _)| e.record.clone()).collect()
    }

    /// Verified records nearest to `target`, as served to remote lookups.
    pub fn closest_verified(&self, target: &NodeId, n: usize) -> Vec<NodeRecord> {
        self.closest_where(target, n, |e| e.discovery == DiscoveryState::Verified)
    }

    /// Any non-stale record nearest to `target`, used to seed local lookups.
    pub fn closest_known(&self, target: &NodeId, n: usize) -> Vec<NodeRecord> {
        self.closest_where(target, n, |e| e.discovery != DiscoveryState::Stale)
    }

    /// Verified records on `fork_digest` that are free to dial now.
    pub fn dial_candidates(&self, n: usize, fork_digest: ForkDigest) -> Vec<NodeRecord> {
        let now = Instant::now();
        self.peers
            .values()
            .filter(|e| e.discovery == DiscoveryState::Verified)
            .filter(|e| !e.connection.is_active() && !e.backing_off(now))
            .filter(|e| !self.scores.is_banned(&e.peer_id))
            .filter_map(|e| e.record.as_ref())
            .filter(|r| r.eth2.fork_digest == fork_digest)
            .take(n)
            .cloned()
            .collect()
    }

    pub fn count_in(&self, state: ConnectionState) -> usize {
        self.peers.values().filter(|e| e.connection == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Endpoint, Eth2Field, NodeIdentity};
    use libp2p::identity::Keypair;
    use std::net::{IpAddr, Ipv4Addr};

    const DIGEST: ForkDigest = ForkDigest([1, 2, 3, 4]);

    fn identity() -> NodeIdentity {
        let ep = Endpoint { ip: IpAddr::V4(Ipv4Addr::LOCALHOST), udp_port: 30303, tcp_port: 9000 };
        let eth2 = Eth2Field { fork_digest: DIGEST, ..Default::default() };
        NodeIdentity::new(Keypair::generate_ed25519(), ep, eth2, [0; 8]).unwrap()
    }

    fn table() -> PeerTable {
        PeerTable::new(NodeId::random(), 16, 3)
    }

    #[test]
    fn insert_and_update_by_seq() {
        let mut t = table();
        let mut id = identity();
        let first = id.record().clone();
        assert_eq!(t.insert_record(first.clone()), InsertOutcome::Added);
        assert_eq!(t.insert_record(first.clone()), InsertOutcome::Unchanged);

        id.set_attnets([1; 8]).unwrap();
        assert_eq!(t.insert_record(id.record().clone()), InsertOutcome::Updated);
        assert_eq!(t.insert_record(first), InsertOutcome::Stale);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn self_record_refused() {
        let id = identity();
        let mut t = PeerTable::new(id.node_id(), 16, 3);
        assert_eq!(t.insert_record(id.record().clone()), InsertOutcome::SelfRecord);
        assert!(t.is_empty());
    }

    #[test]
    fn full_bucket_refuses_then_evicts_stale() {
        let mut t = PeerTable::new(NodeId([0u8; 32]), 1, 1);
        // Almost every random id lands in bucket 256 against the zero id.
        let mut added = Vec::new();
        let mut refused = None;
        while refused.is_none() {
            let rec = identity().record().clone();
            match t.insert_record(rec.clone()) {
                InsertOutcome::Added => added.push(rec),
                InsertOutcome::BucketFull => refused = Some(rec),
                other => panic!("unexpected {other:?}"),
            }
        }
        let refused = refused.unwrap();
        let victim = added
            .iter()
            .find(|r| {
                let n = r.node_id().unwrap();
                NodeId([0u8; 32]).log_distance(&n) == NodeId([0u8; 32]).log_distance(&refused.node_id().unwrap())
            })
            .unwrap()
            .peer_id()
            .unwrap();

        // A connected entry is never evicted.
        t.entry_mut(victim).connection = ConnectionState::Connected;
        assert!(!t.record_failure(&victim));
        assert_eq!(t.get(&victim).unwrap().discovery, DiscoveryState::Stale);
        assert_eq!(t.insert_record(refused.clone()), InsertOutcome::BucketFull);

        t.entry_mut(victim).connection = ConnectionState::Disconnected;
        assert_eq!(t.insert_record(refused), InsertOutcome::Added);
        assert!(t.get(&victim).is_none());
    }

    #[test]
    fn discovery_state_transitions() {
        let mut t = table();
        let rec = identity().record().clone();
        let peer = rec.peer_id().unwrap();
        t.insert_record(rec);
        assert_eq!(t.unknown_records().len(), 1);

        t.mark_pinged(&peer);
        assert_eq!(t.get(&peer).unwrap().discovery, DiscoveryState::Pinged);
        t.mark_verified(&peer);
        assert_eq!(t.verified_count(), 1);

        assert!(!t.record_failure(&peer));
        assert!(!t.record_failure(&peer));
        assert!(t.record_failure(&peer));
        assert!(t.get(&peer).is_none());
    }

    #[test]
    fn verification_resets_failures() {
        let mut t = table();
        let rec = identity().record().clone();
        let peer = rec.peer_id().unwrap();
        t.insert_record(rec);
        t.record_failure(&peer);
        t.record_failure(&peer);
        t.mark_verified(&peer);
        assert!(!t.record_failure(&peer));
        assert!(t.get(&peer).is_some());
    }

    #[test]
    fn closest_sorted_by_distance() {
        let mut t = table();
        let target = NodeId::random();
        for _ in 0..10 {
            let rec = identity().record().clone();
            let peer = rec.peer_id().unwrap();
            t.insert_record(rec);
            t.mark_verified(&peer);
        }
        let closest = t.closest_verified(&target, 4);
        assert_eq!(closest.len(), 4);
        let distances: Vec<_> = closest.iter().map(|r| r.node_id().unwrap().distance(&target)).collect();
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn dial_candidates_filter() {
        let mut t = table();
        let good = identity().record().clone();
        let good_peer = good.peer_id().unwrap();
        t.insert_record(good);
        assert!(t.dial_candidates(10, DIGEST).is_empty(), "unverified entries are not dialed");
        t.mark_verified(&good_peer);
        assert_eq!(t.dial_candidates(10, DIGEST).len(), 1);
        assert!(t.dial_candidates(10, ForkDigest([9; 4])).is_empty());

        t.entry_mut(good_peer).backoff_until = Some(Instant::now() + Duration::from_secs(60));
        assert!(t.dial_candidates(10, DIGEST).is_empty());
        t.entry_mut(good_peer).backoff_until = None;
        t.entry_mut(good_peer).connection = ConnectionState::Connecting;
        assert!(t.dial_candidates(10, DIGEST).is_empty());
    }

    #[test]
    fn upsert_dialed_ignores_bucket_limit() {
        let mut t = PeerTable::new(NodeId([0u8; 32]), 0, 3);
        let rec = identity().record().clone();
        assert_eq!(t.insert_record(rec.clone()), InsertOutcome::BucketFull);
        let peer = t.upsert_dialed(rec).unwrap();
        assert!(t.get(&peer).unwrap().addr.is_some());
    }
}
