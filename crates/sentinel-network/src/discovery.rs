//! UDP node discovery.
//!
//! Packets are a 6-byte tag followed by a bincode [`DiscoveryMessage`], at
//! most [`MAX_PACKET_SIZE`] bytes. Requests carry a random `request_id`;
//! a reply is accepted only from the address the request went to.
//!
//! Candidates move `Unknown -> Pinged -> Verified` on a valid pong and go
//! `Stale` (then evicted) after repeated failures. A background maintenance
//! task keeps the local record's fork metadata current, follows endpoint
//! reports from peers, revalidates the table, looks up random targets while
//! under the peer target and hands dial candidates to the swarm task.
//!
//! Nothing a remote peer sends surfaces as an error: undecodable packets,
//! bad records and unsolicited replies are logged at `debug!` and dropped.

use libp2p::futures::future::join_all;
use libp2p::PeerId;
use parking_lot::Mutex;
use sentinel_core::clparams::{BeaconChainConfig, GenesisConfig};
use sentinel_core::codec;
use sentinel_core::constants::FAR_FUTURE_EPOCH;
use sentinel_core::error::CodecError;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::identity::{Endpoint, Eth2Field, LocalNode, NodeId, NodeRecord};
use crate::peers::{ConnectionState, SharedPeerTable};

/// Leading bytes of every discovery packet.
pub const PACKET_TAG: &[u8; 6] = b"sntdv1";

pub const MAX_PACKET_SIZE: usize = 1280;

/// Records carried by one `Nodes` reply; keeps the packet under
/// [`MAX_PACKET_SIZE`] with full-size records.
pub const MAX_RECORDS_PER_PACKET: usize = 3;

/// Concurrent queries per lookup round.
pub const ALPHA: usize = 3;

/// Pings issued per maintenance pass, per category.
const PINGS_PER_PASS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum DiscoveryMessage {
    Ping { request_id: u64, record: NodeRecord },
    /// `observed` is the sender address of the ping as seen by the responder.
    Pong { request_id: u64, record: NodeRecord, observed: SocketAddr },
    FindNode { request_id: u64, target: NodeId },
    Nodes { request_id: u64, records: Vec<NodeRecord> },
}

impl DiscoveryMessage {
    fn request_id(&self) -> u64 {
        match self {
            DiscoveryMessage::Ping { request_id, .. }
            | DiscoveryMessage::Pong { request_id, .. }
            | DiscoveryMessage::FindNode { request_id, .. }
            | DiscoveryMessage::Nodes { request_id, .. } => *request_id,
        }
    }
}

pub fn encode_packet(msg: &DiscoveryMessage) -> Result<Vec<u8>, DiscoveryError> {
    let body = codec::encode(msg)?;
    let size = PACKET_TAG.len() + body.len();
    if size > MAX_PACKET_SIZE {
        return Err(CodecError::TooLarge { size, max: MAX_PACKET_SIZE }.into());
    }
    let mut packet = Vec::with_capacity(size);
    packet.extend_from_slice(PACKET_TAG);
    packet.extend_from_slice(&body);
    Ok(packet)
}

pub fn decode_packet(bytes: &[u8]) -> Result<DiscoveryMessage, CodecError> {
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(CodecError::TooLarge { size: bytes.len(), max: MAX_PACKET_SIZE });
    }
    let body = bytes
        .strip_prefix(PACKET_TAG.as_slice())
        .ok_or_else(|| CodecError::Decode("missing packet tag".into()))?;
    codec::decode_bounded(body, MAX_PACKET_SIZE)
}

/// Fork schedule used to keep the advertised fork metadata current.
#[derive(Debug, Clone, Copy)]
pub struct ForkSchedule {
    pub beacon: BeaconChainConfig,
    pub genesis: GenesisConfig,
}

impl ForkSchedule {
    /// Fork metadata at unix time `now`.
    pub fn eth2_at(&self, now: u64) -> Eth2Field {
        let epoch = self.beacon.current_epoch(&self.genesis, now);
        let fork_digest = self.beacon.fork_digest_at(&self.genesis, epoch);
        match self.beacon.next_fork(epoch) {
            Some((next_fork_epoch, next_fork_version)) => {
                Eth2Field { fork_digest, next_fork_version, next_fork_epoch }
            }
            None => Eth2Field {
                fork_digest,
                next_fork_version: self.beacon.fork_version_at(epoch),
                next_fork_epoch: FAR_FUTURE_EPOCH,
            },
        }
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

struct PendingRequest {
    addr: SocketAddr,
    reply: oneshot::Sender<DiscoveryMessage>,
}

struct Inner {
    socket: UdpSocket,
    local: LocalNode,
    table: SharedPeerTable,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    config: DiscoveryConfig,
    schedule: ForkSchedule,
    /// Reported external endpoint -> distinct peers reporting it.
    votes: Mutex<HashMap<SocketAddr, HashSet<PeerId>>>,
    target_peers: usize,
    dial_tx: mpsc::Sender<NodeRecord>,
}

/// Handle to the discovery service. Cheap to clone.
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<Inner>,
}

impl Discovery {
    pub fn new(
        socket: UdpSocket,
        local: LocalNode,
        table: SharedPeerTable,
        config: DiscoveryConfig,
        schedule: ForkSchedule,
        target_peers: usize,
        dial_tx: mpsc::Sender<NodeRecord>,
    ) -> Self {
        let inner = Inner {
            socket,
            local,
            table,
            pending: Mutex::new(HashMap::new()),
            config,
            schedule,
            votes: Mutex::new(HashMap::new()),
            target_peers,
            dial_tx,
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        Ok(self.inner.socket.local_addr()?)
    }

    fn local_record(&self) -> NodeRecord {
        self.inner.local.read().record().clone()
    }

    /// Spawn the receive loop and the maintenance loop. The maintenance loop
    /// bootstraps from `seeds` first.
    pub fn spawn(&self, seeds: Vec<NodeRecord>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let recv = tokio::spawn(self.clone().recv_loop(shutdown.clone()));
        let maintain = tokio::spawn(self.clone().maintenance_loop(seeds, shutdown));
        vec![recv, maintain]
    }

    async fn recv_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                res = self.inner.socket.recv_from(&mut buf) => match res {
                    Ok((len, from)) => self.handle_packet(&buf[..len], from).await,
                    Err(e) => debug!(error = %e, "discovery: recv error"),
                },
            }
        }
        debug!("discovery: receive loop stopped");
    }

    async fn maintenance_loop(self, seeds: Vec<NodeRecord>, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = shutdown.changed() => return,
            verified = self.bootstrap(&seeds) => {
                if !seeds.is_empty() {
                    info!(seeds = seeds.len(), verified, "discovery: bootstrap complete");
                }
            }
        }

        let mut ticker = tokio::time::interval(self.inner.config.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.maintain() => {}
            }
        }
        debug!("discovery: maintenance loop stopped");
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    async fn handle_packet(&self, bytes: &[u8], from: SocketAddr) {
        let msg = match decode_packet(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(%from, error = %e, "discovery: dropping malformed packet");
                return;
            }
        };
        match msg {
            DiscoveryMessage::Ping { request_id, record } => {
                if let Err(e) = record.verify() {
                    debug!(%from, error = %e, "discovery: ping with invalid record");
                    return;
                }
                // A record only enters the table from its own endpoint;
                // otherwise it waits until a pong from that endpoint.
                if record.udp_addr() == from {
                    self.inner.table.lock().insert_record(record);
                } else {
                    debug!(%from, advertised = %record.udp_addr(), "discovery: ping record not bound to sender");
                }
                let pong = DiscoveryMessage::Pong { request_id, record: self.local_record(), observed: from };
                self.send(&pong, from).await;
            }
            DiscoveryMessage::FindNode { request_id, target } => {
                let mut records = self.inner.table.lock().closest_verified(&target, MAX_RECORDS_PER_PACKET);
                // Oversized records may push the reply past the packet limit.
                while encode_packet(&DiscoveryMessage::Nodes { request_id, records: records.clone() }).is_err() {
                    if records.pop().is_none() {
                        return;
                    }
                }
                self.send(&DiscoveryMessage::Nodes { request_id, records }, from).await;
            }
            reply @ (DiscoveryMessage::Pong { .. } | DiscoveryMessage::Nodes { .. }) => {
                let id = reply.request_id();
                let pending = {
                    let mut pending = self.inner.pending.lock();
                    match pending.get(&id) {
                        Some(p) if p.addr == from => pending.remove(&id),
                        _ => None,
                    }
                };
                match pending {
                    Some(p) => {
                        let _ = p.reply.send(reply);
                    }
                    None => debug!(%from, request_id = id, "discovery: unsolicited reply dropped"),
                }
            }
        }
    }

    async fn send(&self, msg: &DiscoveryMessage, to: SocketAddr) {
        match encode_packet(msg) {
            Ok(packet) => {
                if let Err(e) = self.inner.socket.send_to(&packet, to).await {
                    debug!(%to, error = %e, "discovery: send failed");
                }
            }
            Err(e) => warn!(error = %e, "discovery: failed to encode packet"),
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    async fn request(
        &self,
        addr: SocketAddr,
        build: impl FnOnce(u64) -> DiscoveryMessage,
    ) -> Result<DiscoveryMessage, DiscoveryError> {
        let request_id: u64 = rand::random();
        let packet = encode_packet(&build(request_id))?;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id, PendingRequest { addr, reply: tx });

        let result = match self.inner.socket.send_to(&packet, addr).await {
            Ok(_) => match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(_)) => Err(DiscoveryError::Stopped),
                Err(_) => Err(DiscoveryError::Timeout),
            },
            Err(e) => Err(DiscoveryError::Io(e)),
        };
        self.inner.pending.lock().remove(&request_id);
        result
    }

    /// Ping `record`; on a valid pong the peer is verified and its latest
    /// record returned.
    pub async fn ping(&self, record: &NodeRecord) -> Result<NodeRecord, DiscoveryError> {
        let peer = record.peer_id()?;
        let addr = record.udp_addr();
        self.inner.table.lock().mark_pinged(&peer);

        let local = self.local_record();
        let reply = self.request(addr, |request_id| DiscoveryMessage::Ping { request_id, record: local }).await;
        let (remote, observed) = match reply {
            Ok(DiscoveryMessage::Pong { record: remote, observed, .. })
                if remote.verify().is_ok() && remote.peer_id().ok() == Some(peer) =>
            {
                (remote, observed)
            }
            Ok(_) => {
                self.inner.table.lock().record_failure(&peer);
                return Err(DiscoveryError::UnexpectedReply(addr));
            }
            Err(e) => {
                self.inner.table.lock().record_failure(&peer);
                return Err(e);
            }
        };

        {
            let mut table = self.inner.table.lock();
            table.insert_record(remote.clone());
            table.mark_verified(&peer);
        }
        self.observe_endpoint(peer, observed);
        Ok(remote)
    }

    /// Ask `record` for the records it knows closest to `target`. Invalid
    /// records in the reply are discarded; valid ones enter the table.
    pub async fn find_node(&self, record: &NodeRecord, target: NodeId) -> Result<Vec<NodeRecord>, DiscoveryError> {
        let addr = record.udp_addr();
        let peer = record.peer_id()?;
        let reply = self.request(addr, |request_id| DiscoveryMessage::FindNode { request_id, target }).await;
        let records = match reply {
            Ok(DiscoveryMessage::Nodes { records, .. }) => records,
            Ok(_) => {
                self.inner.table.lock().record_failure(&peer);
                return Err(DiscoveryError::UnexpectedReply(addr));
            }
            Err(e) => {
                self.inner.table.lock().record_failure(&peer);
                return Err(e);
            }
        };

        let local_peer = self.inner.local.read().peer_id();
        let valid: Vec<NodeRecord> = records
            .into_iter()
            .take(MAX_RECORDS_PER_PACKET)
            .filter(|r| match r.verify() {
                Ok(()) => r.peer_id().ok() != Some(local_peer),
                Err(e) => {
                    debug!(%peer, error = %e, "discovery: discarding invalid record");
                    false
                }
            })
            .collect();

        let mut table = self.inner.table.lock();
        table.mark_verified(&peer);
        for r in &valid {
            table.insert_record(r.clone());
        }
        Ok(valid)
    }

    /// Seed the table and ping every seed. Returns the number of verified
    /// entries afterwards.
    pub async fn bootstrap(&self, seeds: &[NodeRecord]) -> usize {
        {
            let mut table = self.inner.table.lock();
            for seed in seeds {
                table.upsert_dialed(seed.clone());
            }
        }
        let results = join_all(seeds.iter().map(|s| self.ping(s))).await;
        for (seed, res) in seeds.iter().zip(&results) {
            if let Err(e) = res {
                debug!(addr = %seed.udp_addr(), error = %e, "discovery: seed did not answer");
            }
        }
        if results.iter().any(Result::is_ok) {
            let local = self.inner.local.read().node_id();
            self.lookup(local).await;
        }
        self.inner.table.lock().verified_count()
    }

    /// Iterative lookup of the records closest to `target`.
    ///
    /// Each round queries up to [`ALPHA`] of the closest unqueried records;
    /// the walk stops when a round learns nothing new or after
    /// `lookup_rounds` rounds. An empty result is not an error.
    pub async fn lookup(&self, target: NodeId) -> Vec<NodeRecord> {
        let width = self.inner.config.bucket_size.max(1);
        let local_peer = self.inner.local.read().peer_id();
        let mut known: HashMap<PeerId, NodeRecord> = self
            .inner
            .table
            .lock()
            .closest_known(&target, width)
            .into_iter()
            .filter_map(|r| r.peer_id().ok().map(|p| (p, r)))
            .collect();
        let mut queried: HashSet<PeerId> = HashSet::new();

        for round in 0..self.inner.config.lookup_rounds {
            let batch = closest(&known, &target, usize::MAX)
                .into_iter()
                .filter_map(|r| r.peer_id().ok().map(|p| (p, r)))
                .filter(|(p, _)| !queried.contains(p))
                .take(ALPHA)
                .collect::<Vec<_>>();
            if batch.is_empty() {
                break;
            }
            queried.extend(batch.iter().map(|(p, _)| *p));

            let replies = join_all(batch.iter().map(|(_, r)| self.find_node(r, target))).await;
            let mut learned = 0usize;
            for records in replies.into_iter().flatten() {
                for r in records {
                    let Ok(p) = r.peer_id() else { continue };
                    if p != local_peer && !known.contains_key(&p) {
                        known.insert(p, r);
                        learned += 1;
                    }
                }
            }
            debug!(round, learned, known = known.len(), "discovery: lookup round");
            if learned == 0 {
                break;
            }
        }
        closest(&known, &target, width)
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    async fn maintain(&self) {
        self.refresh_fork_metadata();

        let (unknown, revalidate) = {
            let table = self.inner.table.lock();
            (table.unknown_records(), table.needs_revalidation(self.inner.config.revalidate_after))
        };
        let to_ping: Vec<NodeRecord> = unknown
            .into_iter()
            .take(PINGS_PER_PASS)
            .chain(revalidate.into_iter().take(PINGS_PER_PASS))
            .collect();
        join_all(to_ping.iter().map(|r| self.ping(r))).await;

        let active = {
            let table = self.inner.table.lock();
            table.count_in(ConnectionState::Connected) + table.count_in(ConnectionState::Connecting)
        };
        if active < self.inner.target_peers {
            let found = self.lookup(NodeId::random()).await;
            debug!(found = found.len(), active, "discovery: random lookup");
            self.offer_dial_candidates(self.inner.target_peers - active);
        }
    }

    fn offer_dial_candidates(&self, wanted: usize) {
        let digest = self.inner.local.read().record().eth2.fork_digest;
        let candidates = self.inner.table.lock().dial_candidates(wanted, digest);
        for record in candidates {
            if self.inner.dial_tx.try_send(record).is_err() {
                break;
            }
        }
    }

    /// Re-sign the local record if the fork metadata moved on.
    fn refresh_fork_metadata(&self) {
        let eth2 = self.inner.schedule.eth2_at(unix_now());
        match self.inner.local.write().update_eth2(eth2) {
            Ok(true) => info!(fork_digest = %eth2.fork_digest, "discovery: local record re-signed for new fork"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "discovery: failed to re-sign local record"),
        }
    }

    /// Count an endpoint report from `voter`; once enough distinct peers
    /// agree on an address different from the advertised one, adopt it.
    fn observe_endpoint(&self, voter: PeerId, observed: SocketAddr) {
        let threshold = self.inner.config.endpoint_vote_threshold.max(1);
        let agreed = {
            let mut votes = self.inner.votes.lock();
            for voters in votes.values_mut() {
                voters.remove(&voter);
            }
            votes.retain(|_, v| !v.is_empty());
            let voters = votes.entry(observed).or_default();
            voters.insert(voter);
            voters.len() >= threshold
        };
        if !agreed {
            return;
        }

        let mut local = self.inner.local.write();
        let current = local.record().endpoint();
        if current.ip == observed.ip() && current.udp_port == observed.port() {
            return;
        }
        let endpoint = Endpoint { ip: observed.ip(), udp_port: observed.port(), tcp_port: current.tcp_port };
        match local.update_endpoint(endpoint) {
            Ok(true) => {
                info!(%observed, seq = local.seq(), "discovery: external endpoint updated");
                self.inner.votes.lock().clear();
            }
            Ok(false) => {}
            Err(e) => debug!(%observed, error = %e, "discovery: ignoring reported endpoint"),
        }
    }
}

fn closest(known: &HashMap<PeerId, NodeRecord>, target: &NodeId, n: usize) -> Vec<NodeRecord> {
    let mut sorted: Vec<(&NodeRecord, [u8; 32])> = known
        .iter()
        .map(|(p, r)| (r, NodeId::from_peer_id(p).distance(target)))
        .collect();
    sorted.sort_by(|a, b| a.1.cmp(&b.1));
    sorted.into_iter().take(n).map(|(r, _)| r.clone()).collect()
}
