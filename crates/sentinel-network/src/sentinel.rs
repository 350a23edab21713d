//! The [`Sentinel`] handle: composition root of the networking stack.
//!
//! [`Sentinel::start`] binds the discovery socket and the TCP listener,
//! derives the local record from the endpoint actually bound, and spawns
//! the discovery and swarm tasks. Every other method delegates to one of
//! the owned components.

use libp2p::gossipsub::IdentTopic;
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::SwarmEvent;
use libp2p::futures::StreamExt;
use libp2p::{noise, tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::behaviour::SentinelBehaviour;
use crate::config::SentinelConfig;
use crate::connection::ConnectionManager;
use crate::discovery::{unix_now, Discovery, ForkSchedule};
use crate::error::{ConnectionError, GossipError, RpcError, SentinelError};
use crate::gossip::{DeliveryReceiver, GossipEngine};
use crate::identity::{load_or_generate_keypair, Endpoint, LocalNode, NodeId, NodeIdentity, NodeRecord};
use crate::peers::{InsertOutcome, PeerTable};
use crate::protocol::{GoodbyeReason, MetadataV1, MetadataV2, Ping, ProtocolId, RpcRequest, RpcResponse, StatusMessage};
use crate::service::{Command, SwarmTask};
use crate::topics::{GossipObject, GossipTopic, TopicRegistry};

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const DIAL_QUEUE_CAPACITY: usize = 64;
const LISTEN_TIMEOUT: Duration = Duration::from_secs(5);
const DIAL_TIMEOUT: Duration = Duration::from_secs(15);
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(600);

/// Handle to a running node.
///
/// Dropping the handle signals every task to stop; [`Sentinel::stop`] also
/// waits for them to finish.
pub struct Sentinel {
    commands: mpsc::Sender<Command>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    local: LocalNode,
    peer_id: PeerId,
    connections: ConnectionManager,
    engine: Arc<GossipEngine>,
    discovery: Discovery,
    status: Mutex<StatusMessage>,
    request_timeout: Duration,
}

impl Sentinel {
    /// Bind sockets, build the local identity and spawn all tasks.
    ///
    /// On error nothing keeps running: sockets acquired so far are dropped
    /// before returning.
    pub async fn start(config: SentinelConfig) -> Result<Self, SentinelError> {
        config.validate()?;
        let keypair = match &config.node_key_path {
            Some(path) => load_or_generate_keypair(path)?,
            None => Keypair::generate_ed25519(),
        };
        let seeds = parse_bootnodes(&config.discovery.bootnodes)?;
        let schedule = ForkSchedule { beacon: config.beacon, genesis: config.genesis };
        let eth2 = schedule.eth2_at(unix_now());

        let udp_addr = config.discovery_addr();
        let listen_err = |addr: String| move |e: std::io::Error| SentinelError::Listen { addr, reason: e.to_string() };
        let socket = UdpSocket::bind(udp_addr).await.map_err(listen_err(udp_addr.to_string()))?;
        let udp_port = socket.local_addr().map_err(listen_err(udp_addr.to_string()))?.port();

        let mut swarm = build_swarm(keypair.clone(), &config)?;
        let registry = TopicRegistry::new(eth2.fork_digest);
        for (_, topic) in registry.topics() {
            swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&IdentTopic::new(topic))
                .map_err(|e| SentinelError::Transport(format!("subscribe {topic}: {e}")))?;
        }
        let tcp_port = listen(&mut swarm, &config.listen_multiaddr()).await?;

        let endpoint = Endpoint { ip: config.ip_addr, udp_port, tcp_port };
        let identity = NodeIdentity::new(keypair, endpoint, eth2, config.attnets)?;
        let peer_id = identity.peer_id();
        info!(%peer_id, udp_port, tcp_port, fork_digest = %eth2.fork_digest, "sentinel: starting");
        let table = PeerTable::new(identity.node_id(), config.discovery.bucket_size, config.discovery.max_failures).shared();
        let local: LocalNode = Arc::new(RwLock::new(identity));

        let connections = ConnectionManager::new(table.clone(), config.max_peers, config.backoff_base, config.backoff_max);
        let engine = Arc::new(GossipEngine::new(
            registry,
            config.gossip_queue_capacity,
            config.seen_cache_capacity,
            config.seen_cache_ttl,
            config.network.gossip_max_size,
        ));
        let status = StatusMessage { fork_digest: eth2.fork_digest, ..StatusMessage::default() };

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (dial_tx, dial_rx) = mpsc::channel(DIAL_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let discovery = Discovery::new(
            socket,
            local.clone(),
            table,
            config.discovery.clone(),
            schedule,
            config.target_peers,
            dial_tx,
        );
        let mut tasks = discovery.spawn(seeds, shutdown_rx.clone());
        let task = SwarmTask::new(
            swarm,
            command_rx,
            dial_rx,
            shutdown_rx,
            connections.clone(),
            engine.clone(),
            local.clone(),
            status,
        );
        tasks.push(tokio::spawn(task.run()));

        Ok(Self {
            commands: command_tx,
            shutdown_tx,
            tasks,
            local,
            peer_id,
            connections,
            engine,
            discovery,
            status: Mutex::new(status),
            request_timeout: config.request_timeout,
        })
    }

    /// Signal every task to stop and wait for them.
    ///
    /// Delivery queues close; in-flight requests resolve to
    /// [`RpcError::Cancelled`].
    pub async fn stop(mut self) {
        self.shutdown();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                error!(error = %e, "sentinel: task ended abnormally");
            }
        }
        self.engine.close_all();
        info!(peer_id = %self.peer_id, "sentinel: stopped");
    }

    /// Signal every task to stop without waiting for them.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn peers_count(&self) -> usize {
        self.connections.peer_count()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.connections.connected_peers()
    }

    /// Printable `enr:` form of the current local record.
    pub fn identity(&self) -> String {
        self.local.read().to_string()
    }

    pub fn record(&self) -> NodeRecord {
        self.local.read().record().clone()
    }

    /// Current reputation of `peer`; 0 for peers never scored.
    pub fn peer_score(&self, peer: &PeerId) -> i64 {
        self.connections.score(peer)
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local.read().node_id()
    }

    // -----------------------------------------------------------------------
    // Gossip
    // -----------------------------------------------------------------------

    /// Receiver for decoded objects arriving on `topic`.
    pub fn gossip_channel(&self, topic: GossipTopic) -> Option<DeliveryReceiver<GossipObject>> {
        self.engine.subscribe(topic)
    }

    /// Items dropped from `topic`'s queue because consumers fell behind.
    pub fn gossip_dropped(&self, topic: GossipTopic) -> u64 {
        self.engine.dropped(topic)
    }

    pub async fn publish(&self, object: &GossipObject) -> Result<(), GossipError> {
        let topic = self.engine.registry().topic_string(object.topic());
        let data = object.encode().map_err(|e| GossipError::Encode(e.to_string()))?;
        self.publish_raw(&topic, data).await
    }

    /// Publish pre-encoded bytes on a full topic string.
    pub async fn publish_raw(&self, topic: &str, data: Vec<u8>) -> Result<(), GossipError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Publish { topic: topic.to_string(), data, reply })
            .await
            .map_err(|_| GossipError::Stopped)?;
        rx.await.map_err(|_| GossipError::Stopped)?
    }

    // -----------------------------------------------------------------------
    // Request/response
    // -----------------------------------------------------------------------

    /// Send one request and wait for its response.
    ///
    /// A peer that is not connected is dialed first if its address is known.
    /// The deadline allows one request timeout for the dial and one for the
    /// exchange.
    pub async fn send_request(
        &self,
        peer: PeerId,
        protocol: ProtocolId,
        request: RpcRequest,
    ) -> Result<RpcResponse, RpcError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SendRequest { peer, protocol, request, reply })
            .await
            .map_err(|_| RpcError::Cancelled)?;
        match tokio::time::timeout(self.request_timeout * 2, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Cancelled),
            Err(_) => Err(RpcError::Timeout),
        }
    }

    pub async fn ping(&self, peer: PeerId) -> Result<Ping, RpcError> {
        let seq_number = self.local.read().seq();
        match self.send_request(peer, ProtocolId::PING_V1, RpcRequest::Ping(Ping { seq_number })).await? {
            RpcResponse::Pong(pong) => Ok(pong),
            other => Err(unexpected(ProtocolId::PING_V1, &other)),
        }
    }

    /// Metadata over the latest protocol version.
    pub async fn metadata(&self, peer: PeerId) -> Result<MetadataV2, RpcError> {
        match self.send_request(peer, ProtocolId::METADATA_V2, RpcRequest::MetaData).await? {
            RpcResponse::MetaDataV2(metadata) => Ok(metadata),
            other => Err(unexpected(ProtocolId::METADATA_V2, &other)),
        }
    }

    pub async fn metadata_v1(&self, peer: PeerId) -> Result<MetadataV1, RpcError> {
        match self.send_request(peer, ProtocolId::METADATA_V1, RpcRequest::MetaData).await? {
            RpcResponse::MetaDataV1(metadata) => Ok(metadata),
            other => Err(unexpected(ProtocolId::METADATA_V1, &other)),
        }
    }

    /// Exchange status with `peer`, returning theirs.
    pub async fn status(&self, peer: PeerId) -> Result<StatusMessage, RpcError> {
        let ours = *self.status.lock();
        match self.send_request(peer, ProtocolId::STATUS_V1, RpcRequest::Status(ours)).await? {
            RpcResponse::Status(theirs) => Ok(theirs),
            other => Err(unexpected(ProtocolId::STATUS_V1, &other)),
        }
    }

    /// Ping a random connected peer.
    pub async fn send_ping_req_v1(&self) -> Result<Ping, RpcError> {
        let peer = self.random_peer()?;
        self.ping(peer).await
    }

    /// Request v1 metadata from a random connected peer.
    pub async fn send_metadata_req_v1(&self) -> Result<MetadataV1, RpcError> {
        let peer = self.random_peer()?;
        self.metadata_v1(peer).await
    }

    /// Replace the status served to peers.
    pub async fn set_status(&self, status: StatusMessage) -> Result<(), RpcError> {
        *self.status.lock() = status;
        self.commands.send(Command::SetStatus(status)).await.map_err(|_| RpcError::Cancelled)
    }

    fn random_peer(&self) -> Result<PeerId, RpcError> {
        self.connections.connected_peers().choose(&mut rand::thread_rng()).copied().ok_or(RpcError::NoPeers)
    }

    // -----------------------------------------------------------------------
    // Connections and discovery
    // -----------------------------------------------------------------------

    /// Dial `record`, resolving once the connection is established.
    pub async fn dial(&self, record: NodeRecord) -> Result<PeerId, ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Dial { record, reply }).await.map_err(|_| ConnectionError::Stopped)?;
        match tokio::time::timeout(DIAL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectionError::Stopped),
            Err(_) => Err(ConnectionError::DialFailed("timed out".into())),
        }
    }

    /// Say goodbye with `reason`, then close the connection.
    pub async fn disconnect(&self, peer: PeerId, reason: GoodbyeReason) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Disconnect { peer, reason, reply })
            .await
            .map_err(|_| ConnectionError::Stopped)?;
        rx.await.map_err(|_| ConnectionError::Stopped)
    }

    pub async fn goodbye(&self, peer: PeerId, reason: GoodbyeReason) -> Result<(), ConnectionError> {
        self.disconnect(peer, reason).await
    }

    /// Iterative lookup for records closest to `target`.
    pub async fn lookup(&self, target: NodeId) -> Vec<NodeRecord> {
        self.discovery.lookup(target).await
    }

    /// Offer a record to the peer table, as discovery would.
    pub fn add_peer_record(&self, record: NodeRecord) -> InsertOutcome {
        self.connections.table().lock().insert_record(record)
    }
}

impl Drop for Sentinel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Display for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity())
    }
}

impl fmt::Debug for Sentinel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sentinel")
            .field("peer_id", &self.peer_id)
            .field("peers", &self.peers_count())
            .finish_non_exhaustive()
    }
}

fn unexpected(protocol: ProtocolId, response: &RpcResponse) -> RpcError {
    RpcError::Decode(format!("unexpected {protocol} response: {response:?}"))
}

fn parse_bootnodes(bootnodes: &[String]) -> Result<Vec<NodeRecord>, SentinelError> {
    bootnodes
        .iter()
        .map(|s| s.parse::<NodeRecord>().map_err(|e| SentinelError::Config(format!("bootnode {s}: {e}"))))
        .collect()
}

fn build_swarm(keypair: Keypair, config: &SentinelConfig) -> Result<Swarm<SentinelBehaviour>, SentinelError> {
    let behaviour = SentinelBehaviour::new(&keypair, config).map_err(SentinelError::Transport)?;
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(tcp::Config::default().nodelay(true), noise::Config::new, yamux::Config::default)
        .map_err(|e| SentinelError::Transport(format!("TCP transport error: {e}")))?
        .with_dns()
        .map_err(|e| SentinelError::Transport(format!("DNS transport error: {e}")))?
        .with_behaviour(|_| Ok(behaviour))
        .map_err(|e| SentinelError::Transport(format!("behaviour error: {e}")))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();
    Ok(swarm)
}

/// Start listening on `addr` and return the TCP port actually bound.
async fn listen(swarm: &mut Swarm<SentinelBehaviour>, addr: &str) -> Result<u16, SentinelError> {
    let fail = |reason: String| SentinelError::Listen { addr: addr.to_string(), reason };
    let multiaddr: Multiaddr = addr.parse().map_err(|e| SentinelError::Config(format!("listen address {addr}: {e}")))?;
    swarm.listen_on(multiaddr).map_err(|e| fail(e.to_string()))?;

    let bound = async {
        loop {
            match swarm.select_next_some().await {
                SwarmEvent::NewListenAddr { address, .. } => {
                    let port = address.iter().find_map(|p| match p {
                        Protocol::Tcp(port) => Some(port),
                        _ => None,
                    });
                    if let Some(port) = port {
                        return Ok(port);
                    }
                }
                SwarmEvent::ListenerError { error, .. } => return Err(fail(error.to_string())),
                SwarmEvent::ListenerClosed { reason, .. } => {
                    warn!(?reason, "sentinel: listener closed during startup");
                    return Err(fail(format!("{reason:?}")));
                }
                _ => {}
            }
        }
    };
    tokio::time::timeout(LISTEN_TIMEOUT, bound).await.map_err(|_| fail("timed out".into()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootnodes_must_parse() {
        let err = parse_bootnodes(&["enr:not-a-record".to_string()]).unwrap_err();
        assert!(matches!(err, SentinelError::Config(_)));
        assert!(parse_bootnodes(&[]).unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_reports_bound_ports() {
        let node = Sentinel::start(SentinelConfig::local_testing()).await.unwrap();
        let record = node.record();
        assert_ne!(record.udp_port, 0);
        assert_ne!(record.tcp_port, 0);
        assert!(node.identity().starts_with("enr:"));
        assert_eq!(node.to_string(), node.identity());
        assert_eq!(node.peers_count(), 0);
        node.stop().await;
    }

    #[tokio::test]
    async fn requests_without_peers_fail_fast() {
        let node = Sentinel::start(SentinelConfig::local_testing()).await.unwrap();
        assert_eq!(node.send_ping_req_v1().await, Err(RpcError::NoPeers));
        assert_eq!(node.send_metadata_req_v1().await, Err(RpcError::NoPeers));
        let unknown = PeerId::random();
        assert!(matches!(node.ping(unknown).await, Err(RpcError::PeerUnreachable(_))));
        node.stop().await;
    }

    #[tokio::test]
    async fn unsupported_protocol_fails_without_peers() {
        let node = Sentinel::start(SentinelConfig::local_testing()).await.unwrap();
        let ping_v2 = ProtocolId { method: crate::protocol::RpcMethod::Ping, version: 2 };
        let err = node.send_request(PeerId::random(), ping_v2, RpcRequest::Ping(Ping::default())).await.unwrap_err();
        assert!(matches!(err, RpcError::UnsupportedVersion { version: 2, .. }), "{err}");
        node.stop().await;
    }

    #[tokio::test]
    async fn publish_to_unknown_topic_rejected() {
        let node = Sentinel::start(SentinelConfig::local_testing()).await.unwrap();
        let err = node.publish_raw("/eth2/00000000/nope/bincode", vec![1, 2, 3]).await.unwrap_err();
        assert!(matches!(err, GossipError::UnknownTopic(_)));
        node.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_gossip_channels() {
        let node = Sentinel::start(SentinelConfig::local_testing()).await.unwrap();
        let rx = node.gossip_channel(GossipTopic::BeaconBlock).unwrap();
        node.stop().await;
        assert!(rx.is_closed());
        assert!(rx.recv().await.is_none());
    }
}
