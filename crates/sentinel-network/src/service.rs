//! Swarm task: the single owner of the libp2p swarm.
//!
//! The [`crate::Sentinel`] handle talks to this task over a command channel;
//! discovery feeds it dial candidates over a bounded channel. One
//! `tokio::select!` loop waits on commands, dial candidates, the shutdown
//! signal, a housekeeping timer and swarm events, so events from a single
//! connection are processed in the order they arrive.
//!
//! On exit every pending request and dial is dropped, which the waiting
//! callers observe as cancellation.

use libp2p::futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic, MessageAcceptance};
use libp2p::request_response::{self, OutboundFailure, OutboundRequestId};
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::SwarmEvent;
use libp2p::{identify, PeerId, Swarm};
use std::collections::{HashMap, HashSet};
use std::io;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::behaviour::{SentinelBehaviour, SentinelBehaviourEvent};
use crate::connection::ConnectionManager;
use crate::error::{ConnectionError, GossipError, RpcError};
use crate::gossip::{GossipEngine, GossipOutcome};
use crate::identity::{LocalNode, NodeRecord};
use crate::peer_scoring::{
    BONUS_VALID_GOSSIP, BONUS_VALID_RESPONSE, PENALTY_INVALID_GOSSIP, PENALTY_RATE_LIMITED, PENALTY_RPC_DECODE,
    PENALTY_TIMEOUT, SCORE_RETENTION,
};
use crate::peers::Direction;
use crate::protocol::{
    protocol_codec, GoodbyeReason, MetadataV1, MetadataV2, Ping, ProtocolId, ResponseCode, RpcRequest, RpcResponse,
    StatusMessage,
};
use crate::rate_limiter::RateLimiter;
use std::sync::Arc;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) type RpcReply = oneshot::Sender<Result<RpcResponse, RpcError>>;
pub(crate) type DialReply = oneshot::Sender<Result<PeerId, ConnectionError>>;

/// Requests from the [`crate::Sentinel`] handle to the swarm task.
#[derive(Debug)]
pub(crate) enum Command {
    Publish { topic: String, data: Vec<u8>, reply: oneshot::Sender<Result<(), GossipError>> },
    SendRequest { peer: PeerId, protocol: ProtocolId, request: RpcRequest, reply: RpcReply },
    Dial { record: NodeRecord, reply: DialReply },
    /// Say goodbye with `reason`, then close the connection.
    Disconnect { peer: PeerId, reason: GoodbyeReason, reply: oneshot::Sender<()> },
    SetStatus(StatusMessage),
}

pub(crate) struct SwarmTask {
    swarm: Swarm<SentinelBehaviour>,
    commands: mpsc::Receiver<Command>,
    dial_rx: mpsc::Receiver<NodeRecord>,
    shutdown: watch::Receiver<bool>,
    connections: ConnectionManager,
    engine: Arc<GossipEngine>,
    local: LocalNode,
    rate_limiter: RateLimiter,
    status: StatusMessage,
    pending_requests: HashMap<(ProtocolId, OutboundRequestId), RpcReply>,
    pending_dials: HashMap<PeerId, Vec<DialReply>>,
    /// Goodbyes in flight; the connection closes when each completes.
    goodbyes: HashMap<OutboundRequestId, (PeerId, Option<oneshot::Sender<()>>)>,
    /// Status requests sent on connect.
    handshakes: HashSet<OutboundRequestId>,
    /// Peers that said goodbye; closed once the ack is sent.
    closing: HashSet<PeerId>,
}

impl SwarmTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        swarm: Swarm<SentinelBehaviour>,
        commands: mpsc::Receiver<Command>,
        dial_rx: mpsc::Receiver<NodeRecord>,
        shutdown: watch::Receiver<bool>,
        connections: ConnectionManager,
        engine: Arc<GossipEngine>,
        local: LocalNode,
        status: StatusMessage,
    ) -> Self {
        Self {
            swarm,
            commands,
            dial_rx,
            shutdown,
            connections,
            engine,
            local,
            rate_limiter: RateLimiter::new(),
            status,
            pending_requests: HashMap::new(),
            pending_dials: HashMap::new(),
            goodbyes: HashMap::new(),
            handshakes: HashSet::new(),
            closing: HashSet::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => break,
                },
                Some(record) = self.dial_rx.recv() => {
                    if let Err(e) = self.start_dial(record) {
                        debug!(error = %e, "swarm: dial candidate skipped");
                    }
                }
                _ = housekeeping.tick() => self.housekeeping(),
                event = self.swarm.select_next_some() => self.on_swarm_event(event),
            }
        }

        info!(
            pending_requests = self.pending_requests.len(),
            pending_dials = self.pending_dials.len(),
            "swarm: shutting down"
        );
        self.engine.close_all();
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Publish { topic, data, reply } => {
                let _ = reply.send(self.publish(topic, data));
            }
            Command::SendRequest { peer, protocol, request, reply } => {
                self.send_request(peer, protocol, request, reply);
            }
            Command::Dial { record, reply } => match self.start_dial(record) {
                Ok(peer) => self.pending_dials.entry(peer).or_default().push(reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Disconnect { peer, reason, reply } => self.say_goodbye(peer, reason, Some(reply)),
            Command::SetStatus(status) => self.status = status,
        }
    }

    fn publish(&mut self, topic: String, data: Vec<u8>) -> Result<(), GossipError> {
        if self.engine.registry().lookup(&topic).is_none() {
            return Err(GossipError::UnknownTopic(topic));
        }
        let id = self.engine.check_publish(&topic, &data)?;
        let size = data.len();
        match self.swarm.behaviour_mut().gossipsub.publish(IdentTopic::new(topic.as_str()), data) {
            Ok(_) => {
                self.engine.mark_published(id);
                debug!(topic, size, "swarm: published");
                Ok(())
            }
            Err(gossipsub::PublishError::InsufficientPeers) => Err(GossipError::InsufficientPeers),
            Err(gossipsub::PublishError::Duplicate) => Err(GossipError::Duplicate),
            Err(gossipsub::PublishError::MessageTooLarge) => {
                Err(GossipError::MessageTooLarge { size, max: self.engine.max_size() })
            }
            Err(e) => Err(GossipError::Publish(e.to_string())),
        }
    }

    fn send_request(&mut self, peer: PeerId, protocol: ProtocolId, request: RpcRequest, reply: RpcReply) {
        // Unsupported versions and bodies of the wrong shape fail here, before
        // anything reaches the peer or its score.
        let codec = match protocol_codec(protocol.method, protocol.version) {
            Ok(codec) => codec,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        if let Err(e) = (codec.encode_request)(&request) {
            let _ = reply.send(Err(RpcError::Encode(e.to_string())));
            return;
        }
        if !self.swarm.is_connected(&peer) {
            match self.connections.addr_of(&peer) {
                Some(addr) => {
                    self.swarm.add_peer_address(peer, addr);
                }
                None => {
                    let _ = reply.send(Err(RpcError::PeerUnreachable(format!("no address for {peer}"))));
                    return;
                }
            }
        }
        let Some(rpc) = self.swarm.behaviour_mut().rpc_mut(protocol) else {
            let _ = reply.send(Err(RpcError::UnsupportedVersion {
                method: protocol.method.name().to_string(),
                version: protocol.version,
            }));
            return;
        };
        let request_id = rpc.send_request(&peer, request);
        self.pending_requests.insert((protocol, request_id), reply);
    }

    /// Reserve a slot for `record` and dial it.
    fn start_dial(&mut self, record: NodeRecord) -> Result<PeerId, ConnectionError> {
        let peer = record.peer_id().map_err(|e| ConnectionError::DialFailed(e.to_string()))?;
        let addr = record.tcp_multiaddr().map_err(|e| ConnectionError::DialFailed(e.to_string()))?;
        self.connections.table().lock().upsert_dialed(record);
        self.connections.reserve_dial(peer, Some(addr.clone()))?;

        let opts = DialOpts::peer_id(peer)
            .addresses(vec![addr])
            .condition(PeerCondition::DisconnectedAndNotDialing)
            .build();
        if let Err(e) = self.swarm.dial(opts) {
            self.connections.dial_failed(&peer);
            return Err(ConnectionError::DialFailed(e.to_string()));
        }
        debug!(%peer, "swarm: dialing");
        Ok(peer)
    }

    fn say_goodbye(&mut self, peer: PeerId, reason: GoodbyeReason, reply: Option<oneshot::Sender<()>>) {
        if !self.swarm.is_connected(&peer) {
            if let Some(reply) = reply {
                let _ = reply.send(());
            }
            return;
        }
        info!(%peer, reason = reason.code(), "swarm: sending goodbye");
        let Some(rpc) = self.swarm.behaviour_mut().rpc_mut(ProtocolId::GOODBYE_V1) else {
            let _ = self.swarm.disconnect_peer_id(peer);
            if let Some(reply) = reply {
                let _ = reply.send(());
            }
            return;
        };
        let request_id = rpc.send_request(&peer, RpcRequest::Goodbye(reason));
        self.goodbyes.insert(request_id, (peer, reply));
    }

    fn finish_goodbye(&mut self, request_id: &OutboundRequestId) -> bool {
        let Some((peer, reply)) = self.goodbyes.remove(request_id) else {
            return false;
        };
        let _ = self.swarm.disconnect_peer_id(peer);
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
        true
    }

    fn penalize(&mut self, peer: PeerId, penalty: i64) {
        if self.connections.penalize(&peer, penalty) {
            self.say_goodbye(peer, GoodbyeReason::ScoreTooLow, None);
        }
    }

    fn housekeeping(&mut self) {
        let unbanned = self.connections.unban_expired();
        if !unbanned.is_empty() {
            info!(count = unbanned.len(), "swarm: bans expired");
        }
        let pruned = self.connections.prune_scores(SCORE_RETENTION);
        if pruned > 0 {
            debug!(pruned, "swarm: idle peer scores dropped");
        }
        debug!(
            peers = self.connections.peer_count(),
            pending_requests = self.pending_requests.len(),
            "swarm: housekeeping"
        );
    }

    // -----------------------------------------------------------------------
    // Swarm events
    // -----------------------------------------------------------------------

    fn on_swarm_event(&mut self, event: SwarmEvent<SentinelBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(SentinelBehaviourEvent::Gossipsub(event)) => self.on_gossip(event),
            SwarmEvent::Behaviour(SentinelBehaviourEvent::Status(event)) => self.on_rpc(ProtocolId::STATUS_V1, event),
            SwarmEvent::Behaviour(SentinelBehaviourEvent::Goodbye(event)) => self.on_rpc(ProtocolId::GOODBYE_V1, event),
            SwarmEvent::Behaviour(SentinelBehaviourEvent::Ping(event)) => self.on_rpc(ProtocolId::PING_V1, event),
            SwarmEvent::Behaviour(SentinelBehaviourEvent::MetadataV1(event)) => {
                self.on_rpc(ProtocolId::METADATA_V1, event)
            }
            SwarmEvent::Behaviour(SentinelBehaviourEvent::MetadataV2(event)) => {
                self.on_rpc(ProtocolId::METADATA_V2, event)
            }
            SwarmEvent::Behaviour(SentinelBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. })) => {
                debug!(%peer_id, agent = %info.agent_version, "swarm: identify received");
            }

            SwarmEvent::ConnectionEstablished { peer_id, endpoint, num_established, .. } => {
                if num_established.get() > 1 {
                    return;
                }
                let direction = if endpoint.is_dialer() { Direction::Outbound } else { Direction::Inbound };
                let addr = endpoint.get_remote_address().clone();
                match self.connections.accept(peer_id, direction, Some(addr)) {
                    Ok(()) => {
                        self.resolve_dial(&peer_id, Ok(peer_id));
                        let status = RpcRequest::Status(self.status);
                        if direction == Direction::Outbound {
                            if let Some(rpc) = self.swarm.behaviour_mut().rpc_mut(ProtocolId::STATUS_V1) {
                                let id = rpc.send_request(&peer_id, status);
                                self.handshakes.insert(id);
                            }
                        }
                    }
                    Err(e) => {
                        debug!(%peer_id, error = %e, "swarm: connection refused");
                        self.resolve_dial(&peer_id, Err(e));
                        let _ = self.swarm.disconnect_peer_id(peer_id);
                    }
                }
            }

            SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                if num_established == 0 {
                    self.connections.disconnected(&peer_id);
                    self.rate_limiter.remove_peer(&peer_id);
                    self.closing.remove(&peer_id);
                }
            }

            SwarmEvent::OutgoingConnectionError { peer_id: Some(peer), error, .. } => {
                debug!(%peer, %error, "swarm: outgoing connection failed");
                self.connections.dial_failed(&peer);
                self.resolve_dial(&peer, Err(ConnectionError::DialFailed(error.to_string())));
            }

            SwarmEvent::NewListenAddr { address, .. } => info!(%address, "swarm: listening"),
            SwarmEvent::ListenerError { error, .. } => error!(%error, "swarm: listener error"),
            SwarmEvent::ListenerClosed { addresses, reason, .. } => {
                warn!(?addresses, ?reason, "swarm: listener closed");
            }
            _ => {}
        }
    }

    fn resolve_dial(&mut self, peer: &PeerId, result: Result<PeerId, ConnectionError>) {
        if let Some(waiters) = self.pending_dials.remove(peer) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    fn on_gossip(&mut self, event: gossipsub::Event) {
        let gossipsub::Event::Message { propagation_source, message_id, message } = event else {
            return;
        };
        let outcome = self.engine.on_receive(&propagation_source, message.topic.as_str(), &message.data);
        let acceptance = match &outcome {
            GossipOutcome::Accepted(topic) => {
                debug!(%propagation_source, %topic, size = message.data.len(), "swarm: gossip accepted");
                self.connections.reward(&propagation_source, BONUS_VALID_GOSSIP);
                MessageAcceptance::Accept
            }
            GossipOutcome::Duplicate | GossipOutcome::UnknownTopic => MessageAcceptance::Ignore,
            GossipOutcome::Invalid(reason) => {
                warn!(%propagation_source, topic = %message.topic, %reason, "swarm: invalid gossip");
                MessageAcceptance::Reject
            }
        };
        let _ = self
            .swarm
            .behaviour_mut()
            .gossipsub
            .report_message_validation_result(&message_id, &propagation_source, acceptance);

        if matches!(outcome, GossipOutcome::Invalid(_)) {
            self.penalize(propagation_source, PENALTY_INVALID_GOSSIP);
            let _ = self.swarm.disconnect_peer_id(propagation_source);
        }
    }

    fn on_rpc(&mut self, protocol: ProtocolId, event: request_response::Event<RpcRequest, RpcResponse>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request { request, channel, .. } => {
                    let response = self.answer(peer, protocol, request);
                    let sent = match self.swarm.behaviour_mut().rpc_mut(protocol) {
                        Some(rpc) => rpc.send_response(channel, response).is_ok(),
                        None => false,
                    };
                    if !sent {
                        debug!(%peer, %protocol, "swarm: response channel closed");
                    }
                }
                request_response::Message::Response { request_id, response } => {
                    self.on_response(peer, protocol, request_id, response);
                }
            },
            request_response::Event::OutboundFailure { peer, request_id, error, .. } => {
                if protocol == ProtocolId::GOODBYE_V1 && self.finish_goodbye(&request_id) {
                    return;
                }
                if protocol == ProtocolId::STATUS_V1 && self.handshakes.remove(&request_id) {
                    debug!(%peer, %error, "swarm: status handshake failed");
                    return;
                }
                let err = self.classify_failure(peer, error);
                debug!(%peer, %protocol, error = %err, "swarm: request failed");
                if let Some(reply) = self.pending_requests.remove(&(protocol, request_id)) {
                    let _ = reply.send(Err(err));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!(%peer, %protocol, %error, "swarm: inbound request failed");
                if self.closing.remove(&peer) {
                    let _ = self.swarm.disconnect_peer_id(peer);
                }
            }
            request_response::Event::ResponseSent { peer, .. } => {
                if protocol == ProtocolId::GOODBYE_V1 && self.closing.remove(&peer) {
                    let _ = self.swarm.disconnect_peer_id(peer);
                }
            }
        }
    }

    /// Build the response to an inbound request.
    fn answer(&mut self, peer: PeerId, protocol: ProtocolId, request: RpcRequest) -> RpcResponse {
        if !self.rate_limiter.admit(&peer, protocol.method) {
            self.penalize(peer, PENALTY_RATE_LIMITED);
            return RpcResponse::error(ResponseCode::ResourceUnavailable, "rate limited");
        }
        let (seq_number, attnets, syncnets) = {
            let local = self.local.read();
            (local.seq(), local.record().attnets, local.record().syncnets)
        };
        match request {
            RpcRequest::Ping(ping) => {
                debug!(%peer, remote_seq = ping.seq_number, "swarm: ping");
                RpcResponse::Pong(Ping { seq_number })
            }
            RpcRequest::MetaData if protocol.version == 1 => RpcResponse::MetaDataV1(MetadataV1 { seq_number, attnets }),
            RpcRequest::MetaData => RpcResponse::MetaDataV2(MetadataV2 { seq_number, attnets, syncnets }),
            RpcRequest::Status(remote) => {
                if remote.fork_digest != self.status.fork_digest {
                    info!(%peer, remote = %remote.fork_digest, "swarm: peer on another fork");
                    self.say_goodbye(peer, GoodbyeReason::IrrelevantNetwork, None);
                }
                RpcResponse::Status(self.status)
            }
            RpcRequest::Goodbye(reason) => {
                info!(%peer, reason = reason.code(), "swarm: peer said goodbye");
                self.closing.insert(peer);
                RpcResponse::GoodbyeAck
            }
        }
    }

    fn on_response(&mut self, peer: PeerId, protocol: ProtocolId, request_id: OutboundRequestId, response: RpcResponse) {
        if protocol == ProtocolId::GOODBYE_V1 && self.finish_goodbye(&request_id) {
            return;
        }
        if protocol == ProtocolId::STATUS_V1 && self.handshakes.remove(&request_id) {
            if let RpcResponse::Status(remote) = response {
                if remote.fork_digest != self.status.fork_digest {
                    self.say_goodbye(peer, GoodbyeReason::IrrelevantNetwork, None);
                }
            }
            return;
        }
        let Some(reply) = self.pending_requests.remove(&(protocol, request_id)) else {
            debug!(%peer, %protocol, "swarm: response without a waiter");
            return;
        };
        let result = match response {
            RpcResponse::Error { code, message } => Err(RpcError::Remote { code: code as u8, message }),
            other => {
                self.connections.reward(&peer, BONUS_VALID_RESPONSE);
                Ok(other)
            }
        };
        let _ = reply.send(result);
    }

    fn classify_failure(&mut self, peer: PeerId, error: OutboundFailure) -> RpcError {
        match error {
            OutboundFailure::Timeout => {
                self.penalize(peer, PENALTY_TIMEOUT);
                RpcError::Timeout
            }
            OutboundFailure::DialFailure => RpcError::PeerUnreachable("dial failed".into()),
            OutboundFailure::ConnectionClosed => RpcError::PeerUnreachable("connection closed".into()),
            OutboundFailure::UnsupportedProtocols => RpcError::StreamRejected("protocol not supported by peer".into()),
            // Requests are encoded before sending, so invalid data here came
            // from the peer's response.
            OutboundFailure::Io(e) if e.kind() == io::ErrorKind::InvalidData => {
                self.penalize(peer, PENALTY_RPC_DECODE);
                RpcError::Decode(e.to_string())
            }
            OutboundFailure::Io(e) => RpcError::StreamRejected(e.to_string()),
            #[allow(unreachable_patterns)]
            other => RpcError::StreamRejected(other.to_string()),
        }
    }
}
