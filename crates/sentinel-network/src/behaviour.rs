//! Composite libp2p [`NetworkBehaviour`] for the Sentinel node.
//!
//! Combines connection limits (capacity enforced before a connection is
//! established), Gossipsub (mesh layer under the gossip engine), Identify,
//! and one request-response behaviour per supported protocol version.

use crate::config::SentinelConfig;
use crate::protocol::{ProtocolId, RpcMethod, SentinelCodec};
use crate::topics::message_id;
use libp2p::connection_limits::{self, ConnectionLimits};
use libp2p::gossipsub;
use libp2p::identity::Keypair;
use libp2p::request_response::{self, ProtocolSupport};
use libp2p::identify;
use libp2p::swarm::NetworkBehaviour;
use std::time::Duration;

/// Protocol version string used in Identify.
pub const PROTOCOL_VERSION: &str = "/eth2/sentinel/1.0.0";

/// Room for the gossipsub envelope (signature, key, topic) around a payload.
const GOSSIP_ENVELOPE_OVERHEAD: usize = 1024;

#[derive(NetworkBehaviour)]
pub struct SentinelBehaviour {
    /// Refuses connections beyond the configured peer limit.
    pub connection_limits: connection_limits::Behaviour,
    pub gossipsub: gossipsub::Behaviour,
    pub identify: identify::Behaviour,
    pub status: request_response::Behaviour<SentinelCodec>,
    pub goodbye: request_response::Behaviour<SentinelCodec>,
    pub ping: request_response::Behaviour<SentinelCodec>,
    pub metadata_v1: request_response::Behaviour<SentinelCodec>,
    pub metadata_v2: request_response::Behaviour<SentinelCodec>,
}

impl SentinelBehaviour {
    pub fn new(keypair: &Keypair, config: &SentinelConfig) -> Result<Self, String> {
        let limits = ConnectionLimits::default()
            .with_max_established(Some(config.max_peers as u32))
            .with_max_established_per_peer(Some(1));
        let codec = SentinelCodec::new(config.network.max_chunk_size);
        let timeout = config.request_timeout;
        Ok(Self {
            connection_limits: connection_limits::Behaviour::new(limits),
            gossipsub: build_gossipsub(
                keypair,
                config.gossipsub_heartbeat,
                config.network.gossip_max_size,
                config.seen_cache_ttl,
            )?,
            identify: identify::Behaviour::new(identify::Config::new(
                PROTOCOL_VERSION.to_string(),
                keypair.public(),
            )),
            status: build_rpc(ProtocolId::STATUS_V1, codec.clone(), timeout)?,
            goodbye: build_rpc(ProtocolId::GOODBYE_V1, codec.clone(), timeout)?,
            ping: build_rpc(ProtocolId::PING_V1, codec.clone(), timeout)?,
            metadata_v1: build_rpc(ProtocolId::METADATA_V1, codec.clone(), timeout)?,
            metadata_v2: build_rpc(ProtocolId::METADATA_V2, codec, timeout)?,
        })
    }

    /// The request-response behaviour serving `protocol`, if it is supported.
    pub fn rpc_mut(&mut self, protocol: ProtocolId) -> Option<&mut request_response::Behaviour<SentinelCodec>> {
        match (protocol.method, protocol.version) {
            (RpcMethod::Status, 1) => Some(&mut self.status),
            (RpcMethod::Goodbye, 1) => Some(&mut self.goodbye),
            (RpcMethod::Ping, 1) => Some(&mut self.ping),
            (RpcMethod::MetaData, 1) => Some(&mut self.metadata_v1),
            (RpcMethod::MetaData, 2) => Some(&mut self.metadata_v2),
            _ => None,
        }
    }
}

/// Build a gossipsub behaviour keyed on content identifiers.
///
/// Message ids follow [`message_id`], so gossipsub's own duplicate cache and
/// the gossip engine agree on identity. Validation is manual: every message
/// is held until the engine reports Accept, Ignore or Reject.
pub fn build_gossipsub(
    keypair: &Keypair,
    heartbeat: Duration,
    max_payload: usize,
    duplicate_ttl: Duration,
) -> Result<gossipsub::Behaviour, String> {
    let message_id_fn = |message: &gossipsub::Message| {
        gossipsub::MessageId::from(message_id(message.topic.as_str(), &message.data).to_vec())
    };

    let config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(heartbeat)
        .validation_mode(gossipsub::ValidationMode::Strict)
        .validate_messages()
        .max_transmit_size(max_payload + GOSSIP_ENVELOPE_OVERHEAD)
        .duplicate_cache_time(duplicate_ttl)
        .message_id_fn(message_id_fn)
        .build()
        .map_err(|e| format!("gossipsub config error: {e}"))?;

    gossipsub::Behaviour::new(gossipsub::MessageAuthenticity::Signed(keypair.clone()), config)
        .map_err(|e| format!("gossipsub behaviour error: {e}"))
}

fn build_rpc(
    protocol: ProtocolId,
    codec: SentinelCodec,
    timeout: Duration,
) -> Result<request_response::Behaviour<SentinelCodec>, String> {
    let name = protocol.stream_protocol().map_err(|e| e.to_string())?;
    Ok(request_response::Behaviour::with_codec(
        codec,
        [(name, ProtocolSupport::Full)],
        request_response::Config::default().with_request_timeout(timeout),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_gossipsub_succeeds() {
        let key = Keypair::generate_ed25519();
        let gs = build_gossipsub(&key, Duration::from_secs(1), 1 << 20, Duration::from_secs(60));
        assert!(gs.is_ok());
    }

    #[test]
    fn behaviour_builds_from_default_config() {
        let key = Keypair::generate_ed25519();
        assert!(SentinelBehaviour::new(&key, &SentinelConfig::default()).is_ok());
    }

    #[test]
    fn only_supported_protocols_have_a_behaviour() {
        let key = Keypair::generate_ed25519();
        let mut behaviour = SentinelBehaviour::new(&key, &SentinelConfig::default()).unwrap();
        for protocol in ProtocolId::SUPPORTED {
            assert!(behaviour.rpc_mut(protocol).is_some(), "{protocol}");
        }
        assert!(behaviour.rpc_mut(ProtocolId { method: RpcMethod::Ping, version: 2 }).is_none());
        assert!(behaviour.rpc_mut(ProtocolId { method: RpcMethod::Status, version: 0 }).is_none());
    }
}
