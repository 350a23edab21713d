//! Gossip topic registry.
//!
//! Topics are named `/eth2/{fork_digest}/{name}/bincode`. The registry maps
//! each full topic string to a decoder producing a [`GossipObject`]; it is
//! built once per fork digest and is read-only afterwards. Topics it does
//! not know fail closed with [`TopicError::UnknownTopic`].

use sentinel_core::beacon::{
    AttesterSlashing, LightClientFinalityUpdate, LightClientOptimisticUpdate, ProposerSlashing,
    SignedAggregateAndProof, SignedBeaconBlock, SignedVoluntaryExit,
};
use sentinel_core::codec;
use sentinel_core::constants::{MESSAGE_DOMAIN_VALID, MESSAGE_ID_LEN};
use sentinel_core::error::CodecError;
use sentinel_core::types::ForkDigest;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

use crate::error::TopicError;

/// Encoding suffix of every topic and protocol name.
pub const ENCODING_SUFFIX: &str = "bincode";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GossipTopic {
    BeaconBlock,
    BeaconAggregateAndProof,
    VoluntaryExit,
    ProposerSlashing,
    AttesterSlashing,
    LightClientFinalityUpdate,
    LightClientOptimisticUpdate,
}

impl GossipTopic {
    pub const ALL: [GossipTopic; 7] = [
        GossipTopic::BeaconBlock,
        GossipTopic::BeaconAggregateAndProof,
        GossipTopic::VoluntaryExit,
        GossipTopic::ProposerSlashing,
        GossipTopic::AttesterSlashing,
        GossipTopic::LightClientFinalityUpdate,
        GossipTopic::LightClientOptimisticUpdate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            GossipTopic::BeaconBlock => "beacon_block",
            GossipTopic::BeaconAggregateAndProof => "beacon_aggregate_and_proof",
            GossipTopic::VoluntaryExit => "voluntary_exit",
            GossipTopic::ProposerSlashing => "proposer_slashing",
            GossipTopic::AttesterSlashing => "attester_slashing",
            GossipTopic::LightClientFinalityUpdate => "light_client_finality_update",
            GossipTopic::LightClientOptimisticUpdate => "light_client_optimistic_update",
        }
    }

    fn decode_fn(&self) -> DecodeFn {
        match self {
            GossipTopic::BeaconBlock => decode_beacon_block,
            GossipTopic::BeaconAggregateAndProof => decode_aggregate_and_proof,
            GossipTopic::VoluntaryExit => decode_voluntary_exit,
            GossipTopic::ProposerSlashing => decode_proposer_slashing,
            GossipTopic::AttesterSlashing => decode_attester_slashing,
            GossipTopic::LightClientFinalityUpdate => decode_finality_update,
            GossipTopic::LightClientOptimisticUpdate => decode_optimistic_update,
        }
    }
}

impl fmt::Display for GossipTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded gossip payload, tagged by topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipObject {
    BeaconBlock(Box<SignedBeaconBlock>),
    AggregateAndProof(Box<SignedAggregateAndProof>),
    VoluntaryExit(SignedVoluntaryExit),
    ProposerSlashing(Box<ProposerSlashing>),
    AttesterSlashing(Box<AttesterSlashing>),
    LightClientFinalityUpdate(Box<LightClientFinalityUpdate>),
    LightClientOptimisticUpdate(Box<LightClientOptimisticUpdate>),
}

impl GossipObject {
    pub fn topic(&self) -> GossipTopic {
        match self {
            GossipObject::BeaconBlock(_) => GossipTopic::BeaconBlock,
            GossipObject::AggregateAndProof(_) => GossipTopic::BeaconAggregateAndProof,
            GossipObject::VoluntaryExit(_) => GossipTopic::VoluntaryExit,
            GossipObject::ProposerSlashing(_) => GossipTopic::ProposerSlashing,
            GossipObject::AttesterSlashing(_) => GossipTopic::AttesterSlashing,
            GossipObject::LightClientFinalityUpdate(_) => GossipTopic::LightClientFinalityUpdate,
            GossipObject::LightClientOptimisticUpdate(_) => GossipTopic::LightClientOptimisticUpdate,
        }
    }

    /// Wire encoding of the inner object.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        match self {
            GossipObject::BeaconBlock(v) => codec::encode(v.as_ref()),
            GossipObject::AggregateAndProof(v) => codec::encode(v.as_ref()),
            GossipObject::VoluntaryExit(v) => codec::encode(v),
            GossipObject::ProposerSlashing(v) => codec::encode(v.as_ref()),
            GossipObject::AttesterSlashing(v) => codec::encode(v.as_ref()),
            GossipObject::LightClientFinalityUpdate(v) => codec::encode(v.as_ref()),
            GossipObject::LightClientOptimisticUpdate(v) => codec::encode(v.as_ref()),
        }
    }
}

pub type DecodeFn = fn(&[u8]) -> Result<GossipObject, CodecError>;

fn decode_beacon_block(data: &[u8]) -> Result<GossipObject, CodecError> {
    codec::decode(data).map(|v| GossipObject::BeaconBlock(Box::new(v)))
}

fn decode_aggregate_and_proof(data: &[u8]) -> Result<GossipObject, CodecError> {
    codec::decode(data).map(|v| GossipObject::AggregateAndProof(Box::new(v)))
}

fn decode_voluntary_exit(data: &[u8]) -> Result<GossipObject, CodecError> {
    codec::decode(data).map(GossipObject::VoluntaryExit)
}

fn decode_proposer_slashing(data: &[u8]) -> Result<GossipObject, CodecError> {
    codec::decode(data).map(|v| GossipObject::ProposerSlashing(Box::new(v)))
}

fn decode_attester_slashing(data: &[u8]) -> Result<GossipObject, CodecError> {
    codec::decode(data).map(|v| GossipObject::AttesterSlashing(Box::new(v)))
}

fn decode_finality_update(data: &[u8]) -> Result<GossipObject, CodecError> {
    codec::decode(data).map(|v| GossipObject::LightClientFinalityUpdate(Box::new(v)))
}

fn decode_optimistic_update(data: &[u8]) -> Result<GossipObject, CodecError> {
    codec::decode(data).map(|v| GossipObject::LightClientOptimisticUpdate(Box::new(v)))
}

/// Full topic string for `topic` under `fork_digest`.
pub fn topic_string(fork_digest: ForkDigest, topic: GossipTopic) -> String {
    format!("/eth2/{}/{}/{ENCODING_SUFFIX}", fork_digest.to_hex(), topic.name())
}

/// Content identifier of a gossip message:
/// `SHA-256(domain ++ u64_le(len(topic)) ++ topic ++ data)[..20]`.
pub fn message_id(topic: &str, data: &[u8]) -> [u8; MESSAGE_ID_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(MESSAGE_DOMAIN_VALID);
    hasher.update((topic.len() as u64).to_le_bytes());
    hasher.update(topic.as_bytes());
    hasher.update(data);
    let digest = hasher.finalize();
    let mut id = [0u8; MESSAGE_ID_LEN];
    id.copy_from_slice(&digest[..MESSAGE_ID_LEN]);
    id
}

/// Topic string to decoder mapping for one fork digest.
#[derive(Debug, Clone)]
pub struct TopicRegistry {
    fork_digest: ForkDigest,
    topics: HashMap<String, GossipTopic>,
}

impl TopicRegistry {
    pub fn new(fork_digest: ForkDigest) -> Self {
        let topics = GossipTopic::ALL
            .iter()
            .map(|t| (topic_string(fork_digest, *t), *t))
            .collect();
        Self { fork_digest, topics }
    }

    pub fn fork_digest(&self) -> ForkDigest {
        self.fork_digest
    }

    pub fn topic_string(&self, topic: GossipTopic) -> String {
        topic_string(self.fork_digest, topic)
    }

    pub fn lookup(&self, topic: &str) -> Option<GossipTopic> {
        self.topics.get(topic).copied()
    }

    pub fn decoder(&self, topic: &str) -> Result<DecodeFn, TopicError> {
        self.lookup(topic)
            .map(|t| t.decode_fn())
            .ok_or_else(|| TopicError::UnknownTopic(topic.to_string()))
    }

    pub fn decode(&self, topic: &str, data: &[u8]) -> Result<GossipObject, TopicError> {
        let decode = self.decoder(topic)?;
        Ok(decode(data)?)
    }

    /// Every registered topic with its full string.
    pub fn topics(&self) -> impl Iterator<Item = (GossipTopic, &str)> {
        self.topics.iter().map(|(s, t)| (*t, s.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::beacon::VoluntaryExit;

    const DIGEST: ForkDigest = ForkDigest([0x4a, 0x26, 0xc5, 0x8b]);

    #[test]
    fn topic_string_format() {
        assert_eq!(
            topic_string(DIGEST, GossipTopic::BeaconBlock),
            "/eth2/4a26c58b/beacon_block/bincode"
        );
    }

    #[test]
    fn every_topic_registered() {
        let registry = TopicRegistry::new(DIGEST);
        assert_eq!(registry.topics().count(), GossipTopic::ALL.len());
        for topic in GossipTopic::ALL {
            assert_eq!(registry.lookup(&registry.topic_string(topic)), Some(topic));
        }
    }

    #[test]
    fn decoder_matches_topic() {
        let registry = TopicRegistry::new(DIGEST);
        let exit = SignedVoluntaryExit {
            message: VoluntaryExit { epoch: 3, validator_index: 7 },
            ..Default::default()
        };
        let data = codec::encode(&exit).unwrap();
        let topic = registry.topic_string(GossipTopic::VoluntaryExit);
        let object = registry.decode(&topic, &data).unwrap();
        assert_eq!(object, GossipObject::VoluntaryExit(exit));
        assert_eq!(object.topic(), GossipTopic::VoluntaryExit);
        assert_eq!(object.encode().unwrap(), data);
    }

    #[test]
    fn unknown_topics_fail_closed() {
        let registry = TopicRegistry::new(DIGEST);
        let other_fork = topic_string(ForkDigest([0; 4]), GossipTopic::BeaconBlock);
        for topic in ["/eth2/4a26c58b/blob_sidecar/bincode", other_fork.as_str(), ""] {
            assert!(matches!(registry.decoder(topic), Err(TopicError::UnknownTopic(_))));
        }
    }

    #[test]
    fn malformed_payload_is_decode_error() {
        let registry = TopicRegistry::new(DIGEST);
        let topic = registry.topic_string(GossipTopic::BeaconBlock);
        assert!(matches!(registry.decode(&topic, &[0xff; 7]), Err(TopicError::Decode(_))));
    }

    #[test]
    fn message_id_depends_on_topic_and_data() {
        let a = message_id("/eth2/00000000/beacon_block/bincode", b"payload");
        assert_eq!(a.len(), 20);
        assert_eq!(a, message_id("/eth2/00000000/beacon_block/bincode", b"payload"));
        assert_ne!(a, message_id("/eth2/00000000/voluntary_exit/bincode", b"payload"));
        assert_ne!(a, message_id("/eth2/00000000/beacon_block/bincode", b"payload2"));
    }

    #[test]
    fn message_id_binds_topic_length() {
        // Moving a byte between topic and data must change the id.
        assert_ne!(message_id("ab", b"c"), message_id("a", b"bc"));
    }
}
