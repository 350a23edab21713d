//! # sentinel-network — consensus-layer P2P stack on libp2p.
//!
//! Signed node records and a UDP discovery service find peers; a bounded
//! connection manager decides which of them to keep; Gossipsub carries
//! fork-digest-namespaced topics into typed per-topic delivery queues; and
//! versioned request/response protocols (status, goodbye, ping, metadata)
//! run over Noise-encrypted, Yamux-multiplexed TCP.
//!
//! The entry point is [`Sentinel::start`], which binds both sockets, spawns
//! the discovery and swarm tasks and returns a handle.

pub mod behaviour;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod gossip;
pub mod identity;
pub mod peer_scoring;
pub mod peers;
pub mod protocol;
pub mod rate_limiter;
mod sentinel;
mod service;
pub mod topics;

pub use config::{DiscoveryConfig, SentinelConfig};
pub use connection::ConnectionManager;
pub use discovery::{Discovery, ForkSchedule};
pub use error::{ConnectionError, DiscoveryError, GossipError, IdentityError, RpcError, SentinelError, TopicError};
pub use gossip::{DeliveryReceiver, GossipEngine, GossipOutcome};
pub use identity::{Endpoint, Eth2Field, NodeId, NodeIdentity, NodeRecord};
pub use peer_scoring::{PeerScore, PeerScoreBoard, BAN_DURATION, BAN_THRESHOLD};
pub use peers::{ConnectionState, DiscoveryState, InsertOutcome, PeerTable};
pub use protocol::{GoodbyeReason, MetadataV1, MetadataV2, Ping, ProtocolId, RpcMethod, RpcRequest, RpcResponse, StatusMessage};
pub use sentinel::Sentinel;
pub use topics::{GossipObject, GossipTopic, TopicRegistry};
