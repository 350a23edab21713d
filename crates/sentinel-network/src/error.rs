//! Error types for sentinel-network.
//!
//! Each component reports through its own enum. Background failures (peer
//! churn, hostile input) are absorbed and logged; these types only surface
//! from explicit calls.

use sentinel_core::error::CodecError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid endpoint: {0}")] InvalidEndpoint(String),
    #[error("record too large: {size} > {max}")] RecordTooLarge { size: usize, max: usize },
    #[error("malformed record: {0}")] Malformed(String),
    #[error("record signature does not verify")] BadSignature,
    #[error("record signing failed: {0}")] Signing(String),
    #[error("node key file: {0}")] KeyFile(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
    #[error("unknown topic: {0}")] UnknownTopic(String),
    #[error("payload too large: {size} > {max}")] TooLarge { size: usize, max: usize },
    #[error("decode: {0}")] Decode(#[from] CodecError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("request timed out")] Timeout,
    #[error("stream rejected: {0}")] StreamRejected(String),
    #[error("undecodable response: {0}")] Decode(String),
    #[error("encode: {0}")] Encode(String),
    #[error("peer unreachable: {0}")] PeerUnreachable(String),
    #[error("remote error {code}: {message}")] Remote { code: u8, message: String },
    #[error("unsupported protocol version: {method}/{version}")] UnsupportedVersion { method: String, version: u8 },
    #[error("request cancelled")] Cancelled,
    #[error("no connected peers")] NoPeers,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("peer already connected or connecting")] AlreadyConnected,
    #[error("peer limit reached ({max})")] PeerLimitReached { max: usize },
    #[error("peer is banned")] Banned,
    #[error("peer is backing off for {remaining:?}")] BackingOff { remaining: Duration },
    #[error("dial failed: {0}")] DialFailed(String),
    #[error("sentinel stopped")] Stopped,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GossipError {
    #[error("no peers subscribed to topic")] InsufficientPeers,
    #[error("message already published")] Duplicate,
    #[error("unknown topic: {0}")] UnknownTopic(String),
    #[error("message too large: {size} > {max}")] MessageTooLarge { size: usize, max: usize },
    #[error("encode: {0}")] Encode(String),
    #[error("publish failed: {0}")] Publish(String),
    #[error("sentinel stopped")] Stopped,
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("discovery socket: {0}")] Io(#[from] std::io::Error),
    #[error("request timed out")] Timeout,
    #[error("unexpected reply from {0}")] UnexpectedReply(std::net::SocketAddr),
    #[error("packet encode: {0}")] Encode(#[from] CodecError),
    #[error("invalid record: {0}")] InvalidRecord(#[from] IdentityError),
    #[error("discovery stopped")] Stopped,
}

#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("invalid configuration: {0}")] Config(String),
    #[error("identity: {0}")] Identity(#[from] IdentityError),
    #[error("discovery: {0}")] Discovery(#[from] DiscoveryError),
    #[error("transport: {0}")] Transport(String),
    #[error("listen on {addr}: {reason}")] Listen { addr: String, reason: String },
}
