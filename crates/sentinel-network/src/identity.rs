//! Node identity and the signed node record exchanged during discovery.
//!
//! A [`NodeRecord`] carries the endpoint, public key and fork metadata of a
//! node, signed by the node's libp2p keypair. Its printable form is
//! `enr:` followed by the base58 encoding of the record bytes.
//!
//! [`NodeIdentity`] owns the keypair and the current record. Every change
//! bumps the sequence number and re-signs; a mutation that changes nothing
//! leaves the record untouched.

use libp2p::identity::{Keypair, PublicKey};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use sentinel_core::codec;
use sentinel_core::types::{Epoch, ForkDigest, Version};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::error::IdentityError;

/// Upper bound on an encoded record.
pub const MAX_RECORD_SIZE: usize = 300;

/// Prefix of the printable record form.
pub const RECORD_PREFIX: &str = "enr:";

/// Mixed into the signed payload so record signatures cannot be replayed
/// as signatures over other messages.
const RECORD_SIGNATURE_DOMAIN: &[u8] = b"sentinel-node-record-v1";

/// Fork metadata advertised in a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, bincode::Encode, bincode::Decode)]
pub struct Eth2Field {
    pub fork_digest: ForkDigest,
    pub next_fork_version: Version,
    pub next_fork_epoch: Epoch,
}

/// IP address plus discovery (UDP) and transport (TCP) ports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl Endpoint {
    pub fn validate(&self) -> Result<(), IdentityError> {
        let ip = self.ip;
        if ip.is_unspecified() {
            return Err(IdentityError::InvalidEndpoint(format!("{ip} is unspecified")));
        }
        if ip.is_multicast() {
            return Err(IdentityError::InvalidEndpoint(format!("{ip} is multicast")));
        }
        if matches!(ip, IpAddr::V4(v4) if v4.is_broadcast()) {
            return Err(IdentityError::InvalidEndpoint(format!("{ip} is broadcast")));
        }
        if self.udp_port == 0 || self.tcp_port == 0 {
            return Err(IdentityError::InvalidEndpoint(format!(
                "zero port (udp {}, tcp {})",
                self.udp_port, self.tcp_port
            )));
        }
        Ok(())
    }
}

/// Signed node record.
///
/// The signature covers every other field. Fields are public so the record
/// can be inspected freely; any edit invalidates the signature.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct NodeRecord {
    pub seq: u64,
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
    /// Protobuf-encoded libp2p public key.
    pub public_key: Vec<u8>,
    pub eth2: Eth2Field,
    /// Attestation subnet bitfield.
    pub attnets: [u8; 8],
    /// Sync committee subnet bitfield (low four bits).
    pub syncnets: u8,
    pub signature: Vec<u8>,
}

impl NodeRecord {
    fn signing_payload(&self) -> Result<Vec<u8>, IdentityError> {
        let content = (
            self.seq,
            self.ip,
            self.udp_port,
            self.tcp_port,
            &self.public_key,
            &self.eth2,
            self.attnets,
            self.syncnets,
        );
        let body = codec::encode(&content).map_err(|e| IdentityError::Malformed(e.to_string()))?;
        let mut payload = Vec::with_capacity(RECORD_SIGNATURE_DOMAIN.len() + body.len());
        payload.extend_from_slice(RECORD_SIGNATURE_DOMAIN);
        payload.extend_from_slice(&body);
        Ok(payload)
    }

    fn sign(&mut self, keypair: &Keypair) -> Result<(), IdentityError> {
        let payload = self.signing_payload()?;
        self.signature = keypair
            .sign(&payload)
            .map_err(|e| IdentityError::Signing(e.to_string()))?;
        Ok(())
    }

    pub fn public_key(&self) -> Result<PublicKey, IdentityError> {
        PublicKey::try_decode_protobuf(&self.public_key)
            .map_err(|e| IdentityError::Malformed(format!("public key: {e}")))
    }

    pub fn peer_id(&self) -> Result<PeerId, IdentityError> {
        Ok(self.public_key()?.to_peer_id())
    }

    pub fn node_id(&self) -> Result<NodeId, IdentityError> {
        Ok(NodeId::from_peer_id(&self.peer_id()?))
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint { ip: self.ip, udp_port: self.udp_port, tcp_port: self.tcp_port }
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    /// `/ip4|ip6/<ip>/tcp/<port>/p2p/<peer id>`.
    pub fn tcp_multiaddr(&self) -> Result<Multiaddr, IdentityError> {
        let peer_id = self.peer_id()?;
        Ok(Multiaddr::empty()
            .with(Protocol::from(self.ip))
            .with(Protocol::Tcp(self.tcp_port))
            .with(Protocol::P2p(peer_id)))
    }

    /// Check the signature and the advertised endpoint.
    pub fn verify(&self) -> Result<(), IdentityError> {
        self.endpoint().validate()?;
        let key = self.public_key()?;
        let payload = self.signing_payload()?;
        if key.verify(&payload, &self.signature) {
            Ok(())
        } else {
            Err(IdentityError::BadSignature)
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, IdentityError> {
        codec::encode(self).map_err(|e| IdentityError::Malformed(e.to_string()))
    }

    /// Decode and verify a record received from the network.
    pub fn decode(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() > MAX_RECORD_SIZE {
            return Err(IdentityError::RecordTooLarge { size: bytes.len(), max: MAX_RECORD_SIZE });
        }
        let record: NodeRecord = codec::decode_bounded(bytes, MAX_RECORD_SIZE)
            .map_err(|e| IdentityError::Malformed(e.to_string()))?;
        record.verify()?;
        Ok(record)
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_bytes() {
            Ok(bytes) => write!(f, "{RECORD_PREFIX}{}", bs58::encode(bytes).into_string()),
            Err(_) => write!(f, "{RECORD_PREFIX}<unencodable>"),
        }
    }
}

impl FromStr for NodeRecord {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .trim()
            .strip_prefix(RECORD_PREFIX)
            .ok_or_else(|| IdentityError::Malformed(format!("missing '{RECORD_PREFIX}' prefix")))?;
        // base58 expands by roughly 1.37x.
        if body.len() > MAX_RECORD_SIZE * 2 {
            return Err(IdentityError::RecordTooLarge { size: body.len(), max: MAX_RECORD_SIZE * 2 });
        }
        let bytes = bs58::decode(body)
            .into_vec()
            .map_err(|e| IdentityError::Malformed(format!("base58: {e}")))?;
        Self::decode(&bytes)
    }
}

/// 256-bit node identifier: SHA-256 of the peer id bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, bincode::Encode, bincode::Decode)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    pub fn from_peer_id(peer: &PeerId) -> Self {
        Self(Sha256::digest(peer.to_bytes()).into())
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    /// XOR distance; compares big-endian.
    pub fn distance(&self, other: &NodeId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Index of the highest differing bit plus one, in `1..=256`.
    /// `None` for identical ids.
    pub fn log_distance(&self, other: &NodeId) -> Option<u32> {
        let distance = self.distance(other);
        distance
            .iter()
            .position(|b| *b != 0)
            .map(|i| 256 - (i as u32 * 8 + distance[i].leading_zeros()))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// The local node's keypair and its current signed record.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    keypair: Keypair,
    record: NodeRecord,
    peer_id: PeerId,
    node_id: NodeId,
}

/// Local identity shared by discovery, the swarm task and the facade.
pub type LocalNode = Arc<RwLock<NodeIdentity>>;

impl NodeIdentity {
    pub fn new(
        keypair: Keypair,
        endpoint: Endpoint,
        eth2: Eth2Field,
        attnets: [u8; 8],
    ) -> Result<Self, IdentityError> {
        endpoint.validate()?;
        let public = keypair.public();
        let peer_id = public.to_peer_id();
        let mut record = NodeRecord {
            seq: 1,
            ip: endpoint.ip,
            udp_port: endpoint.udp_port,
            tcp_port: endpoint.tcp_port,
            public_key: public.encode_protobuf(),
            eth2,
            attnets,
            syncnets: 0,
            signature: Vec::new(),
        };
        record.sign(&keypair)?;
        Ok(Self { keypair, record, peer_id, node_id: NodeId::from_peer_id(&peer_id) })
    }

    pub fn record(&self) -> &NodeRecord {
        &self.record
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn seq(&self) -> u64 {
        self.record.seq
    }

    pub fn update_endpoint(&mut self, endpoint: Endpoint) -> Result<bool, IdentityError> {
        endpoint.validate()?;
        self.mutate(|r| {
            r.ip = endpoint.ip;
            r.udp_port = endpoint.udp_port;
            r.tcp_port = endpoint.tcp_port;
        })
    }

    pub fn update_eth2(&mut self, eth2: Eth2Field) -> Result<bool, IdentityError> {
        self.mutate(|r| r.eth2 = eth2)
    }

    pub fn set_attnets(&mut self, attnets: [u8; 8]) -> Result<bool, IdentityError> {
        self.mutate(|r| r.attnets = attnets)
    }

    pub fn set_syncnets(&mut self, syncnets: u8) -> Result<bool, IdentityError> {
        self.mutate(|r| r.syncnets = syncnets & 0x0f)
    }

    /// Apply `edit` to a copy of the record; commit with a new sequence
    /// number and signature only if something changed.
    fn mutate(&mut self, edit: impl FnOnce(&mut NodeRecord)) -> Result<bool, IdentityError> {
        let mut next = self.record.clone();
        edit(&mut next);
        if next == self.record {
            return Ok(false);
        }
        next.seq = self.record.seq.saturating_add(1);
        next.sign(&self.keypair)?;
        self.record = next;
        Ok(true)
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.record.fmt(f)
    }
}

/// Load an Ed25519 keypair from `path`, or generate one and save it there.
///
/// The file holds the raw 32-byte secret seed so the peer id is stable
/// across restarts. New files are created with mode `0o600` on Unix.
pub fn load_or_generate_keypair(path: &Path) -> Result<Keypair, IdentityError> {
    use std::io::{Read, Write};

    let err = |what: &str, e: &dyn fmt::Display| {
        IdentityError::KeyFile(format!("{what} '{}': {e}", path.display()))
    };

    if path.exists() {
        let mut file = std::fs::File::open(path).map_err(|e| err("failed to open", &e))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).map_err(|e| err("failed to read", &e))?;
        let keypair = Keypair::ed25519_from_bytes(bytes).map_err(|e| err("invalid key in", &e))?;
        info!(path = %path.display(), "loaded existing node identity key");
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| err("failed to create directory for", &e))?;
    }
    let secret = keypair
        .clone()
        .try_into_ed25519()
        .map_err(|e| err("keypair is not ed25519 for", &e))?
        .secret();
    let mut file = std::fs::File::create(path).map_err(|e| err("failed to create", &e))?;
    file.write_all(secret.as_ref()).map_err(|e| err("failed to write", &e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| err("failed to set permissions on", &e))?;
    }

    info!(path = %path.display(), "generated new node identity key");
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    fn endpoint() -> Endpoint {
        Endpoint { ip: IpAddr::V4(Ipv4Addr::LOCALHOST), udp_port: 9000, tcp_port: 9001 }
    }

    fn identity() -> NodeIdentity {
        let eth2 = Eth2Field { fork_digest: ForkDigest([0x4a, 0x26, 0xc5, 0x8b]), ..Default::default() };
        NodeIdentity::new(Keypair::generate_ed25519(), endpoint(), eth2, [0u8; 8]).unwrap()
    }

    #[test]
    fn fresh_record_verifies() {
        let id = identity();
        assert_eq!(id.seq(), 1);
        id.record().verify().unwrap();
        assert_eq!(id.record().peer_id().unwrap(), id.peer_id());
    }

    #[test]
    fn printable_form_parses_back() {
        let id = identity();
        let text = id.to_string();
        assert!(text.starts_with("enr:"));
        let parsed: NodeRecord = text.parse().unwrap();
        assert_eq!(&parsed, id.record());
    }

    #[test]
    fn encoded_record_fits_limit() {
        let id = identity();
        assert!(id.record().to_bytes().unwrap().len() <= MAX_RECORD_SIZE);
    }

    #[test]
    fn unroutable_endpoints_rejected() {
        let key = Keypair::generate_ed25519();
        for ip in [
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V4(Ipv4Addr::BROADCAST),
            IpAddr::V4(Ipv4Addr::new(224, 0, 0, 1)),
        ] {
            let ep = Endpoint { ip, ..endpoint() };
            let res = NodeIdentity::new(key.clone(), ep, Eth2Field::default(), [0; 8]);
            assert!(matches!(res, Err(IdentityError::InvalidEndpoint(_))), "{ip} accepted");
        }
        let zero_port = Endpoint { tcp_port: 0, ..endpoint() };
        assert!(NodeIdentity::new(key, zero_port, Eth2Field::default(), [0; 8]).is_err());
    }

    #[test]
    fn mutation_bumps_seq_and_resigns() {
        let mut id = identity();
        let before = id.record().clone();
        assert!(id.set_attnets([0xff; 8]).unwrap());
        assert_eq!(id.seq(), 2);
        assert_ne!(id.record().signature, before.signature);
        id.record().verify().unwrap();
    }

    #[test]
    fn no_op_mutation_keeps_seq() {
        let mut id = identity();
        assert!(!id.set_attnets([0u8; 8]).unwrap());
        assert!(!id.update_endpoint(endpoint()).unwrap());
        assert_eq!(id.seq(), 1);
    }

    #[test]
    fn invalid_endpoint_update_leaves_record() {
        let mut id = identity();
        let bad = Endpoint { udp_port: 0, ..endpoint() };
        assert!(id.update_endpoint(bad).is_err());
        assert_eq!(id.seq(), 1);
    }

    #[test]
    fn tampered_field_fails_verification() {
        let mut record = identity().record().clone();
        record.tcp_port += 1;
        assert_eq!(record.verify(), Err(IdentityError::BadSignature));
    }

    #[test]
    fn garbage_strings_rejected() {
        assert!("enr:".parse::<NodeRecord>().is_err());
        assert!("enr:0OIl".parse::<NodeRecord>().is_err());
        assert!("node:abc".parse::<NodeRecord>().is_err());
        let long = format!("enr:{}", "1".repeat(MAX_RECORD_SIZE * 3));
        assert!(matches!(long.parse::<NodeRecord>(), Err(IdentityError::RecordTooLarge { .. })));
    }

    #[test]
    fn log_distance_bounds() {
        let a = NodeId([0u8; 32]);
        let mut b = a;
        assert_eq!(a.log_distance(&b), None);
        b.0[31] = 1;
        assert_eq!(a.log_distance(&b), Some(1));
        b.0[0] = 0x80;
        assert_eq!(a.log_distance(&b), Some(256));
    }

    #[test]
    fn keypair_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("node.key");
        let first = load_or_generate_keypair(&path).unwrap();
        let second = load_or_generate_keypair(&path).unwrap();
        assert_eq!(first.public().to_peer_id(), second.public().to_peer_id());
        assert_eq!(std::fs::read(&path).unwrap().len(), 32);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn corrupt_key_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");
        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(load_or_generate_keypair(&path), Err(IdentityError::KeyFile(_))));
    }

    proptest! {
        #[test]
        fn any_byte_flip_is_rejected(index in 0usize..256, mask in 1u8..=255) {
            let bytes = identity().record().to_bytes().unwrap();
            let mut tampered = bytes.clone();
            let i = index % tampered.len();
            tampered[i] ^= mask;
            prop_assert!(NodeRecord::decode(&tampered).is_err());
        }
    }
}
