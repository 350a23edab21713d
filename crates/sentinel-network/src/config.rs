//! Configuration for a Sentinel node.
//!
//! A [`SentinelConfig`] is built once, handed to [`crate::Sentinel::start`]
//! and never mutated afterwards.

use sentinel_core::clparams::{
    self, BeaconChainConfig, GenesisConfig, NetworkConfig, NetworkName,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::SentinelError;

/// Default UDP port for discovery.
pub const DEFAULT_DISCOVERY_PORT: u16 = 8080;
/// Default TCP port for the libp2p transport.
pub const DEFAULT_TCP_PORT: u16 = 9000;

/// Discovery table and maintenance settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Seed records in `enr:` form.
    pub bootnodes: Vec<String>,
    /// Entries kept per log-distance bucket.
    pub bucket_size: usize,
    /// Failed exchanges after which an entry goes stale.
    pub max_failures: u32,
    /// Period of the maintenance timer.
    pub refresh_interval: Duration,
    /// Verified entries not heard from for this long are re-pinged.
    pub revalidate_after: Duration,
    /// Deadline for a single discovery exchange.
    pub request_timeout: Duration,
    /// Upper bound on iterative lookup rounds.
    pub lookup_rounds: usize,
    /// Distinct peers that must report the same external endpoint before
    /// the local record is updated.
    pub endpoint_vote_threshold: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bootnodes: Vec::new(),
            bucket_size: 16,
            max_failures: 3,
            refresh_interval: Duration::from_secs(30),
            revalidate_after: Duration::from_secs(300),
            request_timeout: Duration::from_secs(2),
            lookup_rounds: 8,
            endpoint_vote_threshold: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SentinelConfig {
    /// Address advertised in the local record. Also bound unless
    /// `listen_addr` is set.
    pub ip_addr: IpAddr,
    /// Bind address when it differs from the advertised one, e.g. `0.0.0.0`
    /// behind NAT.
    pub listen_addr: Option<IpAddr>,
    /// UDP discovery port; 0 picks a free port.
    pub port: u16,
    /// TCP listen port; 0 picks a free port.
    pub tcp_port: u16,
    pub discovery: DiscoveryConfig,
    pub genesis: GenesisConfig,
    pub network: NetworkConfig,
    pub beacon: BeaconChainConfig,
    /// Hard cap on connecting plus connected peers.
    pub max_peers: usize,
    /// Discovery keeps looking up peers while below this count.
    pub target_peers: usize,
    /// Deadline for a request/response exchange.
    pub request_timeout: Duration,
    /// Per-topic delivery queue capacity.
    pub gossip_queue_capacity: usize,
    pub seen_cache_capacity: usize,
    pub seen_cache_ttl: Duration,
    pub gossipsub_heartbeat: Duration,
    /// Persist the node key here; an ephemeral key is used when `None`.
    pub node_key_path: Option<PathBuf>,
    pub attnets: [u8; 8],
    /// First redial delay after a failed dial or disconnect.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self::for_network(NetworkName::Mainnet)
    }
}

impl SentinelConfig {
    /// Preset for a public network.
    pub fn for_network(network: NetworkName) -> Self {
        let (discovery, genesis, net, beacon) = clparams::configs_by_network(network);
        Self {
            ip_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            listen_addr: None,
            port: DEFAULT_DISCOVERY_PORT,
            tcp_port: DEFAULT_TCP_PORT,
            discovery: DiscoveryConfig { bootnodes: discovery.bootnodes, ..DiscoveryConfig::default() },
            request_timeout: net.resp_timeout,
            genesis,
            network: net,
            beacon,
            max_peers: 50,
            target_peers: 25,
            gossip_queue_capacity: 256,
            seen_cache_capacity: 8192,
            seen_cache_ttl: Duration::from_secs(384),
            gossipsub_heartbeat: Duration::from_millis(700),
            node_key_path: None,
            attnets: [0u8; 8],
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }

    /// Loopback preset on ephemeral ports with fast timers.
    pub fn local_testing() -> Self {
        let mut config = Self::for_network(NetworkName::Mainnet);
        config.port = 0;
        config.tcp_port = 0;
        config.gossipsub_heartbeat = Duration::from_millis(100);
        config.request_timeout = Duration::from_secs(2);
        config.discovery.request_timeout = Duration::from_millis(500);
        config.discovery.refresh_interval = Duration::from_secs(60);
        config.backoff_base = Duration::from_millis(200);
        config
    }

    /// Address the sockets bind to.
    pub fn bind_addr(&self) -> IpAddr {
        self.listen_addr.unwrap_or(self.ip_addr)
    }

    pub fn listen_multiaddr(&self) -> String {
        match self.bind_addr() {
            IpAddr::V4(ip) => format!("/ip4/{ip}/tcp/{}", self.tcp_port),
            IpAddr::V6(ip) => format!("/ip6/{ip}/tcp/{}", self.tcp_port),
        }
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr(), self.port)
    }

    pub fn validate(&self) -> Result<(), SentinelError> {
        let fail = |msg: &str| Err(SentinelError::Config(msg.to_string()));
        if self.max_peers == 0 {
            return fail("max_peers must be positive");
        }
        if self.target_peers > self.max_peers {
            return fail("target_peers exceeds max_peers");
        }
        if self.gossip_queue_capacity == 0 || self.seen_cache_capacity == 0 {
            return fail("queue and cache capacities must be positive");
        }
        if self.request_timeout.is_zero() || self.discovery.request_timeout.is_zero() {
            return fail("timeouts must be positive");
        }
        if self.discovery.bucket_size == 0 {
            return fail("bucket_size must be positive");
        }
        if self.ip_addr.is_unspecified() || self.ip_addr.is_multicast() {
            return fail("ip_addr must be a concrete unicast address");
        }
        if self.bind_addr().is_multicast() {
            return fail("listen_addr must not be multicast");
        }
        if self.bind_addr().is_ipv4() != self.ip_addr.is_ipv4() {
            return fail("listen_addr and ip_addr must be the same address family");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = SentinelConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.port, DEFAULT_DISCOVERY_PORT);
        assert_eq!(cfg.tcp_port, DEFAULT_TCP_PORT);
        assert!(cfg.discovery.bootnodes.is_empty());
    }

    #[test]
    fn listen_multiaddr_format() {
        let cfg = SentinelConfig::default();
        assert_eq!(cfg.listen_multiaddr(), format!("/ip4/127.0.0.1/tcp/{DEFAULT_TCP_PORT}"));
    }

    #[test]
    fn listen_multiaddr_v6() {
        let cfg = SentinelConfig { ip_addr: "::1".parse().unwrap(), tcp_port: 9999, ..SentinelConfig::default() };
        assert_eq!(cfg.listen_multiaddr(), "/ip6/::1/tcp/9999");
    }

    #[test]
    fn wildcard_bind_with_concrete_advertised_address() {
        let cfg = SentinelConfig {
            ip_addr: "203.0.113.7".parse().unwrap(),
            listen_addr: Some("0.0.0.0".parse().unwrap()),
            tcp_port: 9000,
            port: 9001,
            ..SentinelConfig::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.listen_multiaddr(), "/ip4/0.0.0.0/tcp/9000");
        assert_eq!(cfg.discovery_addr(), "0.0.0.0:9001".parse().unwrap());

        let mixed = SentinelConfig { listen_addr: Some("::".parse().unwrap()), ..cfg };
        assert!(mixed.validate().is_err());
    }

    #[test]
    fn local_testing_uses_ephemeral_ports() {
        let cfg = SentinelConfig::local_testing();
        assert_eq!((cfg.port, cfg.tcp_port), (0, 0));
        cfg.validate().unwrap();
    }

    #[test]
    fn presets_follow_network() {
        let goerli = SentinelConfig::for_network(NetworkName::Goerli);
        assert_eq!(goerli.genesis.genesis_time, 1_616_508_000);
        assert_ne!(goerli.beacon.genesis_fork_version, SentinelConfig::default().beacon.genesis_fork_version);
    }

    #[test]
    fn invalid_configs_rejected() {
        let mut cfg = SentinelConfig::default();
        cfg.max_peers = 0;
        assert!(matches!(cfg.validate(), Err(SentinelError::Config(_))));

        let mut cfg = SentinelConfig::default();
        cfg.ip_addr = "0.0.0.0".parse().unwrap();
        assert!(cfg.validate().is_err());

        let mut cfg = SentinelConfig::default();
        cfg.target_peers = cfg.max_peers + 1;
        assert!(cfg.validate().is_err());
    }
}
