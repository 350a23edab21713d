//! Chain parameter presets for the public beacon networks.
//!
//! [`configs_by_network`] hands out the four parameter groups a node needs
//! before it can join a network: discovery seeds, genesis data, p2p limits
//! and the fork schedule.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    ATTESTATION_SUBNET_COUNT, FAR_FUTURE_EPOCH, GOSSIP_MAX_SIZE, MAX_CHUNK_SIZE,
    MAX_REQUEST_BLOCKS, RESP_TIMEOUT_SECS, TTFB_TIMEOUT_SECS,
};
use crate::error::ParamsError;
use crate::types::{Epoch, ForkDigest, Root, Version, hex_literal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkName {
    Mainnet,
    Goerli,
    Sepolia,
}

impl NetworkName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Goerli => "goerli",
            Self::Sepolia => "sepolia",
        }
    }
}

impl fmt::Display for NetworkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkName {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Self::Mainnet),
            "goerli" | "prater" => Ok(Self::Goerli),
            "sepolia" => Ok(Self::Sepolia),
            other => Err(ParamsError::UnknownNetwork(other.to_string())),
        }
    }
}

/// Seed records for discovery, in printable `enr:` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryParams {
    pub network: NetworkName,
    pub bootnodes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisConfig {
    /// Unix timestamp of slot 0.
    pub genesis_time: u64,
    pub genesis_validators_root: Root,
}

/// Wire limits and timeouts for the p2p layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub gossip_max_size: usize,
    pub max_chunk_size: usize,
    pub ttfb_timeout: Duration,
    pub resp_timeout: Duration,
    pub attestation_subnet_count: u64,
    pub max_request_blocks: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            gossip_max_size: GOSSIP_MAX_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            ttfb_timeout: Duration::from_secs(TTFB_TIMEOUT_SECS),
            resp_timeout: Duration::from_secs(RESP_TIMEOUT_SECS),
            attestation_subnet_count: ATTESTATION_SUBNET_COUNT,
            max_request_blocks: MAX_REQUEST_BLOCKS,
        }
    }
}

/// Slot timing and the fork schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconChainConfig {
    pub seconds_per_slot: u64,
    pub slots_per_epoch: u64,
    pub genesis_fork_version: Version,
    pub altair_fork_version: Version,
    pub altair_fork_epoch: Epoch,
    pub bellatrix_fork_version: Version,
    pub bellatrix_fork_epoch: Epoch,
    pub capella_fork_version: Version,
    pub capella_fork_epoch: Epoch,
    pub deneb_fork_version: Version,
    pub deneb_fork_epoch: Epoch,
}

impl BeaconChainConfig {
    /// Scheduled forks in activation order, genesis first.
    fn schedule(&self) -> [(Epoch, Version); 5] {
        [
            (0, self.genesis_fork_version),
            (self.altair_fork_epoch, self.altair_fork_version),
            (self.bellatrix_fork_epoch, self.bellatrix_fork_version),
            (self.capella_fork_epoch, self.capella_fork_version),
            (self.deneb_fork_epoch, self.deneb_fork_version),
        ]
    }

    /// Fork version active at `epoch`.
    pub fn fork_version_at(&self, epoch: Epoch) -> Version {
        self.schedule()
            .into_iter()
            .filter(|(activation, _)| *activation != FAR_FUTURE_EPOCH && *activation <= epoch)
            .last()
            .map_or(self.genesis_fork_version, |(_, v)| v)
    }

    /// The first fork activating strictly after `epoch`, if any is scheduled.
    pub fn next_fork(&self, epoch: Epoch) -> Option<(Epoch, Version)> {
        self.schedule()
            .into_iter()
            .find(|(activation, _)| *activation != FAR_FUTURE_EPOCH && *activation > epoch)
    }

    /// Epoch at unix time `now`. Times before genesis map to epoch 0.
    pub fn current_epoch(&self, genesis: &GenesisConfig, now: u64) -> Epoch {
        let elapsed = now.saturating_sub(genesis.genesis_time);
        let seconds_per_epoch = self.seconds_per_slot.saturating_mul(self.slots_per_epoch).max(1);
        elapsed / seconds_per_epoch
    }

    /// Digest of the fork active at `epoch`.
    pub fn fork_digest_at(&self, genesis: &GenesisConfig, epoch: Epoch) -> ForkDigest {
        compute_fork_digest(self.fork_version_at(epoch), genesis.genesis_validators_root)
    }
}

/// First four bytes of `SHA-256(version ++ zero padding to 32 bytes ++ genesis_validators_root)`.
pub fn compute_fork_digest(version: Version, genesis_validators_root: Root) -> ForkDigest {
    let mut fork_data = [0u8; 64];
    fork_data[..4].copy_from_slice(&version.0);
    fork_data[32..].copy_from_slice(genesis_validators_root.as_bytes());
    let hash = Sha256::digest(fork_data);
    ForkDigest([hash[0], hash[1], hash[2], hash[3]])
}

const fn version(hex: &str) -> Version {
    Version(hex_literal::<4>(hex))
}

const fn root(hex: &str) -> Root {
    Root(hex_literal::<32>(hex))
}

const MAINNET_GENESIS: GenesisConfig = GenesisConfig {
    genesis_time: 1_606_824_023,
    genesis_validators_root: root("4b363db94e286120d76eb905340fdd4e54bfe9f06bf33ff6cf5ad27f511bfe95"),
};

const GOERLI_GENESIS: GenesisConfig = GenesisConfig {
    genesis_time: 1_616_508_000,
    genesis_validators_root: root("043db0d9a83813551ee2f33450d23797757d430911a9320530ad8a0eabc43efb"),
};

const SEPOLIA_GENESIS: GenesisConfig = GenesisConfig {
    genesis_time: 1_655_733_600,
    genesis_validators_root: root("d8ea171f3c94aea21ebc42a1ed61052acf3f9209c00e4efbaaddac09ed9b8078"),
};

const MAINNET_BEACON: BeaconChainConfig = BeaconChainConfig {
    seconds_per_slot: 12,
    slots_per_epoch: 32,
    genesis_fork_version: version("00000000"),
    altair_fork_version: version("01000000"),
    altair_fork_epoch: 74_240,
    bellatrix_fork_version: version("02000000"),
    bellatrix_fork_epoch: 144_896,
    capella_fork_version: version("03000000"),
    capella_fork_epoch: 194_048,
    deneb_fork_version: version("04000000"),
    deneb_fork_epoch: 269_568,
};

const GOERLI_BEACON: BeaconChainConfig = BeaconChainConfig {
    seconds_per_slot: 12,
    slots_per_epoch: 32,
    genesis_fork_version: version("00001020"),
    altair_fork_version: version("01001020"),
    altair_fork_epoch: 36_660,
    bellatrix_fork_version: version("02001020"),
    bellatrix_fork_epoch: 112_260,
    capella_fork_version: version("03001020"),
    capella_fork_epoch: 162_304,
    deneb_fork_version: version("04001020"),
    deneb_fork_epoch: 231_680,
};

const SEPOLIA_BEACON: BeaconChainConfig = BeaconChainConfig {
    seconds_per_slot: 12,
    slots_per_epoch: 32,
    genesis_fork_version: version("90000069"),
    altair_fork_version: version("90000070"),
    altair_fork_epoch: 50,
    bellatrix_fork_version: version("90000071"),
    bellatrix_fork_epoch: 100,
    capella_fork_version: version("90000072"),
    capella_fork_epoch: 56_832,
    deneb_fork_version: version("90000073"),
    deneb_fork_epoch: 132_608,
};

/// Parameter presets for `network`.
pub fn configs_by_network(
    network: NetworkName,
) -> (DiscoveryParams, GenesisConfig, NetworkConfig, BeaconChainConfig) {
    let (genesis, beacon) = match network {
        NetworkName::Mainnet => (MAINNET_GENESIS, MAINNET_BEACON),
        NetworkName::Goerli => (GOERLI_GENESIS, GOERLI_BEACON),
        NetworkName::Sepolia => (SEPOLIA_GENESIS, SEPOLIA_BEACON),
    };
    let discovery = DiscoveryParams { network, bootnodes: Vec::new() };
    (discovery, genesis, NetworkConfig::default(), beacon)
}

/// Like [`configs_by_network`] but keyed by name.
pub fn configs_by_name(
    name: &str,
) -> Result<(DiscoveryParams, GenesisConfig, NetworkConfig, BeaconChainConfig), ParamsError> {
    Ok(configs_by_network(name.parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mainnet() -> (GenesisConfig, BeaconChainConfig) {
        let (_, genesis, _, beacon) = configs_by_network(NetworkName::Mainnet);
        (genesis, beacon)
    }

    #[test]
    fn mainnet_fork_digests() {
        let (genesis, beacon) = mainnet();
        let gvr = genesis.genesis_validators_root;
        assert_eq!(compute_fork_digest(beacon.genesis_fork_version, gvr).to_hex(), "b5303f2a");
        assert_eq!(compute_fork_digest(beacon.altair_fork_version, gvr).to_hex(), "afcaaba0");
        assert_eq!(compute_fork_digest(beacon.bellatrix_fork_version, gvr).to_hex(), "4a26c58b");
    }

    #[test]
    fn fork_version_follows_schedule() {
        let (_, beacon) = mainnet();
        assert_eq!(beacon.fork_version_at(0), beacon.genesis_fork_version);
        assert_eq!(beacon.fork_version_at(74_239), beacon.genesis_fork_version);
        assert_eq!(beacon.fork_version_at(74_240), beacon.altair_fork_version);
        assert_eq!(beacon.fork_version_at(150_000), beacon.bellatrix_fork_version);
        assert_eq!(beacon.fork_version_at(u64::MAX - 1), beacon.deneb_fork_version);
    }

    #[test]
    fn next_fork_is_strictly_after() {
        let (_, beacon) = mainnet();
        assert_eq!(beacon.next_fork(74_240), Some((144_896, beacon.bellatrix_fork_version)));
        assert_eq!(beacon.next_fork(0), Some((74_240, beacon.altair_fork_version)));
        assert_eq!(beacon.next_fork(300_000), None);
    }

    #[test]
    fn unscheduled_forks_are_skipped() {
        let (_, mut beacon) = mainnet();
        beacon.capella_fork_epoch = FAR_FUTURE_EPOCH;
        beacon.deneb_fork_epoch = FAR_FUTURE_EPOCH;
        assert_eq!(beacon.fork_version_at(u64::MAX), beacon.bellatrix_fork_version);
        assert_eq!(beacon.next_fork(150_000), None);
    }

    #[test]
    fn current_epoch_from_wall_clock() {
        let (genesis, beacon) = mainnet();
        assert_eq!(beacon.current_epoch(&genesis, 0), 0);
        assert_eq!(beacon.current_epoch(&genesis, genesis.genesis_time + 384), 1);
        assert_eq!(beacon.current_epoch(&genesis, genesis.genesis_time + 383), 0);
    }

    #[test]
    fn network_names_parse() {
        assert_eq!("Mainnet".parse::<NetworkName>().unwrap(), NetworkName::Mainnet);
        assert_eq!("prater".parse::<NetworkName>().unwrap(), NetworkName::Goerli);
        assert!(matches!(
            "ropsten".parse::<NetworkName>(),
            Err(ParamsError::UnknownNetwork(_))
        ));
        assert!(configs_by_name("nope").is_err());
    }

    #[test]
    fn networks_have_distinct_genesis_digests() {
        let digest = |n| {
            let (_, g, _, b) = configs_by_network(n);
            b.fork_digest_at(&g, 0)
        };
        assert_ne!(digest(NetworkName::Mainnet), digest(NetworkName::Goerli));
        assert_ne!(digest(NetworkName::Goerli), digest(NetworkName::Sepolia));
    }
}
