//! # sentinel-snapshots — preverified snapshot manifests.
//!
//! Each supported network embeds a TOML manifest mapping segment file names
//! (`v1-<from>-<to>-<kind>.seg`, bounds in thousands of blocks) to content
//! hashes. [`known_config`] turns a network name into a read-only
//! [`SnapshotConfig`]; the registry holds no networking state.
//!
//! Mainnet and BSC are registered but disabled: they resolve to an empty
//! configuration, as does any name the registry does not know. Use
//! [`is_known`] to tell the two cases apart.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::debug;

const MAINNET_MANIFEST: &str = include_str!("../manifests/mainnet.toml");
const GOERLI_MANIFEST: &str = include_str!("../manifests/goerli.toml");
const BSC_MANIFEST: &str = include_str!("../manifests/bsc.toml");

pub const MAINNET: &str = "mainnet";
pub const GOERLI: &str = "goerli";
pub const BSC: &str = "bsc";

/// Blocks covered by one unit of a segment bound.
const BLOCKS_PER_UNIT: u64 = 1_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("manifest for {network}: {reason}")] Manifest { network: &'static str, reason: String },
    #[error("unsupported segment naming: {0}")] UnsupportedVersion(String),
    #[error("malformed segment name: {0}")] MalformedName(String),
}

/// Segment file name to expected content hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preverified(BTreeMap<String, String>);

impl Preverified {
    /// Parse a manifest of `[[segment]]` tables with `name` and `hash` keys.
    pub fn from_toml(network: &'static str, text: &str) -> Result<Self, SnapshotError> {
        #[derive(Deserialize)]
        struct Entry {
            name: String,
            hash: String,
        }
        #[derive(Deserialize)]
        struct Manifest {
            #[serde(default)]
            segment: Vec<Entry>,
        }

        let fail = |e: config::ConfigError| SnapshotError::Manifest { network, reason: e.to_string() };
        let manifest: Manifest = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .map_err(fail)?
            .try_deserialize()
            .map_err(fail)?;
        Ok(manifest.segment.into_iter().map(|e| (e.name, e.hash)).collect())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for Preverified {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotConfig {
    /// Last block covered by the header segments, or 0 when there are none.
    pub expect_blocks: u64,
    pub preverified: Preverified,
}

impl SnapshotConfig {
    pub fn new(preverified: Preverified) -> Result<Self, SnapshotError> {
        let expect_blocks = max_block_num(&preverified)?;
        debug!(expect_blocks, segments = preverified.len(), "snapshots: config built");
        Ok(Self { expect_blocks, preverified })
    }
}

/// Highest block covered by the `headers` segments.
///
/// Files other than `.seg` and segments of other kinds are skipped. A
/// segment that is not `v1` or whose upper bound does not parse is an error.
pub fn max_block_num(preverified: &Preverified) -> Result<u64, SnapshotError> {
    let mut max = 0u64;
    for (name, _) in preverified.iter() {
        let file = Path::new(name).file_name().and_then(|f| f.to_str()).unwrap_or(name);
        let Some(stem) = file.strip_suffix(".seg") else { continue };
        let parts: Vec<&str> = stem.split('-').collect();
        if parts[0] != "v1" {
            return Err(SnapshotError::UnsupportedVersion(file.to_string()));
        }
        let [_, _, to, kind] = parts[..] else {
            return Err(SnapshotError::MalformedName(file.to_string()));
        };
        if kind != "headers" {
            continue;
        }
        let to: u64 = to.parse().map_err(|_| SnapshotError::MalformedName(file.to_string()))?;
        max = max.max(to);
    }
    Ok(match max {
        0 => 0,
        max => max * BLOCKS_PER_UNIT - 1,
    })
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type Cached = LazyLock<Result<Arc<SnapshotConfig>, SnapshotError>>;

static GOERLI_CONFIG: Cached =
    LazyLock::new(|| Preverified::from_toml(GOERLI, GOERLI_MANIFEST).and_then(SnapshotConfig::new).map(Arc::new));
static DISABLED_CONFIG: LazyLock<Arc<SnapshotConfig>> = LazyLock::new(|| Arc::new(SnapshotConfig::default()));

/// Names the registry recognises, including disabled ones.
pub fn network_names() -> [&'static str; 3] {
    [MAINNET, GOERLI, BSC]
}

pub fn is_known(network: &str) -> bool {
    network_names().contains(&network)
}

/// Snapshot configuration for `network`.
///
/// Disabled and unknown networks yield an empty-but-valid configuration.
pub fn known_config(network: &str) -> Result<Arc<SnapshotConfig>, SnapshotError> {
    match network {
        GOERLI => GOERLI_CONFIG.clone(),
        MAINNET | BSC => Ok(DISABLED_CONFIG.clone()),
        other => {
            debug!(network = other, "snapshots: unknown network, using empty config");
            Ok(DISABLED_CONFIG.clone())
        }
    }
}

/// Embedded manifest for `network`, whether or not the network is enabled.
pub fn manifest(network: &str) -> Result<Option<Preverified>, SnapshotError> {
    let (name, text) = match network {
        MAINNET => (MAINNET, MAINNET_MANIFEST),
        GOERLI => (GOERLI, GOERLI_MANIFEST),
        BSC => (BSC, BSC_MANIFEST),
        _ => return Ok(None),
    };
    Preverified::from_toml(name, text).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn segments(names: &[&str]) -> Preverified {
        names.iter().map(|n| (n.to_string(), "00".to_string())).collect()
    }

    #[test]
    fn goerli_expects_last_header_block() {
        let cfg = known_config(GOERLI).unwrap();
        assert_eq!(cfg.expect_blocks, 6_199_999);
        assert_eq!(
            cfg.preverified.get("v1-000000-000500-headers.seg"),
            Some("e52d4e7315b1f84da7cfbe365ceacadabccd2764")
        );
    }

    #[test]
    fn disabled_networks_are_empty_but_known() {
        for name in [MAINNET, BSC] {
            let cfg = known_config(name).unwrap();
            assert_eq!(cfg.expect_blocks, 0);
            assert!(cfg.preverified.is_empty());
            assert!(is_known(name));
        }
    }

    #[test]
    fn unknown_network_is_empty_and_unknown() {
        let cfg = known_config("ropsten").unwrap();
        assert_eq!(*cfg, SnapshotConfig::default());
        assert!(!is_known("ropsten"));
    }

    #[test]
    fn every_embedded_manifest_parses() {
        for name in network_names() {
            let manifest = manifest(name).unwrap().unwrap();
            assert!(!manifest.is_empty(), "{name}");
            max_block_num(&manifest).unwrap();
        }
        assert_eq!(manifest("ropsten").unwrap(), None);
    }

    #[test]
    fn only_header_segments_count() {
        let p = segments(&[
            "v1-000000-000500-headers.seg",
            "v1-000500-001000-bodies.seg",
            "v1-000000-000900-headers.idx",
            "snapshots/v1-000500-000700-headers.seg",
        ]);
        assert_eq!(max_block_num(&p).unwrap(), 699_999);
    }

    #[test]
    fn no_headers_means_zero() {
        assert_eq!(max_block_num(&Preverified::default()).unwrap(), 0);
        assert_eq!(max_block_num(&segments(&["v1-000000-000500-bodies.seg"])).unwrap(), 0);
    }

    #[test]
    fn bad_names_are_errors() {
        assert!(matches!(
            max_block_num(&segments(&["v2-000000-000500-headers.seg"])),
            Err(SnapshotError::UnsupportedVersion(_))
        ));
        assert!(matches!(
            max_block_num(&segments(&["v1-000000-headers.seg"])),
            Err(SnapshotError::MalformedName(_))
        ));
        assert!(matches!(
            max_block_num(&segments(&["v1-000000-00x500-headers.seg"])),
            Err(SnapshotError::MalformedName(_))
        ));
    }

    #[test]
    fn malformed_manifest_reports_network() {
        let err = Preverified::from_toml(GOERLI, "[[segment]]\nname = 3").unwrap_err();
        assert!(matches!(err, SnapshotError::Manifest { network: GOERLI, .. }));
    }

    proptest! {
        #[test]
        fn max_is_highest_header_bound(bounds in proptest::collection::vec(1u64..100_000, 1..20)) {
            let names: Vec<String> =
                bounds.iter().map(|to| format!("v1-000000-{to:06}-headers.seg")).collect();
            let p: Preverified = names.into_iter().map(|n| (n, String::new())).collect();
            let max = *bounds.iter().max().unwrap();
            prop_assert_eq!(max_block_num(&p).unwrap(), max * 1_000 - 1);
        }
    }
}
