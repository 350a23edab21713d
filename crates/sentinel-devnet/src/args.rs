//! Argument lists for the two devnet nodes.

use std::path::PathBuf;

pub const DATADIR_ARG: &str = "--datadir";
pub const CHAIN_ARG: &str = "--chain";
pub const DEV_CHAIN: &str = "dev";
pub const DEV_PERIOD_ARG: &str = "--dev.period";
pub const VERBOSITY_ARG: &str = "--verbosity";
pub const PRIVATE_API_ADDR_ARG: &str = "--private.api.addr";
pub const HTTP_API_ARG: &str = "--http.api";
pub const STATIC_PEERS_ARG: &str = "--staticpeers";
pub const MINE_FLAG: &str = "--mine";
pub const NO_DISCOVER_FLAG: &str = "--nodiscover";

/// Settings shared by both argument lists.
#[derive(Debug, Clone)]
pub struct DevnetArgs {
    /// Data directory of the mining node; node `n` uses this path suffixed with `n`.
    pub datadir: PathBuf,
    pub mining_private_api: String,
    pub follower_private_api: String,
    pub http_api: Vec<String>,
    /// Seconds between dev-chain blocks.
    pub dev_period: u64,
    pub verbosity: u8,
}

impl Default for DevnetArgs {
    fn default() -> Self {
        Self {
            datadir: PathBuf::from("./dev"),
            mining_private_api: "localhost:9090".into(),
            follower_private_api: "localhost:9091".into(),
            http_api: ["admin", "eth", "erigon", "web3", "net", "debug", "trace", "txpool", "parity"]
                .map(String::from)
                .to_vec(),
            dev_period: 30,
            verbosity: 0,
        }
    }
}

fn param(arg: &str, value: impl std::fmt::Display) -> String {
    format!("{arg}={value}")
}

/// Arguments for the mining node.
pub fn mining_node_args(args: &DevnetArgs) -> Vec<String> {
    vec![
        param(DATADIR_ARG, args.datadir.display()),
        param(CHAIN_ARG, DEV_CHAIN),
        param(PRIVATE_API_ADDR_ARG, &args.mining_private_api),
        MINE_FLAG.to_string(),
        param(HTTP_API_ARG, args.http_api.join(",")),
        param(DEV_PERIOD_ARG, args.dev_period),
        param(VERBOSITY_ARG, args.verbosity),
    ]
}

/// Arguments for non-mining node `node_number`, peered only with `enode`.
pub fn non_mining_node_args(args: &DevnetArgs, node_number: usize, enode: &str) -> Vec<String> {
    let mut datadir = args.datadir.clone().into_os_string();
    datadir.push(node_number.to_string());
    vec![
        param(DATADIR_ARG, PathBuf::from(datadir).display()),
        param(CHAIN_ARG, DEV_CHAIN),
        param(PRIVATE_API_ADDR_ARG, &args.follower_private_api),
        param(STATIC_PEERS_ARG, enode),
        NO_DISCOVER_FLAG.to_string(),
        param(VERBOSITY_ARG, args.verbosity),
    ]
}
