//! Sentinel light client driver.
//!
//! Starts a Sentinel node, logs every beacon block received over gossip,
//! reports the peer count every few seconds and periodically pings and
//! queries metadata from a random peer.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use sentinel_core::beacon::SignedBeaconBlock;
use sentinel_core::clparams::NetworkName;
use sentinel_network::{GossipObject, GossipTopic, Sentinel, SentinelConfig};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

const PEER_REPORT_INTERVAL: Duration = Duration::from_secs(5);
const REQUEST_INTERVAL: Duration = Duration::from_secs(10);

/// Consensus-layer light client over the Sentinel P2P stack.
#[derive(Parser, Debug)]
#[command(name = "lightclient", version, about = "Follow beacon blocks over consensus-layer gossip")]
struct Args {
    /// Network preset (mainnet, goerli, sepolia)
    #[arg(long, default_value = "mainnet")]
    network: NetworkName,

    /// Address advertised to peers
    #[arg(long, default_value = "127.0.0.1")]
    addr: IpAddr,

    /// Address to bind when it differs from --addr (e.g. 0.0.0.0)
    #[arg(long)]
    listen_addr: Option<IpAddr>,

    /// UDP discovery port
    #[arg(long, default_value_t = sentinel_network::config::DEFAULT_DISCOVERY_PORT)]
    port: u16,

    /// TCP listen port
    #[arg(long, default_value_t = sentinel_network::config::DEFAULT_TCP_PORT)]
    tcp_port: u16,

    /// Extra bootnodes in enr: form (comma-separated), added to the preset
    #[arg(long, value_delimiter = ',')]
    bootnodes: Vec<String>,

    /// Maximum number of peers
    #[arg(long, default_value_t = 50)]
    max_peers: usize,

    /// Data directory holding the node key
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Use a fresh key on every start instead of the persisted one
    #[arg(long)]
    ephemeral_key: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

impl Args {
    fn into_config(self) -> SentinelConfig {
        let mut config = SentinelConfig::for_network(self.network);
        config.ip_addr = self.addr;
        config.listen_addr = self.listen_addr;
        config.port = self.port;
        config.tcp_port = self.tcp_port;
        config.max_peers = self.max_peers;
        config.target_peers = config.target_peers.min(self.max_peers);
        config.discovery.bootnodes.extend(self.bootnodes);

        if !self.ephemeral_key {
            let data_dir = self.data_dir.unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("sentinel")
                    .join(self.network.as_str())
            });
            config.node_key_path = Some(data_dir.join("node.key"));
        }
        config
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level, &args.log_format);
    let config = args.into_config();

    info!("Sentinel light client v{}", env!("CARGO_PKG_VERSION"));
    info!(discovery = %config.discovery_addr(), listen = %config.listen_multiaddr(), "starting");

    if let Some(dir) = config.node_key_path.as_ref().and_then(|p| p.parent()) {
        if let Err(e) = std::fs::create_dir_all(dir) {
            error!("failed to create data dir {}: {}", dir.display(), e);
            process::exit(1);
        }
    }

    let sentinel = match Sentinel::start(config).await {
        Ok(s) => s,
        Err(e) => {
            error!("failed to start sentinel: {}", e);
            process::exit(1);
        }
    };
    info!(identity = %sentinel, "sentinel running (Ctrl+C to stop)");

    let Some(blocks) = sentinel.gossip_channel(GossipTopic::BeaconBlock) else {
        error!("beacon block topic is not registered");
        sentinel.stop().await;
        process::exit(1);
    };

    let mut peer_report = interval(PEER_REPORT_INTERVAL);
    let mut requests = interval(REQUEST_INTERVAL);
    requests.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = &mut shutdown => {
                if let Err(e) = res {
                    error!("failed to listen for Ctrl+C: {}", e);
                }
                info!("shutdown signal received");
                break;
            }
            _ = peer_report.tick() => info!(peers = sentinel.peers_count(), "peer report"),
            _ = requests.tick() => send_requests(&sentinel).await,
            object = blocks.recv() => match object {
                Some(GossipObject::BeaconBlock(block)) => log_block(&block),
                Some(_) => {}
                None => {
                    warn!("gossip channel closed");
                    break;
                }
            },
        }
    }

    sentinel.stop().await;
    info!("light client shutdown complete");
}

async fn send_requests(sentinel: &Sentinel) {
    match sentinel.send_ping_req_v1().await {
        Ok(pong) => info!(seq_number = pong.seq_number, "ping"),
        Err(e) => warn!(error = %e, "ping failed"),
    }
    match sentinel.send_metadata_req_v1().await {
        Ok(md) => info!(seq_number = md.seq_number, attnets = %hex::encode(md.attnets), "metadata"),
        Err(e) => warn!(error = %e, "metadata request failed"),
    }
}

fn log_block(signed: &SignedBeaconBlock) {
    let block = &signed.block;
    info!(
        slot = block.slot,
        signature = %hex::encode(signed.signature.as_bytes()),
        graffiti = %block.body.graffiti_str(),
        eth1_block_hash = %block.body.eth1_data.block_hash,
        state_root = %block.state_root,
        parent_root = %block.parent_root,
        proposer_index = block.proposer_index,
        "beacon block"
    );
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// `RUST_LOG` takes precedence over `level_str`. Pass `format = "json"` for
/// structured output; anything else yields human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
