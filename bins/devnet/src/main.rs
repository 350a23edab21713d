//! Two-node development network launcher.
//!
//! Starts a mining node and a non-mining node peered with it, then waits
//! for both to exit or for Ctrl+C.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sentinel_devnet::{AdminClient, Devnet, DevnetArgs, ProcessLauncher, ReadinessPolicy};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "devnet", version, about = "Launch a two-node development network")]
struct Args {
    /// Node binary to run for each node
    #[arg(long, default_value = "./build/bin/erigon")]
    binary: PathBuf,

    /// Data directory of the mining node; node n appends n
    #[arg(long, default_value = "./dev")]
    datadir: PathBuf,

    /// JSON-RPC endpoint of the mining node
    #[arg(long, default_value = "http://localhost:8545")]
    rpc_url: String,

    /// Seconds between dev-chain blocks
    #[arg(long, default_value_t = 30)]
    dev_period: u64,

    /// Node log verbosity
    #[arg(long, default_value_t = 0)]
    verbosity: u8,

    /// Attempts to reach the mining node's admin API, one second apart
    #[arg(long, default_value_t = 30)]
    ready_attempts: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(args).await {
        Ok(failed) if failed == 0 => info!("devnet finished"),
        Ok(failed) => {
            error!(failed, "devnet nodes exited with errors");
            process::exit(1);
        }
        Err(e) => {
            error!("devnet failed: {:#}", e);
            process::exit(1);
        }
    }
}

/// Returns the number of nodes that did not exit cleanly.
async fn run(args: Args) -> Result<usize> {
    let launcher = ProcessLauncher::new(&args.binary);
    let node_args = DevnetArgs {
        datadir: args.datadir,
        dev_period: args.dev_period,
        verbosity: args.verbosity,
        ..DevnetArgs::default()
    };
    let admin = AdminClient::new(&args.rpc_url).context("building JSON-RPC client")?;
    let readiness = ReadinessPolicy { attempts: args.ready_attempts, interval: Duration::from_secs(1) };

    let devnet = Devnet::start(&launcher, &node_args, &admin, &readiness)
        .await
        .with_context(|| format!("starting devnet with {}", args.binary.display()))?;
    info!(enode = devnet.enode(), nodes = devnet.node_count(), "devnet running (Ctrl+C to stop)");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let wait = devnet.wait();
    tokio::pin!(wait);

    let statuses = tokio::select! {
        statuses = &mut wait => statuses,
        res = &mut shutdown => {
            res.context("listening for Ctrl+C")?;
            info!("shutdown signal received");
            // Dropping the wait future drops the children, which kills them.
            return Ok(0);
        }
    };

    let mut failed = 0;
    for (node, status) in statuses {
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => {
                warn!(node, status = %s, "node exited with failure");
                failed += 1;
            }
            Err(e) => {
                warn!(node, error = %e, "could not observe node exit");
                failed += 1;
            }
        }
    }
    Ok(failed)
}

fn init_logging(level_str: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));
    tracing_subscriber::registry().with(filter).with(fmt::layer().with_target(false)).init();
}
