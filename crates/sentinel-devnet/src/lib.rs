//! # sentinel-devnet — two-node development network.
//!
//! Starts a mining node, waits for its JSON-RPC endpoint to report an
//! enode, then starts a non-mining node that uses that enode as its only
//! static peer. The library never exits the process: failures come back as
//! [`DevnetError`] and node exits as per-node statuses from [`Devnet::wait`].

pub mod args;
pub mod rpc;

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

pub use args::{mining_node_args, non_mining_node_args, DevnetArgs};
pub use rpc::{unique_id_from_enode, AdminClient};

#[derive(Error, Debug)]
pub enum DevnetError {
    #[error("failed to spawn node {node}: {source}")] Spawn { node: usize, source: std::io::Error },
    #[error("JSON-RPC request failed: {0}")] Rpc(String),
    #[error("invalid enode: {0}")] InvalidEnode(String),
    #[error("node {node} did not answer admin_nodeInfo after {attempts} attempts")] NotReady { node: usize, attempts: u32 },
}

/// Hands out node numbers for one orchestration call. The mining node is 1.
#[derive(Debug, Default)]
pub struct NodeCounter {
    started: usize,
}

impl NodeCounter {
    pub fn next(&mut self) -> usize {
        self.started += 1;
        self.started
    }

    pub fn started(&self) -> usize {
        self.started
    }
}

/// Starts a node process from an argument list.
pub trait Launcher: Send + Sync {
    fn launch(&self, node: usize, args: &[String]) -> Result<Child, DevnetError>;
}

/// Runs the node binary directly, one process per node.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    pub program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, node: usize, args: &[String]) -> Result<Child, DevnetError> {
        info!(node, program = %self.program.display(), ?args, "devnet: starting node");
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DevnetError::Spawn { node, source })
    }
}

/// Readiness polling for the mining node's admin endpoint.
#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self { attempts: 30, interval: Duration::from_secs(1) }
    }
}

#[derive(Debug)]
struct RunningNode {
    number: usize,
    child: Child,
}

/// A running devnet.
#[derive(Debug)]
pub struct Devnet {
    nodes: Vec<RunningNode>,
    enode: String,
}

impl Devnet {
    /// Start the mining node, fetch its enode, then start the second node.
    ///
    /// If the second step fails the mining node is killed before returning.
    pub async fn start(
        launcher: &dyn Launcher,
        args: &DevnetArgs,
        admin: &AdminClient,
        readiness: &ReadinessPolicy,
    ) -> Result<Self, DevnetError> {
        let mut counter = NodeCounter::default();

        let miner_number = counter.next();
        let mut miner = launcher.launch(miner_number, &mining_node_args(args))?;

        let enode = match wait_for_enode(admin, miner_number, readiness).await {
            Ok(enode) => enode,
            Err(e) => {
                let _ = miner.kill().await;
                return Err(e);
            }
        };
        info!(%enode, "devnet: mining node ready");

        let follower_number = counter.next();
        let follower = match launcher.launch(follower_number, &non_mining_node_args(args, follower_number, &enode)) {
            Ok(child) => child,
            Err(e) => {
                let _ = miner.kill().await;
                return Err(e);
            }
        };

        Ok(Self {
            nodes: vec![
                RunningNode { number: miner_number, child: miner },
                RunningNode { number: follower_number, child: follower },
            ],
            enode,
        })
    }

    /// Enode of the mining node, without its query part.
    pub fn enode(&self) -> &str {
        &self.enode
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Wait for every node to exit, returning `(node number, exit status)`.
    pub async fn wait(self) -> Vec<(usize, std::io::Result<ExitStatus>)> {
        let mut statuses = Vec::with_capacity(self.nodes.len());
        for mut node in self.nodes {
            let status = node.child.wait().await;
            match &status {
                Ok(s) if s.success() => info!(node = node.number, "devnet: node exited"),
                Ok(s) => warn!(node = node.number, status = %s, "devnet: node failed"),
                Err(e) => warn!(node = node.number, error = %e, "devnet: could not wait for node"),
            }
            statuses.push((node.number, status));
        }
        statuses
    }

    /// Kill every node and reap it.
    pub async fn shutdown(self) -> Vec<(usize, std::io::Result<ExitStatus>)> {
        let mut statuses = Vec::with_capacity(self.nodes.len());
        for mut node in self.nodes {
            let _ = node.child.start_kill();
            statuses.push((node.number, node.child.wait().await));
        }
        statuses
    }
}

async fn wait_for_enode(admin: &AdminClient, node: usize, readiness: &ReadinessPolicy) -> Result<String, DevnetError> {
    for attempt in 1..=readiness.attempts {
        match admin.node_info().await {
            Ok(info) => return unique_id_from_enode(&info.enode),
            Err(e) => {
                debug!(node, attempt, error = %e, "devnet: admin endpoint not ready");
                tokio::time::sleep(readiness.interval).await;
            }
        }
    }
    Err(DevnetError::NotReady { node, attempts: readiness.attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Records argument lists and runs a short-lived shell command instead
    /// of a node binary.
    struct ShellLauncher {
        script: &'static str,
        launched: Mutex<Vec<(usize, Vec<String>)>>,
    }

    impl ShellLauncher {
        fn new(script: &'static str) -> Self {
            Self { script, launched: Mutex::new(Vec::new()) }
        }
    }

    impl Launcher for ShellLauncher {
        fn launch(&self, node: usize, args: &[String]) -> Result<Child, DevnetError> {
            self.launched.lock().unwrap().push((node, args.to_vec()));
            Command::new("sh")
                .arg("-c")
                .arg(self.script)
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| DevnetError::Spawn { node, source })
        }
    }

    /// Answers every HTTP request with one canned admin_nodeInfo result.
    async fn admin_stub(enode: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let body = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": { "enode": enode, "name": "stub" }
                })
                .to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn counter_is_per_call() {
        let mut a = NodeCounter::default();
        let mut b = NodeCounter::default();
        assert_eq!((a.next(), a.next()), (1, 2));
        assert_eq!(b.next(), 1);
        assert_eq!(a.started(), 2);
    }

    #[tokio::test]
    async fn start_hands_enode_to_second_node() {
        let url = admin_stub("enode://abcd@127.0.0.1:30303?discport=0").await;
        let launcher = ShellLauncher::new("exit 0");
        let readiness = ReadinessPolicy { attempts: 5, interval: Duration::from_millis(50) };
        let devnet = Devnet::start(&launcher, &DevnetArgs::default(), &AdminClient::new(&url).unwrap(), &readiness)
            .await
            .unwrap();
        assert_eq!(devnet.enode(), "enode://abcd@127.0.0.1:30303");
        assert_eq!(devnet.node_count(), 2);

        let launched = launcher.launched.lock().unwrap().clone();
        assert_eq!(launched[0].0, 1);
        assert!(launched[0].1.contains(&"--mine".to_string()));
        assert_eq!(launched[1].0, 2);
        assert!(launched[1].1.contains(&"--staticpeers=enode://abcd@127.0.0.1:30303".to_string()));

        let statuses = devnet.wait().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|(_, s)| s.as_ref().unwrap().success()));
    }

    #[tokio::test]
    async fn exit_codes_are_reported_not_fatal() {
        let url = admin_stub("enode://ffff@10.0.0.1:30303").await;
        let launcher = ShellLauncher::new("exit 3");
        let readiness = ReadinessPolicy { attempts: 5, interval: Duration::from_millis(50) };
        let devnet = Devnet::start(&launcher, &DevnetArgs::default(), &AdminClient::new(&url).unwrap(), &readiness)
            .await
            .unwrap();
        for (_, status) in devnet.wait().await {
            assert_eq!(status.unwrap().code(), Some(3));
        }
    }

    #[tokio::test]
    async fn unreachable_admin_endpoint_stops_miner() {
        // Bind then drop so the port is closed.
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let launcher = ShellLauncher::new("sleep 30");
        let readiness = ReadinessPolicy { attempts: 2, interval: Duration::from_millis(20) };
        let err = Devnet::start(
            &launcher,
            &DevnetArgs::default(),
            &AdminClient::new(&format!("http://{addr}")).unwrap(),
            &readiness,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DevnetError::NotReady { node: 1, attempts: 2 }));
        assert_eq!(launcher.launched.lock().unwrap().len(), 1);
    }
}
