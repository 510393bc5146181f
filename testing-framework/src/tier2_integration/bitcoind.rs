//! Process-backed node: spawns a regtest node binary in a temporary datadir
//! and talks to it over JSON-RPC.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use regtest_common::{crypto::Hash, transaction::Transaction};
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::Duration;

use super::{MempoolEntry, NodeRpc, RpcError, RpcNode, ScanResult};
use crate::orchestrator::{
    poll_until, HarnessConfig, Probe, SystemClock, WaitConfig, WaitError,
};

const RPC_USER: &str = "regtest";
const RPC_PASSWORD: &str = "regtest";

/// How to launch a node binary.
#[derive(Debug, Clone)]
pub struct BitcoindConfig {
    pub binary: PathBuf,
    /// Appended after the harness's own arguments
    pub extra_args: Vec<String>,
    pub startup: WaitConfig,
}

impl BitcoindConfig {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
            startup: WaitConfig::new(Duration::from_secs(60))
                .with_poll_interval(Duration::from_millis(200)),
        }
    }

    /// Binary from the harness configuration, `None` when unset.
    pub fn from_harness(config: &HarnessConfig) -> Option<Self> {
        config.bitcoind.as_ref().map(|binary| {
            let mut launch = Self::new(binary.clone());
            launch.startup = launch.startup.scaled(config.timeout_factor);
            launch
        })
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }
}

/// A running node process.
///
/// The process is killed and its datadir removed when the value is dropped.
pub struct BitcoindProcess {
    child: Child,
    rpc: RpcNode,
    // Removed on drop, after the child is gone
    datadir: TempDir,
}

impl BitcoindProcess {
    /// Spawn the node and wait until it answers `getblockcount`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The binary cannot be started
    /// - The process exits during startup
    /// - RPC does not come up within `config.startup`
    pub async fn spawn(config: &BitcoindConfig) -> Result<Self> {
        let datadir = tempfile::Builder::new()
            .prefix("regtest-node-")
            .tempdir()
            .context("Failed to create node datadir")?;
        let p2p_port = free_port()?;
        let rpc_port = free_port()?;

        let mut command = Command::new(&config.binary);
        command
            .arg("-regtest")
            .arg(format!("-datadir={}", datadir.path().display()))
            .arg(format!("-port={}", p2p_port))
            .arg(format!("-rpcport={}", rpc_port))
            .arg(format!("-rpcuser={}", RPC_USER))
            .arg(format!("-rpcpassword={}", RPC_PASSWORD))
            .arg("-server=1")
            .arg("-listen=1")
            .arg("-bind=127.0.0.1")
            .arg("-fallbackfee=0.0002")
            .arg("-printtoconsole=0")
            .args(&config.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .with_context(|| format!("Failed to start {}", config.binary.display()))?;
        info!(
            "started {} (pid {:?}) with rpc port {} and p2p port {}",
            config.binary.display(),
            child.id(),
            rpc_port,
            p2p_port
        );

        let rpc = RpcNode::new(
            format!("http://127.0.0.1:{}", rpc_port),
            SocketAddr::from((Ipv4Addr::LOCALHOST, p2p_port)),
        )?
        .with_auth(RPC_USER, RPC_PASSWORD);

        let mut process = Self { child, rpc, datadir };
        process.wait_for_rpc(&config.startup).await?;
        Ok(process)
    }

    async fn wait_for_rpc(&mut self, wait: &WaitConfig) -> Result<()> {
        let child = &mut self.child;
        let rpc = &self.rpc;
        poll_until("node rpc ready", wait, &SystemClock, || {
            let exited = child.try_wait();
            async move {
                match exited {
                    Ok(Some(status)) => Err(anyhow::anyhow!("node exited during startup with {}", status)),
                    Err(e) => Err(anyhow::Error::new(e).context("Failed to poll node process")),
                    Ok(None) => match rpc.get_block_count().await {
                        Ok(height) => Ok(Probe::Ready(height)),
                        // Not listening or still warming up
                        Err(e) => Ok(Probe::Pending(e.to_string())),
                    },
                }
            }
        })
        .await
        .map_err(|e| match e {
            WaitError::Probe(e) => e,
            WaitError::Timeout(e) => e.into(),
        })?;
        debug!("node rpc ready at {}", self.rpc.url());
        Ok(())
    }

    pub fn rpc(&self) -> &RpcNode {
        &self.rpc
    }

    pub fn datadir(&self) -> &std::path::Path {
        self.datadir.path()
    }

    /// Kill the process and wait for it to exit.
    pub async fn stop(mut self) -> Result<()> {
        self.child.kill().await.context("Failed to kill node")?;
        Ok(())
    }
}

impl Drop for BitcoindProcess {
    fn drop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            // Already exited
            debug!("node process kill on drop: {}", e);
        }
    }
}

// Reserve a port by binding and releasing it; the node binds it moments later
fn free_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).context("Failed to reserve a port")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    if port == 0 {
        warn!("OS returned port 0");
    }
    Ok(port)
}

#[async_trait]
impl NodeRpc for BitcoindProcess {
    async fn create_wallet(&self, name: &str) -> Result<(), RpcError> {
        self.rpc.create_wallet(name).await
    }

    async fn get_new_address(&self, wallet: &str) -> Result<String, RpcError> {
        self.rpc.get_new_address(wallet).await
    }

    async fn get_balance(&self, wallet: &str) -> Result<u64, RpcError> {
        self.rpc.get_balance(wallet).await
    }

    async fn send_to_address(&self, wallet: &str, address: &str, amount: u64) -> Result<Hash, RpcError> {
        self.rpc.send_to_address(wallet, address, amount).await
    }

    async fn get_raw_mempool(&self) -> Result<Vec<Hash>, RpcError> {
        self.rpc.get_raw_mempool().await
    }

    async fn get_mempool_entry(&self, txid: &Hash) -> Result<MempoolEntry, RpcError> {
        self.rpc.get_mempool_entry(txid).await
    }

    async fn get_best_block_hash(&self) -> Result<Hash, RpcError> {
        self.rpc.get_best_block_hash().await
    }

    async fn get_block_count(&self) -> Result<u64, RpcError> {
        self.rpc.get_block_count().await
    }

    async fn generate_to_address(&self, count: u64, address: &str) -> Result<Vec<Hash>, RpcError> {
        self.rpc.generate_to_address(count, address).await
    }

    async fn generate_to_descriptor(&self, count: u64, descriptor: &str) -> Result<Vec<Hash>, RpcError> {
        self.rpc.generate_to_descriptor(count, descriptor).await
    }

    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Hash, RpcError> {
        self.rpc.send_raw_transaction(tx).await
    }

    async fn scan_tx_out_set(&self, descriptors: &[String]) -> Result<ScanResult, RpcError> {
        self.rpc.scan_tx_out_set(descriptors).await
    }

    async fn add_node(&self, endpoint: SocketAddr) -> Result<(), RpcError> {
        self.rpc.add_node(endpoint).await
    }

    async fn disconnect_node(&self, endpoint: SocketAddr) -> Result<(), RpcError> {
        self.rpc.disconnect_node(endpoint).await
    }

    async fn get_connection_count(&self) -> Result<usize, RpcError> {
        self.rpc.get_connection_count().await
    }

    fn p2p_endpoint(&self) -> SocketAddr {
        self.rpc.p2p_endpoint()
    }
}
