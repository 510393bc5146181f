use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use regtest_common::{crypto::Hash, transaction::Transaction};

use super::{MempoolEntry, NodeRpc, RpcError, ScanResult};
use crate::p2p::{PeerConfig, PeerConnection, PeerError};

/// One node of a test network: its RPC binding plus the peer connections the
/// harness opened to it.
///
/// Implements [`NodeRpc`] by forwarding to its binding, so a handle can be
/// passed wherever a `&dyn NodeRpc` is expected.
pub struct NodeHandle {
    index: usize,
    rpc: Arc<dyn NodeRpc>,
    peers: Mutex<Vec<Arc<PeerConnection>>>,
    peer_config: PeerConfig,
}

impl NodeHandle {
    pub fn new(index: usize, rpc: Arc<dyn NodeRpc>) -> Self {
        Self {
            index,
            rpc,
            peers: Mutex::new(Vec::new()),
            peer_config: PeerConfig::default(),
        }
    }

    /// Defaults for connections opened with [`NodeHandle::add_p2p_connection`].
    pub fn with_peer_config(mut self, config: PeerConfig) -> Self {
        self.peer_config = config;
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn rpc(&self) -> &Arc<dyn NodeRpc> {
        &self.rpc
    }

    /// Connect a scripted peer with the default configuration and wait for
    /// the handshake and a first ping round-trip.
    pub async fn add_p2p_connection(&self) -> Result<Arc<PeerConnection>, PeerError> {
        self.add_p2p_connection_with(self.peer_config.clone()).await
    }

    pub async fn add_p2p_connection_with(
        &self,
        config: PeerConfig,
    ) -> Result<Arc<PeerConnection>, PeerError> {
        let wait_handshake = config.send_version;
        let peer = PeerConnection::connect(self.rpc.p2p_endpoint(), config).await?;
        if wait_handshake {
            peer.wait_for_verack().await?;
            peer.sync_with_ping().await?;
        }

        let peer = Arc::new(peer);
        self.peers.lock().push(peer.clone());
        debug!("node{}: peer connection #{} ready", self.index, self.peers.lock().len());
        Ok(peer)
    }

    pub fn p2p(&self, index: usize) -> Option<Arc<PeerConnection>> {
        self.peers.lock().get(index).cloned()
    }

    pub fn p2ps(&self) -> Vec<Arc<PeerConnection>> {
        self.peers.lock().clone()
    }

    /// Close every peer connection opened to this node.
    pub fn disconnect_p2ps(&self) {
        let peers = std::mem::take(&mut *self.peers.lock());
        for peer in peers {
            peer.close();
        }
    }
}

#[async_trait]
impl NodeRpc for NodeHandle {
    async fn create_wallet(&self, name: &str) -> Result<(), RpcError> {
        self.rpc.create_wallet(name).await
    }

    async fn get_new_address(&self, wallet: &str) -> Result<String, RpcError> {
        self.rpc.get_new_address(wallet).await
    }

    async fn get_balance(&self, wallet: &str) -> Result<u64, RpcError> {
        self.rpc.get_balance(wallet).await
    }

    async fn send_to_address(
        &self,
        wallet: &str,
        address: &str,
        amount: u64,
    ) -> Result<Hash, RpcError> {
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

    async fn generate_to_address(
        &self,
        count: u64,
        address: &str,
    ) -> Result<Vec<Hash>, RpcError> {
        self.rpc.generate_to_address(count, address).await
    }

    async fn generate_to_descriptor(
        &self,
        count: u64,
        descriptor: &str,
    ) -> Result<Vec<Hash>, RpcError> {
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

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.disconnect_p2ps();
    }
}

impl Display for NodeHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "node{} ({})", self.index, self.rpc.p2p_endpoint())
    }
}
