// Tier 2: node handles.
//
// Everything the harness asks of a node goes through the `NodeRpc` trait.
// Three bindings exist: `RpcNode` talks JSON-RPC to a running node,
// `BitcoindProcess` spawns one and `TestDaemon` simulates one in-process on
// top of the tier-1 chain model.

pub mod bitcoind;
pub mod builder;
pub mod error;
pub mod node_handle;
pub mod rpc_client;
pub mod rpc_helpers;
pub mod test_daemon;
/// Waiter primitives over node state
pub mod waiters;

pub use bitcoind::{BitcoindConfig, BitcoindProcess};
pub use builder::TestDaemonBuilder;
pub use error::{codes, RpcError};
pub use node_handle::NodeHandle;
pub use rpc_client::RpcNode;
pub use test_daemon::TestDaemon;

use std::net::SocketAddr;

use async_trait::async_trait;
use regtest_common::{crypto::Hash, transaction::OutPoint, transaction::Transaction};
use serde::{Deserialize, Serialize};

/// Mempool entry as reported by `getmempoolentry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolEntry {
    pub vsize: u64,
    pub weight: u64,
    /// Fee in satoshis
    pub fee: u64,
    /// Entry time in seconds since the epoch
    pub time: u64,
    pub height: u64,
    pub depends: Vec<Hash>,
}

/// One output found by `scantxoutset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanUnspent {
    pub outpoint: OutPoint,
    pub script_pubkey: Vec<u8>,
    pub desc: String,
    pub amount: u64,
    pub coinbase: bool,
    pub height: u64,
}

/// Result of `scantxoutset start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    /// Height of the chain the scan ran against
    pub height: u64,
    pub best_block: Hash,
    pub unspents: Vec<ScanUnspent>,
    pub total_amount: u64,
}

/// RPC surface of a regtest node as used by the harness.
///
/// Amounts are satoshis on this side of the trait. Implementations convert
/// from and to the decimal coin values of the wire format exactly.
///
/// # Errors
///
/// Every method fails with [`RpcError::Rpc`] carrying the node's own code
/// and message when the node refuses the call, so scenarios can assert on
/// rejection reasons verbatim.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// `createwallet`
    async fn create_wallet(&self, name: &str) -> Result<(), RpcError>;

    /// `getnewaddress` on the named wallet.
    async fn get_new_address(&self, wallet: &str) -> Result<String, RpcError>;

    /// Trusted balance of the named wallet: mature coinbase outputs,
    /// confirmed outputs and unconfirmed change of its own transactions.
    async fn get_balance(&self, wallet: &str) -> Result<u64, RpcError>;

    /// `sendtoaddress`: pay `amount` from the named wallet, returning the txid.
    async fn send_to_address(
        &self,
        wallet: &str,
        address: &str,
        amount: u64,
    ) -> Result<Hash, RpcError>;

    async fn get_raw_mempool(&self) -> Result<Vec<Hash>, RpcError>;

    /// Fails with `RPC_INVALID_ADDRESS_OR_KEY` when `txid` is not in the mempool.
    async fn get_mempool_entry(&self, txid: &Hash) -> Result<MempoolEntry, RpcError>;

    async fn get_best_block_hash(&self) -> Result<Hash, RpcError>;

    /// Height of the active chain tip.
    async fn get_block_count(&self) -> Result<u64, RpcError>;

    /// Mine `count` blocks paying the coinbase to `address`.
    async fn generate_to_address(&self, count: u64, address: &str)
        -> Result<Vec<Hash>, RpcError>;

    /// Mine `count` blocks paying the coinbase to the script of `descriptor`.
    async fn generate_to_descriptor(
        &self,
        count: u64,
        descriptor: &str,
    ) -> Result<Vec<Hash>, RpcError>;

    /// Submit a transaction to the mempool; the node relays it on success.
    async fn send_raw_transaction(&self, tx: &Transaction) -> Result<Hash, RpcError>;

    /// Unspent outputs of the active chain matching any of `descriptors`.
    async fn scan_tx_out_set(&self, descriptors: &[String]) -> Result<ScanResult, RpcError>;

    /// Open an outbound connection to another node's P2P endpoint.
    async fn add_node(&self, endpoint: SocketAddr) -> Result<(), RpcError>;

    async fn disconnect_node(&self, endpoint: SocketAddr) -> Result<(), RpcError>;

    async fn get_connection_count(&self) -> Result<usize, RpcError>;

    /// Where peers (and the harness's peer emulator) connect to this node.
    fn p2p_endpoint(&self) -> SocketAddr;
}
