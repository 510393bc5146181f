//! Tier 1: chain model
//!
//! In-process regtest chain without RPC or P2P: block tree with reorgs,
//! UTXO set, mempool with the relay policy tests rely on, and node-style
//! wallets. Deterministic and synchronous; the simulated daemon of tier 2
//! wraps it behind a lock.
//!
//! ## Example
//!
//! ```rust
//! use regtest_common::config::{ChainParams, COIN};
//! use regtest_testing_framework::tier1_component::{decode_address, SimChain, SimWallet};
//!
//! let mut chain = SimChain::new(ChainParams::regtest());
//! let mut wallet = SimWallet::new("w1");
//! let script = decode_address(&wallet.new_address()).unwrap();
//! for i in 0..101 {
//!     chain.mine_block(&script, 1_700_000_000 + i).unwrap();
//! }
//! assert_eq!(wallet.balance(&chain), 50 * COIN);
//! ```

mod chain;
mod mempool;
mod node_wallet;

pub use chain::{genesis_block, BlockOutcome, ChainError, Coin, SimChain, GENESIS_TIME};
pub use mempool::{Mempool, MempoolTx, Rejection, ALREADY_IN_MEMPOOL};
pub use node_wallet::{decode_address, encode_address, SimWallet, ADDRESS_PREFIX};
