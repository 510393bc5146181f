//! Everything a functional test usually needs, in one import.

pub use std::sync::Arc;
pub use std::time::Duration;

pub use regtest_common::{
    config::{ChainParams, COIN},
    crypto::Hash,
    p2p::NetworkMessage,
    utils::{format_coin, parse_coin},
};

pub use crate::invariants::{
    check_coin_supply, check_mempool_consistency, check_mempools_agree, check_tips_agree,
    check_wallet_utxos,
};
pub use crate::orchestrator::{
    poll_until, wait_until, Clock, HarnessConfig, PausedClock, Probe, SystemClock, TimeoutError,
    WaitConfig, WaitError,
};
pub use crate::p2p::{PeerConfig, PeerConnection, PeerError};
pub use crate::scenarios::{parse_scenario, parse_scenario_file, ExecutionReport, ScenarioExecutor};
pub use crate::tier1_component::SimChain;
pub use crate::tier2_integration::rpc_helpers::*;
pub use crate::tier2_integration::waiters::*;
pub use crate::tier2_integration::{
    codes, BitcoindConfig, BitcoindProcess, NodeHandle, NodeRpc, RpcError, RpcNode, TestDaemon,
    TestDaemonBuilder,
};
pub use crate::tier3_e2e::{
    default_mining_descriptor, NetworkTopology, RegtestNetwork, RegtestNetworkBuilder, SyncError,
};
pub use crate::wallet::{FeePolicy, MiniWallet, WalletError, WalletMode};
