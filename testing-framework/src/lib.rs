//! # Regtest Testing Framework
//!
//! Functional-test harness for regtest networks of Bitcoin-style nodes.
//!
//! ## Architecture Overview
//!
//! - **p2p**: scripted peer that speaks the wire protocol to a node
//! - **wallet**: minimal wallet that funds scenarios without the node wallet
//! - **Tier 1**: in-process chain model (`SimChain`, `SimWallet`)
//! - **Tier 2**: node handles behind the `NodeRpc` trait (JSON-RPC client,
//!   spawned node process, simulated in-process daemon)
//! - **Tier 3**: multi-node networks with topology wiring and sync barriers
//! - **scenarios**: YAML scenarios run against tier-3 networks
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use regtest_testing_framework::prelude::*;
//!
//! #[tokio::test]
//! async fn test_payment() -> anyhow::Result<()> {
//!     let network = RegtestNetworkBuilder::new().with_nodes(2).build().await?;
//!     let (node0, node1) = (network.node(0), network.node(1));
//!
//!     node0.create_wallet("w1").await?;
//!     node1.create_wallet("w2").await?;
//!     let miner = node0.get_new_address("w1").await?;
//!     network.generate_to_address(0, 101, &miner).await?;
//!
//!     let payee = node1.get_new_address("w2").await?;
//!     node0.send_to_address("w1", &payee, COIN).await?;
//!     network.generate(0, 1).await?;
//!     assert_balance(node1, "w2", COIN).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Design Principles
//!
//! 1. **Bounded**: every wait has a deadline and reports what it last saw
//! 2. **Deterministic**: `Clock` abstraction, paused time in tests
//! 3. **Binding-agnostic**: scenarios see nodes only through `NodeRpc`

#![warn(clippy::all)]

/// Core orchestration: Clock, bounded waits, harness configuration
pub mod orchestrator;

pub mod p2p;

pub mod wallet;

// Tier 1: chain model (in-process, no RPC/P2P)
pub mod tier1_component;

/// Tier 2: node handles (RPC bindings and the simulated daemon)
pub mod tier2_integration;

/// Tier 3: E2E testing (multi-node networks)
pub mod tier3_e2e;

// Invariant checkers (coin supply, mempool consistency, agreement)
pub mod invariants;

// DSL scenario parser and executor
pub mod scenarios;

// Convenient re-exports for common usage
pub mod prelude;

// Re-export commonly used types at crate root
pub use orchestrator::{Clock, HarnessConfig, PausedClock, SystemClock, WaitConfig};
pub use tier2_integration::{NodeHandle, NodeRpc, RpcError, TestDaemon, TestDaemonBuilder};
pub use tier3_e2e::{RegtestNetwork, RegtestNetworkBuilder};

/// Framework version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
