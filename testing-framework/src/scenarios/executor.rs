//! YAML scenario execution engine
//!
//! This module executes parsed YAML test scenarios against a network of
//! in-process daemons, providing a high-level DSL for functional tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use regtest_testing_framework::scenarios::{ScenarioExecutor, parse_scenario};
//!
//! let yaml = r#"
//! name: "Mine and check"
//! setup:
//!   nodes: 2
//! steps:
//!   - action: create_wallet
//!     node: 0
//!     wallet: w1
//!   - action: get_new_address
//!     node: 0
//!     wallet: w1
//!     save_as: miner
//!   - action: generate_to_address
//!     node: 0
//!     count: 101
//!     address: miner
//!   - action: assert_balance
//!     node: 0
//!     wallet: w1
//!     eq: "50"
//! "#;
//!
//! let scenario = parse_scenario(yaml)?;
//! let mut executor = ScenarioExecutor::new();
//! let report = executor.run(scenario).await;
//!
//! assert!(report.success);
//! ```

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use regtest_common::{crypto::Hash, p2p::NetworkMessage, utils::format_coin};
use tokio::time::Duration;

use super::parser::{BalanceExpect, Step, TestScenario};
use crate::invariants::{
    check_coin_supply, check_mempool_consistency, check_mempools_agree, check_tips_agree,
    check_wallet_utxos,
};
use crate::orchestrator::{Clock, HarnessConfig};
use crate::tier1_component::SimChain;
use crate::tier2_integration::NodeRpc;
use crate::tier3_e2e::{RegtestNetwork, RegtestNetworkBuilder};
use crate::wallet::{MiniWallet, WalletMode};

/// Scenario executor that runs parsed YAML scenarios
pub struct ScenarioExecutor {
    config: HarnessConfig,

    /// Clock handed to the network; the system clock when unset
    clock: Option<Arc<dyn Clock>>,

    /// Network started from the scenario setup
    network: Option<Arc<RegtestNetwork>>,

    /// Values stored with `save_as` (addresses, txids)
    vars: HashMap<String, String>,

    /// Minimal wallet and the node it was last scanned from
    mini_wallet: Option<(usize, MiniWallet)>,

    /// Execution log
    log: Vec<String>,

    /// Current step number (1-indexed)
    current_step: usize,

    completed_steps: usize,
}

impl ScenarioExecutor {
    pub fn new() -> Self {
        Self::with_config(HarnessConfig::default())
    }

    pub fn with_config(config: HarnessConfig) -> Self {
        Self {
            config,
            clock: None,
            network: None,
            vars: HashMap::new(),
            mini_wallet: None,
            log: Vec::new(),
            current_step: 0,
            completed_steps: 0,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Network of the last executed scenario, still running
    pub fn network(&self) -> Option<&Arc<RegtestNetwork>> {
        self.network.as_ref()
    }

    /// Value stored by a step's `save_as`
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Execute a scenario and turn any failure into a failed report.
    pub async fn run(&mut self, scenario: TestScenario) -> ExecutionReport {
        let scenario_name = scenario.name.clone();
        match self.execute(scenario).await {
            Ok(report) => report,
            Err(e) => {
                let failure = format!("{:#}", e);
                warn!("scenario '{}' failed: {}", scenario_name, failure);
                self.log(format!("\n=== Scenario failed: {} ===", failure));
                ExecutionReport {
                    scenario_name,
                    steps_executed: self.completed_steps,
                    success: false,
                    failure: Some(failure),
                    log: self.log.clone(),
                }
            }
        }
    }

    /// Execute a complete scenario
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The network fails to start
    /// - Any step execution fails
    /// - Any assertion or invariant fails
    pub async fn execute(&mut self, scenario: TestScenario) -> Result<ExecutionReport> {
        self.log.clear();
        self.vars.clear();
        self.mini_wallet = None;
        self.current_step = 0;
        self.completed_steps = 0;

        info!("running scenario '{}'", scenario.name);
        self.log(format!("Starting scenario: {}", scenario.name));
        if let Some(desc) = &scenario.description {
            self.log(format!("Description: {}", desc));
        }

        self.setup_network(&scenario).await?;

        for (idx, step) in scenario.steps.iter().enumerate() {
            self.current_step = idx + 1;
            debug!("step {}: {:?}", self.current_step, step);
            self.log(format!("\n--- Step {}: {:?} ---", self.current_step, step));

            self.execute_step(step)
                .await
                .with_context(|| format!("Failed at step {} ({:?})", self.current_step, step))?;
            self.completed_steps += 1;
        }

        if let Some(invariants) = &scenario.invariants {
            self.log("\n--- Checking Invariants ---".to_string());
            for inv in invariants {
                self.check_invariant(inv)
                    .await
                    .with_context(|| format!("Invariant '{}' violated", inv))?;
            }
        }

        self.log("\n=== Scenario completed successfully ===".to_string());
        info!("scenario '{}' passed", scenario.name);

        Ok(ExecutionReport {
            scenario_name: scenario.name,
            steps_executed: self.completed_steps,
            success: true,
            failure: None,
            log: self.log.clone(),
        })
    }

    async fn setup_network(&mut self, scenario: &TestScenario) -> Result<()> {
        let setup = &scenario.setup;
        let topology = setup.network_topology();
        self.log(format!(
            "Starting {} node(s), {:?}, {} cached blocks",
            setup.nodes, topology, setup.cached_blocks
        ));

        let mut builder = RegtestNetworkBuilder::new()
            .with_nodes(setup.nodes)
            .with_topology(topology)
            .with_config(self.config.clone())
            .with_cached_blocks(setup.cached_blocks);
        if let Some(delay) = setup.relay_delay_ms {
            builder = builder.with_relay_delay(Duration::from_millis(delay));
        }
        if let Some(clock) = &self.clock {
            builder = builder.with_clock(clock.clone());
        }

        // Replacing the previous network stops its daemons
        self.network = None;
        let network = builder
            .build()
            .await
            .context("Failed to start scenario network")?;
        self.log(format!("Network up: edges {:?}", network.edges()));
        self.network = Some(Arc::new(network));
        Ok(())
    }

    fn network_handle(&self) -> Result<Arc<RegtestNetwork>> {
        self.network.clone().context("Network not initialized")
    }

    /// Execute a single step
    async fn execute_step(&mut self, step: &Step) -> Result<()> {
        let network = self.network_handle()?;
        match step {
            Step::CreateWallet { node, wallet } => {
                network.node(*node).create_wallet(wallet).await?;
                self.log(format!("  ✓ Wallet '{}' created on node{}", wallet, node));
            }
            Step::GetNewAddress {
                node,
                wallet,
                save_as,
            } => {
                let address = network.node(*node).get_new_address(wallet).await?;
                self.log(format!("  ✓ {} = {}", save_as, address));
                self.vars.insert(save_as.clone(), address);
            }
            Step::Generate { node, count } => {
                let hashes = network.generate(*node, *count).await?;
                self.log_mined(*node, &hashes);
            }
            Step::GenerateToAddress {
                node,
                count,
                address,
            } => {
                let address = self.resolve(address);
                let hashes = network.generate_to_address(*node, *count, &address).await?;
                self.log_mined(*node, &hashes);
            }
            Step::SendToAddress {
                node,
                wallet,
                address,
                amount,
                save_as,
            } => {
                let address = self.resolve(address);
                let txid = network
                    .node(*node)
                    .send_to_address(wallet, &address, *amount)
                    .await?;
                self.log(format!(
                    "  ✓ {} sent {} to {} (txid={})",
                    wallet,
                    format_coin(*amount),
                    address,
                    txid
                ));
                self.save(save_as, txid);
            }
            Step::SyncAll => {
                let tip = network.sync_all().await?;
                self.log(format!("  ✓ All nodes at {}", tip));
            }
            Step::SyncMempools => {
                network.sync_mempools().await?;
                self.log("  ✓ Mempools in sync".to_string());
            }
            Step::Connect { from, to } => {
                network.connect(*from, *to).await?;
                self.log(format!("  ✓ node{} <-> node{}", from, to));
            }
            Step::Disconnect { from, to } => {
                network.disconnect(*from, *to).await?;
                self.log(format!("  ✓ node{} -/- node{}", from, to));
            }
            Step::AssertBalance {
                node,
                wallet,
                expect,
            } => {
                let actual = network.node(*node).get_balance(wallet).await?;
                self.execute_assert_balance(wallet, actual, expect)?;
            }
            Step::AssertBlockCount { node, eq } => {
                let actual = network.node(*node).get_block_count().await?;
                anyhow::ensure!(
                    actual == *eq,
                    "Block count assertion failed: expected {}, got {}",
                    eq,
                    actual
                );
                self.log(format!("  ✓ node{} at height {}", node, eq));
            }
            Step::AssertMempoolSize { node, eq } => {
                let mempool = network.node(*node).get_raw_mempool().await?;
                anyhow::ensure!(
                    mempool.len() == *eq,
                    "Mempool size assertion failed: expected {}, got {}",
                    eq,
                    mempool.len()
                );
                self.log(format!("  ✓ node{} mempool holds {}", node, eq));
            }
            Step::AssertInMempool { node, txid } => {
                let txid = self.resolve_txid(txid)?;
                let mempool = network.node(*node).get_raw_mempool().await?;
                anyhow::ensure!(
                    mempool.contains(&txid),
                    "Transaction {} not in mempool of node{}",
                    txid,
                    node
                );
                self.log(format!("  ✓ {} in mempool of node{}", txid, node));
            }
            Step::AssertNotInMempool { node, txid } => {
                let txid = self.resolve_txid(txid)?;
                let mempool = network.node(*node).get_raw_mempool().await?;
                anyhow::ensure!(
                    !mempool.contains(&txid),
                    "Transaction {} still in mempool of node{}",
                    txid,
                    node
                );
                self.log(format!("  ✓ {} not in mempool of node{}", txid, node));
            }
            Step::MiniWalletScan { node } => {
                let mut wallet = MiniWallet::new(WalletMode::AddressOpTrue);
                wallet.scan(network.node(*node).rpc().as_ref()).await?;
                self.log(format!(
                    "  ✓ Minimal wallet: {} outputs, {} spendable",
                    wallet.utxos().len(),
                    format_coin(wallet.get_balance())
                ));
                self.mini_wallet = Some((*node, wallet));
            }
            Step::MiniWalletSelfTransfer {
                node,
                fee_policy,
                save_as,
            } => {
                let (scanned_on, wallet) = self
                    .mini_wallet
                    .as_mut()
                    .context("mini_wallet_scan must run before mini_wallet_self_transfer")?;
                let fee_policy = fee_policy.unwrap_or_default();
                let txid = wallet
                    .send_self_transfer(network.node(*node), fee_policy)
                    .await?;
                *scanned_on = *node;
                self.log(format!("  ✓ Self-transfer {} via node{}", txid, node));
                self.save(save_as, txid);
            }
            Step::P2pPing { node, nonce } => {
                let peer = network.node(*node).add_p2p_connection().await?;
                let seen = peer.message_count("pong");
                peer.send_without_ping(NetworkMessage::Ping(*nonce)).await?;
                let pong = peer.wait_for_new_message("pong", seen).await?;
                peer.close();
                anyhow::ensure!(
                    pong == NetworkMessage::Pong(*nonce),
                    "Expected pong with nonce {}, got {:?}",
                    nonce,
                    pong
                );
                self.log(format!("  ✓ node{} answered ping {}", node, nonce));
            }
        }

        Ok(())
    }

    fn execute_assert_balance(
        &mut self,
        wallet: &str,
        actual: u64,
        expect: &BalanceExpect,
    ) -> Result<()> {
        self.log(format!(
            "Assert balance for '{}': actual={}",
            wallet,
            format_coin(actual)
        ));

        match expect {
            BalanceExpect::Eq { eq } => {
                if actual != *eq {
                    anyhow::bail!(
                        "Balance assertion failed: expected {}, got {}",
                        format_coin(*eq),
                        format_coin(actual)
                    );
                }
                self.log(format!("  ✓ Balance equals {}", format_coin(*eq)));
            }
            BalanceExpect::Within { within } => {
                let min = within.target.saturating_sub(within.tolerance);
                let max = within.target.saturating_add(within.tolerance);

                if actual < min || actual > max {
                    anyhow::bail!(
                        "Balance out of tolerance: expected {} ± {}, got {}",
                        format_coin(within.target),
                        format_coin(within.tolerance),
                        format_coin(actual)
                    );
                }
                self.log(format!(
                    "  ✓ Balance within {} ± {}",
                    format_coin(within.target),
                    format_coin(within.tolerance)
                ));
            }
            BalanceExpect::Compare { compare } => {
                if !compare.holds(actual) {
                    anyhow::bail!(
                        "Balance assertion failed: {} is not {}",
                        format_coin(actual),
                        compare
                    );
                }
                self.log(format!("  ✓ Balance {}", compare));
            }
        }

        Ok(())
    }

    async fn check_invariant(&mut self, invariant: &str) -> Result<()> {
        let network = self.network_handle()?;
        let nodes: Vec<&dyn NodeRpc> = network
            .nodes()
            .iter()
            .map(|node| node.rpc().as_ref())
            .collect();

        match invariant {
            "tips_agree" => {
                let tip = check_tips_agree(&nodes).await?;
                self.log(format!("  ✓ tips_agree ({})", tip));
            }
            "mempools_agree" => {
                check_mempools_agree(&nodes).await?;
                self.log("  ✓ mempools_agree".to_string());
            }
            "coin_supply" => {
                for_each_chain(&network, check_coin_supply)?;
                self.log("  ✓ coin_supply".to_string());
            }
            "mempool_consistency" => {
                for_each_chain(&network, check_mempool_consistency)?;
                self.log("  ✓ mempool_consistency".to_string());
            }
            "wallet_utxos" => {
                let (index, wallet) = self
                    .mini_wallet
                    .as_ref()
                    .context("wallet_utxos needs a scanned minimal wallet")?;
                let daemon = network
                    .daemon(*index)
                    .with_context(|| format!("node{} is not an in-process daemon", index))?;
                daemon.with_chain(|chain| check_wallet_utxos(wallet, chain))?;
                self.log("  ✓ wallet_utxos".to_string());
            }
            other => anyhow::bail!("Unknown invariant: {}", other),
        }
        Ok(())
    }

    /// Stored value named `value`, or `value` itself
    fn resolve(&self, value: &str) -> String {
        self.vars
            .get(value)
            .cloned()
            .unwrap_or_else(|| value.to_string())
    }

    fn resolve_txid(&self, value: &str) -> Result<Hash> {
        let resolved = self.resolve(value);
        Hash::from_str(&resolved).map_err(|e| anyhow::anyhow!("Invalid txid '{}': {}", resolved, e))
    }

    fn save(&mut self, name: &Option<String>, txid: Hash) {
        if let Some(name) = name {
            self.vars.insert(name.clone(), txid.to_string());
        }
    }

    fn log_mined(&mut self, node: usize, hashes: &[Hash]) {
        match hashes.last() {
            Some(tip) => self.log(format!(
                "  ✓ node{} mined {} block(s), tip={}",
                node,
                hashes.len(),
                tip
            )),
            None => self.log(format!("  ✓ node{} mined no blocks", node)),
        }
    }

    /// Add log entry
    fn log(&mut self, message: String) {
        self.log.push(message);
    }

    /// Get execution log
    pub fn get_log(&self) -> &[String] {
        &self.log
    }
}

impl Default for ScenarioExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn for_each_chain<F>(network: &RegtestNetwork, check: F) -> Result<()>
where
    F: Fn(&SimChain) -> Result<()>,
{
    for index in 0..network.len() {
        let daemon = network
            .daemon(index)
            .with_context(|| format!("node{} is not an in-process daemon", index))?;
        daemon
            .with_chain(&check)
            .with_context(|| format!("on node{}", index))?;
    }
    Ok(())
}

/// Execution report
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub scenario_name: String,

    /// Steps that ran to completion
    pub steps_executed: usize,

    pub success: bool,

    /// Error chain of the failing step or invariant
    pub failure: Option<String>,

    pub log: Vec<String>,
}

impl ExecutionReport {
    /// Print report to stdout
    pub fn print(&self) {
        println!("\n=== Scenario Execution Report ===");
        println!("  Name:   {}", self.scenario_name);
        println!("  Steps:  {}", self.steps_executed);
        println!(
            "  Status: {}",
            if self.success { "SUCCESS ✓" } else { "FAILED ✗" }
        );
        if let Some(failure) = &self.failure {
            println!("  Error:  {}", failure);
        }

        println!("\nExecution Log:");
        for entry in &self.log {
            println!("{}", entry);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use crate::scenarios::parser::parse_scenario;
    use regtest_common::config::COIN;

    #[tokio::test]
    async fn test_wallet_payment_scenario() {
        let yaml = r#"
name: "Payment"
description: "w1 pays w2 across two nodes"
setup:
  nodes: 2
steps:
  - action: create_wallet
    node: 0
    wallet: w1
  - action: create_wallet
    node: 1
    wallet: w2
  - action: get_new_address
    node: 0
    wallet: w1
    save_as: miner
  - action: get_new_address
    node: 1
    wallet: w2
    save_as: payee
  - action: generate_to_address
    node: 0
    count: 101
    address: miner
  - action: assert_balance
    node: 0
    wallet: w1
    eq: "50"
  - action: send_to_address
    node: 0
    wallet: w1
    address: payee
    amount: 1
    save_as: payment
  - action: sync_mempools
  - action: assert_in_mempool
    node: 1
    txid: payment
  - action: generate
    node: 0
    count: 1
  - action: assert_not_in_mempool
    node: 1
    txid: payment
  - action: assert_balance
    node: 1
    wallet: w2
    eq: "1"
  - action: assert_balance
    node: 0
    wallet: w1
    within:
      target: "99"
      tolerance: "0.001"
invariants:
  - tips_agree
  - mempools_agree
  - coin_supply
"#;

        let scenario = parse_scenario(yaml).unwrap();
        let mut executor = ScenarioExecutor::new();
        let report = executor.execute(scenario).await.unwrap();

        assert!(report.success);
        assert_eq!(report.steps_executed, 13);
        assert!(executor.var("payee").unwrap().starts_with("sim1"));
        let network = executor.network().unwrap();
        assert_eq!(network.node(1).get_balance("w2").await.unwrap(), COIN);
    }

    #[tokio::test]
    async fn test_miniwallet_scenario() {
        let yaml = r#"
name: "Minimal wallet"
setup:
  nodes: 1
  cached_blocks: 200
steps:
  - action: mini_wallet_scan
    node: 0
  - action: mini_wallet_self_transfer
    node: 0
    save_as: tx
  - action: assert_mempool_size
    node: 0
    eq: 1
  - action: generate
    node: 0
    count: 1
  - action: assert_mempool_size
    node: 0
    eq: 0
  - action: assert_block_count
    node: 0
    eq: 201
  - action: p2p_ping
    node: 0
    nonce: 1
invariants:
  - wallet_utxos
  - mempool_consistency
"#;

        let scenario = parse_scenario(yaml).unwrap();
        let mut executor = ScenarioExecutor::new();
        let report = executor.run(scenario).await;

        assert!(report.success, "{:?}", report.failure);
        assert_eq!(report.steps_executed, 7);
        assert!(Hash::from_str(executor.var("tx").unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_self_transfer_fee_policy_and_chained_change() {
        // One spendable coinbase, so the second transfer spends unconfirmed change
        let yaml = r#"
name: "Chained self-transfers"
setup:
  nodes: 1
  cached_blocks: 100
steps:
  - action: mini_wallet_scan
    node: 0
  - action: mini_wallet_self_transfer
    node: 0
    fee_policy:
      fixed: 12345
    save_as: parent
  - action: mini_wallet_self_transfer
    node: 0
    fee_policy:
      rate:
        sat_per_kvb: 2000
    save_as: child
  - action: assert_mempool_size
    node: 0
    eq: 2
invariants:
  - mempool_consistency
  - wallet_utxos
"#;

        let scenario = parse_scenario(yaml).unwrap();
        let mut executor = ScenarioExecutor::new();
        let report = executor.run(scenario).await;
        assert!(report.success, "{:?}", report.failure);

        let network = executor.network().unwrap();
        let parent = Hash::from_str(executor.var("parent").unwrap()).unwrap();
        let child = Hash::from_str(executor.var("child").unwrap()).unwrap();
        let parent_entry = network.node(0).get_mempool_entry(&parent).await.unwrap();
        assert_eq!(parent_entry.fee, 12_345);
        let child_entry = network.node(0).get_mempool_entry(&child).await.unwrap();
        assert_eq!(child_entry.depends, vec![parent]);
        assert_eq!(child_entry.fee, (child_entry.vsize * 2000).div_ceil(1000));
    }

    #[tokio::test]
    async fn test_failed_assertion_report() {
        let yaml = r#"
name: "Wrong height"
setup:
  nodes: 1
  cached_blocks: 3
steps:
  - action: assert_block_count
    node: 0
    eq: 3
  - action: assert_block_count
    node: 0
    eq: 4
  - action: generate
    node: 0
    count: 1
"#;

        let scenario = parse_scenario(yaml).unwrap();
        let mut executor = ScenarioExecutor::new();
        let report = executor.run(scenario).await;

        assert!(!report.success);
        assert_eq!(report.steps_executed, 1);
        let failure = report.failure.unwrap();
        assert!(failure.contains("step 2"));
        assert!(failure.contains("expected 4, got 3"));
    }

    #[tokio::test]
    async fn test_balance_comparison() {
        let yaml = r#"
name: "Compare"
setup:
  nodes: 1
steps:
  - action: create_wallet
    node: 0
    wallet: w
  - action: get_new_address
    node: 0
    wallet: w
    save_as: a
  - action: generate_to_address
    node: 0
    count: 101
    address: a
  - action: assert_balance
    node: 0
    wallet: w
    compare:
      gte: "50"
  - action: assert_balance
    node: 0
    wallet: w
    compare:
      lt: "50"
"#;

        let scenario = parse_scenario(yaml).unwrap();
        let mut executor = ScenarioExecutor::new();
        let report = executor.run(scenario).await;

        assert!(!report.success);
        assert_eq!(report.steps_executed, 4);
        assert!(report.failure.unwrap().contains("is not < 50"));
    }

    #[tokio::test]
    async fn test_partition_scenario() {
        let yaml = r#"
name: "Partition"
setup:
  nodes: 3
  edges: [[0, 1], [1, 2]]
steps:
  - action: disconnect
    from: 1
    to: 2
  - action: generate
    node: 0
    count: 2
  - action: generate
    node: 2
    count: 3
  - action: assert_block_count
    node: 1
    eq: 2
  - action: connect
    from: 1
    to: 2
  - action: sync_all
  - action: assert_block_count
    node: 0
    eq: 3
invariants:
  - tips_agree
  - coin_supply
"#;

        let scenario = parse_scenario(yaml).unwrap();
        let mut executor = ScenarioExecutor::new();
        let report = executor.execute(scenario).await.unwrap();
        assert!(report.success);
    }
}
