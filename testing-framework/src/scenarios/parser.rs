//! YAML scenario parser
//!
//! Amounts are coin values, written as strings so fractional values stay
//! exact (`"0.5"`, `"49.9999"`). Whole-coin amounts may also be plain
//! numbers. Balance assertions support `eq`, `within {target, tolerance}`
//! and `compare {gte|lte|gt|lt}`.
//!
//! ## Example Scenario
//!
//! ```yaml
//! name: "Payment"
//! setup:
//!   nodes: 2
//!   topology: line
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
//! invariants:
//!   - tips_agree
//! ```

use std::collections::HashSet;
use std::fmt;

use anyhow::Result;
use regtest_common::{config::COIN, utils::parse_coin};
use serde::{Deserialize, Serialize};

use crate::tier3_e2e::NetworkTopology;
use crate::wallet::FeePolicy;

/// Invariant names a scenario may list
pub const KNOWN_INVARIANTS: &[&str] = &[
    "tips_agree",
    "mempools_agree",
    "coin_supply",
    "mempool_consistency",
    "wallet_utxos",
];

/// Complete test scenario loaded from YAML
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TestScenario {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Network to start before the first step
    #[serde(default)]
    pub setup: NetworkSetup,

    pub steps: Vec<Step>,

    /// Invariants to check after the last step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invariants: Option<Vec<String>>,
}

/// Nodes and links of the scenario network
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct NetworkSetup {
    pub nodes: usize,
    pub topology: TopologyKind,
    /// Explicit links; when present they replace `topology`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edges: Option<Vec<(usize, usize)>>,
    /// Blocks every node starts with, paid to the minimal wallet's script
    pub cached_blocks: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_delay_ms: Option<u64>,
}

impl Default for NetworkSetup {
    fn default() -> Self {
        Self {
            nodes: 1,
            topology: TopologyKind::Line,
            edges: None,
            cached_blocks: 0,
            relay_delay_ms: None,
        }
    }
}

impl NetworkSetup {
    pub fn network_topology(&self) -> NetworkTopology {
        if let Some(edges) = &self.edges {
            return NetworkTopology::Custom(edges.clone());
        }
        match self.topology {
            TopologyKind::Line => NetworkTopology::Line,
            TopologyKind::Ring => NetworkTopology::Ring,
            TopologyKind::FullMesh => NetworkTopology::FullMesh,
            TopologyKind::Star => NetworkTopology::Star,
            TopologyKind::Isolated => NetworkTopology::Isolated,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    Line,
    Ring,
    FullMesh,
    Star,
    Isolated,
}

/// Test execution step
///
/// `address` and `txid` fields take either a literal value or a name
/// stored earlier with `save_as`.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    CreateWallet {
        node: usize,
        wallet: String,
    },

    /// Derive a fresh address and store it under `save_as`
    GetNewAddress {
        node: usize,
        wallet: String,
        save_as: String,
    },

    /// Mine to the default descriptor and wait for the miner's component
    Generate {
        node: usize,
        count: u64,
    },

    GenerateToAddress {
        node: usize,
        count: u64,
        address: String,
    },

    SendToAddress {
        node: usize,
        wallet: String,
        address: String,
        #[serde(deserialize_with = "deserialize_coin_amount")]
        amount: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        save_as: Option<String>,
    },

    SyncAll,

    SyncMempools,

    Connect {
        from: usize,
        to: usize,
    },

    Disconnect {
        from: usize,
        to: usize,
    },

    /// Assert a node wallet balance (supports eq/within/compare)
    AssertBalance {
        node: usize,
        wallet: String,
        #[serde(flatten)]
        expect: BalanceExpect,
    },

    AssertBlockCount {
        node: usize,
        eq: u64,
    },

    AssertMempoolSize {
        node: usize,
        eq: usize,
    },

    AssertInMempool {
        node: usize,
        txid: String,
    },

    AssertNotInMempool {
        node: usize,
        txid: String,
    },

    /// Rebuild the minimal wallet's outputs from `node`
    MiniWalletScan {
        node: usize,
    },

    /// Self-transfer from the minimal wallet, at the default fee rate unless
    /// `fee_policy` is given (`fixed: 500` or `rate: {sat_per_kvb: 2000}`)
    MiniWalletSelfTransfer {
        node: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fee_policy: Option<FeePolicy>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        save_as: Option<String>,
    },

    /// Send a ping over a fresh peer connection and expect the same nonce back
    P2pPing {
        node: usize,
        nonce: u64,
    },
}

impl Step {
    /// Nodes the step addresses, for index validation.
    fn nodes(&self) -> Vec<usize> {
        match self {
            Step::CreateWallet { node, .. }
            | Step::GetNewAddress { node, .. }
            | Step::Generate { node, .. }
            | Step::GenerateToAddress { node, .. }
            | Step::SendToAddress { node, .. }
            | Step::AssertBalance { node, .. }
            | Step::AssertBlockCount { node, .. }
            | Step::AssertMempoolSize { node, .. }
            | Step::AssertInMempool { node, .. }
            | Step::AssertNotInMempool { node, .. }
            | Step::MiniWalletScan { node }
            | Step::MiniWalletSelfTransfer { node, .. }
            | Step::P2pPing { node, .. } => vec![*node],
            Step::Connect { from, to } | Step::Disconnect { from, to } => vec![*from, *to],
            Step::SyncAll | Step::SyncMempools => Vec::new(),
        }
    }
}

/// Balance assertion modes
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(untagged)]
pub enum BalanceExpect {
    Eq {
        #[serde(deserialize_with = "deserialize_coin_amount")]
        eq: u64,
    },

    Within {
        within: Tolerance,
    },

    Compare {
        compare: CompareOp,
    },
}

/// Target and tolerance for approximate assertions
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Tolerance {
    #[serde(deserialize_with = "deserialize_coin_amount")]
    pub target: u64,

    /// Allowed distance from `target` in either direction
    #[serde(deserialize_with = "deserialize_coin_amount")]
    pub tolerance: u64,
}

/// Comparison operators for balance assertions
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(untagged)]
pub enum CompareOp {
    Gte {
        #[serde(deserialize_with = "deserialize_coin_amount")]
        gte: u64,
    },

    Lte {
        #[serde(deserialize_with = "deserialize_coin_amount")]
        lte: u64,
    },

    Gt {
        #[serde(deserialize_with = "deserialize_coin_amount")]
        gt: u64,
    },

    Lt {
        #[serde(deserialize_with = "deserialize_coin_amount")]
        lt: u64,
    },
}

impl CompareOp {
    pub fn holds(&self, actual: u64) -> bool {
        match *self {
            CompareOp::Gte { gte } => actual >= gte,
            CompareOp::Lte { lte } => actual <= lte,
            CompareOp::Gt { gt } => actual > gt,
            CompareOp::Lt { lt } => actual < lt,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use regtest_common::utils::format_coin;
        match *self {
            CompareOp::Gte { gte } => write!(f, ">= {}", format_coin(gte)),
            CompareOp::Lte { lte } => write!(f, "<= {}", format_coin(lte)),
            CompareOp::Gt { gt } => write!(f, "> {}", format_coin(gt)),
            CompareOp::Lt { lt } => write!(f, "< {}", format_coin(lt)),
        }
    }
}

/// Custom deserializer: coin amount to satoshis
///
/// This allows YAML to use either format:
/// - `amount: 50` (whole coins)
/// - `amount: "0.00001"` (string, any precision down to one satoshi)
fn deserialize_coin_amount<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct CoinVisitor;

    impl<'de> Visitor<'de> for CoinVisitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a coin amount as whole number or decimal string")
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            value
                .checked_mul(COIN)
                .ok_or_else(|| de::Error::custom(format!("amount overflows: {}", value)))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if value < 0 {
                return Err(de::Error::custom(format!(
                    "negative value not allowed: {}",
                    value
                )));
            }
            self.visit_u64(value as u64)
        }

        fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Err(de::Error::custom(format!(
                "fractional amount {} must be written as a string",
                value
            )))
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            parse_coin(value).map_err(de::Error::custom)
        }
    }

    deserializer.deserialize_any(CoinVisitor)
}

/// Parse YAML scenario file
pub fn parse_scenario(yaml: &str) -> Result<TestScenario> {
    let scenario: TestScenario = serde_yaml::from_str(yaml)
        .map_err(|e| anyhow::anyhow!("Failed to parse YAML scenario: {}", e))?;

    validate_scenario(&scenario)?;

    Ok(scenario)
}

/// Read and parse a scenario file
pub fn parse_scenario_file(path: impl AsRef<std::path::Path>) -> Result<TestScenario> {
    let path = path.as_ref();
    let yaml = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    parse_scenario(&yaml)
}

/// Validate scenario structure
fn validate_scenario(scenario: &TestScenario) -> Result<()> {
    anyhow::ensure!(!scenario.name.is_empty(), "Scenario name cannot be empty");

    let node_count = scenario.setup.nodes;
    anyhow::ensure!(node_count > 0, "Scenario must have at least one node");

    if let Some(edges) = &scenario.setup.edges {
        for &(a, b) in edges {
            anyhow::ensure!(
                a < node_count && b < node_count,
                "Edge ({}, {}) references a node outside 0..{}",
                a,
                b,
                node_count
            );
            anyhow::ensure!(a != b, "Edge ({}, {}) connects a node to itself", a, b);
        }
    }

    anyhow::ensure!(
        !scenario.steps.is_empty(),
        "Scenario must have at least one step"
    );

    // Wallets must be created before any step uses them
    let mut wallets = HashSet::new();
    for (idx, step) in scenario.steps.iter().enumerate() {
        for node in step.nodes() {
            anyhow::ensure!(
                node < node_count,
                "Step {} references node {} but the scenario has {} nodes",
                idx + 1,
                node,
                node_count
            );
        }

        match step {
            Step::CreateWallet { node, wallet } => {
                anyhow::ensure!(!wallet.is_empty(), "Wallet name cannot be empty");
                anyhow::ensure!(
                    wallets.insert((*node, wallet.as_str())),
                    "Duplicate wallet {} on node {}",
                    wallet,
                    node
                );
            }
            Step::GetNewAddress { node, wallet, .. }
            | Step::SendToAddress { node, wallet, .. }
            | Step::AssertBalance { node, wallet, .. } => {
                anyhow::ensure!(
                    wallets.contains(&(*node, wallet.as_str())),
                    "Step {} uses wallet {} before it is created on node {}",
                    idx + 1,
                    wallet,
                    node
                );
            }
            Step::Connect { from, to } | Step::Disconnect { from, to } => {
                anyhow::ensure!(from != to, "Step {} links node {} to itself", idx + 1, from);
            }
            _ => {}
        }
    }

    for invariant in scenario.invariants.iter().flatten() {
        anyhow::ensure!(
            KNOWN_INVARIANTS.contains(&invariant.as_str()),
            "Unknown invariant: {}",
            invariant
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::disallowed_methods)]

    use super::*;

    #[test]
    fn test_parse_simple_scenario() {
        let yaml = r#"
name: "Test Scenario"
description: "A simple test"
setup:
  nodes: 2
  cached_blocks: 10
steps:
  - action: create_wallet
    node: 1
    wallet: w2
  - action: get_new_address
    node: 1
    wallet: w2
    save_as: payee
  - action: generate
    node: 0
    count: 1
  - action: sync_all
  - action: assert_balance
    node: 1
    wallet: w2
    eq: "0"
invariants:
  - tips_agree
"#;

        let scenario = parse_scenario(yaml).expect("Failed to parse");
        assert_eq!(scenario.name, "Test Scenario");
        assert_eq!(scenario.setup.nodes, 2);
        assert_eq!(scenario.setup.cached_blocks, 10);
        assert_eq!(scenario.setup.network_topology(), NetworkTopology::Line);
        assert_eq!(scenario.steps.len(), 5);
        assert!(matches!(scenario.steps[3], Step::SyncAll));
    }

    #[test]
    fn test_setup_defaults_and_edges() {
        let yaml = r#"
name: "Defaults"
steps:
  - action: generate
    node: 0
    count: 1
"#;
        let scenario = parse_scenario(yaml).unwrap();
        assert_eq!(scenario.setup.nodes, 1);
        assert!(scenario.setup.relay_delay_ms.is_none());

        let yaml = r#"
name: "Edges"
setup:
  nodes: 3
  topology: full_mesh
  edges: [[0, 2], [2, 1]]
steps:
  - action: sync_all
"#;
        let scenario = parse_scenario(yaml).unwrap();
        assert_eq!(
            scenario.setup.network_topology(),
            NetworkTopology::Custom(vec![(0, 2), (2, 1)])
        );
    }

    #[test]
    fn test_parse_amounts() {
        let yaml = r#"
name: "Amounts"
setup:
  nodes: 1
steps:
  - action: create_wallet
    node: 0
    wallet: w
  - action: send_to_address
    node: 0
    wallet: w
    address: somewhere
    amount: "0.5"
  - action: send_to_address
    node: 0
    wallet: w
    address: somewhere
    amount: 2
"#;
        let scenario = parse_scenario(yaml).unwrap();
        match (&scenario.steps[1], &scenario.steps[2]) {
            (
                Step::SendToAddress { amount: half, .. },
                Step::SendToAddress { amount: two, .. },
            ) => {
                assert_eq!(*half, COIN / 2);
                assert_eq!(*two, 2 * COIN);
            }
            other => panic!("Expected transfers, got {:?}", other),
        }

        let bad = yaml.replace("amount: 2", "amount: 2.5");
        assert!(parse_scenario(&bad).is_err());
        let bad = yaml.replace("\"0.5\"", "\"0.000000001\"");
        assert!(parse_scenario(&bad).is_err());
    }

    #[test]
    fn test_parse_within_assertion() {
        let yaml = r#"
name: "Within Test"
steps:
  - action: create_wallet
    node: 0
    wallet: w
  - action: assert_balance
    node: 0
    wallet: w
    within:
      target: "49.9999"
      tolerance: "0.0001"
"#;

        let scenario = parse_scenario(yaml).expect("Failed to parse");
        match &scenario.steps[1] {
            Step::AssertBalance {
                expect: BalanceExpect::Within { within },
                ..
            } => {
                assert_eq!(within.target, 4_999_990_000);
                assert_eq!(within.tolerance, 10_000);
            }
            _ => panic!("Expected Within assertion"),
        }
    }

    #[test]
    fn test_parse_compare_assertion() {
        let yaml = r#"
name: "Compare Test"
steps:
  - action: create_wallet
    node: 0
    wallet: w
  - action: assert_balance
    node: 0
    wallet: w
    compare:
      lte: "49"
"#;

        let scenario = parse_scenario(yaml).unwrap();
        match &scenario.steps[1] {
            Step::AssertBalance {
                expect: BalanceExpect::Compare { compare },
                ..
            } => {
                assert!(compare.holds(49 * COIN));
                assert!(!compare.holds(49 * COIN + 1));
                assert_eq!(compare.to_string(), "<= 49.00000000");
            }
            _ => panic!("Expected Compare assertion"),
        }
    }

    #[test]
    fn test_parse_self_transfer_fee_policy() {
        let yaml = r#"
name: "Fees"
steps:
  - action: mini_wallet_scan
    node: 0
  - action: mini_wallet_self_transfer
    node: 0
  - action: mini_wallet_self_transfer
    node: 0
    fee_policy:
      fixed: 500
  - action: mini_wallet_self_transfer
    node: 0
    fee_policy: {rate: {sat_per_kvb: 2000}}
"#;

        let scenario = parse_scenario(yaml).unwrap();
        let policies: Vec<Option<FeePolicy>> = scenario
            .steps
            .iter()
            .filter_map(|step| match step {
                Step::MiniWalletSelfTransfer { fee_policy, .. } => Some(*fee_policy),
                _ => None,
            })
            .collect();
        assert_eq!(
            policies,
            vec![None, Some(FeePolicy::Fixed(500)), Some(FeePolicy::rate(2000))]
        );

        let bad = "name: Bad\nsteps:\n  - action: mini_wallet_self_transfer\n    node: 0\n    fee_policy: 500\n";
        assert!(parse_scenario(bad).is_err());
    }

    #[test]
    fn test_validation_errors() {
        // Node index out of range
        let yaml = r#"
name: "Bad"
setup:
  nodes: 2
steps:
  - action: generate
    node: 2
    count: 1
"#;
        assert!(parse_scenario(yaml).is_err());

        // Wallet used before creation
        let yaml = r#"
name: "Bad"
steps:
  - action: get_new_address
    node: 0
    wallet: w
    save_as: a
"#;
        let err = parse_scenario(yaml).unwrap_err();
        assert!(err.to_string().contains("before it is created"));

        // Duplicate wallet
        let yaml = r#"
name: "Bad"
steps:
  - action: create_wallet
    node: 0
    wallet: w
  - action: create_wallet
    node: 0
    wallet: w
"#;
        assert!(parse_scenario(yaml).is_err());

        // Self edge, empty steps, unknown invariant, unknown action
        let yaml = "name: Bad\nsetup:\n  nodes: 2\n  edges: [[1, 1]]\nsteps:\n  - action: sync_all\n";
        assert!(parse_scenario(yaml).is_err());
        assert!(parse_scenario("name: Bad\nsteps: []\n").is_err());
        let yaml = "name: Bad\nsteps:\n  - action: sync_all\ninvariants: [balance_conservation]\n";
        assert!(parse_scenario(yaml).is_err());
        assert!(parse_scenario("name: Bad\nsteps:\n  - action: explode\n").is_err());
    }
}
