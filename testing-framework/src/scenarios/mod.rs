//! DSL scenario parser and executor
//!
//! A scenario is a YAML document describing a network (node count and
//! links), a list of steps run in order against it and the invariants
//! checked at the end. The executor turns it into a pass/fail
//! [`ExecutionReport`].
//!
//! - Coin amounts are strings (`"0.5"`) or whole numbers (`50`)
//! - `save_as` stores an address or txid under a name later steps can use
//! - Balance assertions take `eq`, `within {target, tolerance}` or
//!   `compare {gte|lte|gt|lt}`
//!
//! ## Example Scenario
//!
//! ```yaml
//! name: "Relay"
//! setup:
//!   nodes: 3
//!   topology: line
//!   cached_blocks: 110
//! steps:
//!   - action: mini_wallet_scan
//!     node: 0
//!   - action: mini_wallet_self_transfer
//!     node: 0
//!     save_as: tx
//!   - action: sync_mempools
//!   - action: assert_in_mempool
//!     node: 2
//!     txid: tx
//! invariants:
//!   - mempools_agree
//! ```

pub mod executor;
pub mod parser;

pub use executor::{ExecutionReport, ScenarioExecutor};
pub use parser::{parse_scenario, parse_scenario_file, Step, TestScenario};
