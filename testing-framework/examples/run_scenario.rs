//! Scenario runner demo
//!
//! Runs one YAML scenario against in-process daemons and prints the report.
//! The process exits non-zero when any step, assertion or invariant fails.
//!
//! Run with:
//!   cargo run --example run_scenario -- scenarios/wallet_payment.yaml
//!
//! Set `REGTEST_TIMEOUT_FACTOR` to stretch every wait on slow machines.

use anyhow::{Context, Result};
use regtest_testing_framework::{
    orchestrator::HarnessConfig,
    scenarios::{parse_scenario_file, ScenarioExecutor},
};

const DEFAULT_SCENARIO: &str = "scenarios/wallet_payment.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_SCENARIO.to_string());
    let scenario = parse_scenario_file(&path)?;
    println!("Scenario: {} ({} steps)", scenario.name, scenario.steps.len());

    let config = HarnessConfig::from_env().context("Invalid harness environment")?;
    let mut executor = ScenarioExecutor::with_config(config);
    let report = executor.run(scenario).await;
    report.print();

    if !report.success {
        std::process::exit(1);
    }
    Ok(())
}
