// Harness-wide configuration.
//
// Loaded from YAML (every field optional) and then adjusted by environment
// variables so CI can stretch timeouts or point at a node binary without
// touching scenario files:
//
//   REGTEST_TIMEOUT_FACTOR   multiplies every wait timeout (e.g. "2.5")
//   REGTEST_BITCOIND         path of the node binary for process-backed tests

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regtest_common::config::{ChainParams, Network, DEFAULT_MIN_RELAY_FEE_PER_KVB};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use super::wait::WaitConfig;

pub const ENV_TIMEOUT_FACTOR: &str = "REGTEST_TIMEOUT_FACTOR";
pub const ENV_BITCOIND: &str = "REGTEST_BITCOIND";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub network: Network,
    pub chain: ChainParams,
    /// Multiplier applied to every wait timeout
    pub timeout_factor: f64,
    pub wait: WaitSettings,
    pub daemon: DaemonSettings,
    /// Node binary used by process-backed nodes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitcoind: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitSettings {
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            poll_interval_ms: 50,
        }
    }
}

/// Behaviour of the in-process simulated node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Delay before a daemon announces a transaction or block to its peers
    pub relay_delay_ms: u64,
    pub min_relay_fee_per_kvb: u64,
    /// Fee rate the node wallet pays in sendtoaddress
    pub wallet_fee_per_kvb: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            relay_delay_ms: 0,
            min_relay_fee_per_kvb: DEFAULT_MIN_RELAY_FEE_PER_KVB,
            wallet_fee_per_kvb: 10_000,
        }
    }
}

impl DaemonSettings {
    pub fn relay_delay(&self) -> Duration {
        Duration::from_millis(self.relay_delay_ms)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            network: Network::Regtest,
            chain: ChainParams::regtest(),
            timeout_factor: 1.0,
            wait: WaitSettings::default(),
            daemon: DaemonSettings::default(),
            bitcoind: None,
        }
    }
}

impl HarnessConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).context("Failed to parse harness configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml_str(&yaml)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = env::var(ENV_TIMEOUT_FACTOR) {
            self.timeout_factor = value
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number, got {:?}", ENV_TIMEOUT_FACTOR, value))?;
            log::debug!("timeout factor set to {} from environment", self.timeout_factor);
        }
        if let Ok(value) = env::var(ENV_BITCOIND) {
            if !value.is_empty() {
                self.bitcoind = Some(PathBuf::from(value));
            }
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.timeout_factor.is_finite() && self.timeout_factor > 0.0,
            "timeout_factor must be positive, got {}",
            self.timeout_factor
        );
        anyhow::ensure!(self.wait.poll_interval_ms > 0, "poll_interval_ms cannot be zero");
        anyhow::ensure!(
            self.chain.halving_interval > 0,
            "halving_interval cannot be zero"
        );
        Ok(())
    }

    /// Wait settings with the timeout factor applied.
    pub fn wait_config(&self) -> WaitConfig {
        WaitConfig::new(Duration::from_millis(self.wait.timeout_ms))
            .with_poll_interval(Duration::from_millis(self.wait.poll_interval_ms))
            .scaled(self.timeout_factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regtest_common::config::COIN;

    #[test]
    fn test_defaults_match_regtest() {
        let config = HarnessConfig::default();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.chain.coinbase_maturity, 100);
        assert_eq!(config.chain.initial_subsidy, 50 * COIN);
        assert_eq!(config.wait_config().timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_partial_yaml() {
        let config = HarnessConfig::from_yaml_str(
            r#"
timeout_factor: 2
chain:
  coinbase_maturity: 10
daemon:
  relay_delay_ms: 25
"#,
        )
        .unwrap();
        assert_eq!(config.chain.coinbase_maturity, 10);
        // Unspecified chain fields keep their regtest values
        assert_eq!(config.chain.halving_interval, 150);
        assert_eq!(config.daemon.relay_delay(), Duration::from_millis(25));
        assert_eq!(config.wait_config().timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_invalid_timeout_factor() {
        assert!(HarnessConfig::from_yaml_str("timeout_factor: 0").is_err());
    }
}
