//! TestDaemonBuilder - Fluent API for configuring TestDaemon instances

use super::test_daemon::TestDaemon;
use crate::orchestrator::{Clock, DaemonSettings, HarnessConfig, SystemClock};
use crate::tier1_component::{SimChain, GENESIS_TIME};
use anyhow::{Context, Result};
use log::debug;
use regtest_common::{
    config::{ChainParams, Network},
    p2p::MessageCodec,
    script::{op_true_script, p2wsh_script},
};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::time::Duration;

/// Spacing of the timestamps of pre-mined cache blocks
const CACHE_BLOCK_INTERVAL: u32 = 600;

/// Builder for TestDaemon instances with fluent API
///
/// # Example
///
/// ```rust,no_run
/// use regtest_testing_framework::tier2_integration::TestDaemonBuilder;
///
/// # async fn run() -> anyhow::Result<()> {
/// let daemon = TestDaemonBuilder::new()
///     .with_name("node0")
///     .with_cached_blocks(200)
///     .build()
///     .await?;
/// assert_eq!(daemon.height(), 200);
/// # Ok(())
/// # }
/// ```
pub struct TestDaemonBuilder {
    name: String,
    network: Network,
    chain_params: ChainParams,
    settings: DaemonSettings,
    /// Clock implementation for relay delays
    clock: Option<Arc<dyn Clock>>,
    bind: SocketAddr,
    cached_blocks: u64,
    /// Coinbase script of the cached blocks
    cache_script: Vec<u8>,
}

impl TestDaemonBuilder {
    /// Create new builder with defaults
    ///
    /// Default configuration:
    /// - SystemClock (real time)
    /// - regtest network and chain parameters
    /// - an ephemeral port on localhost
    /// - no cached blocks, the daemon starts at genesis
    pub fn new() -> Self {
        Self {
            name: "node".to_string(),
            network: Network::Regtest,
            chain_params: ChainParams::regtest(),
            settings: DaemonSettings::default(),
            clock: None,
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            cached_blocks: 0,
            cache_script: p2wsh_script(&op_true_script()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Take network, chain parameters and daemon settings from `config`.
    pub fn with_config(mut self, config: &HarnessConfig) -> Self {
        self.network = config.network;
        self.chain_params = config.chain.clone();
        self.settings = config.daemon.clone();
        self
    }

    pub fn with_chain_params(mut self, chain_params: ChainParams) -> Self {
        self.chain_params = chain_params;
        self
    }

    /// Hold every announcement to peers back by `delay`.
    pub fn with_relay_delay(mut self, delay: Duration) -> Self {
        self.settings.relay_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_min_relay_fee(mut self, sat_per_kvb: u64) -> Self {
        self.settings.min_relay_fee_per_kvb = sat_per_kvb;
        self
    }

    /// Set clock implementation
    ///
    /// If not set, uses `SystemClock` by default.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_bind_address(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Start from a chain of `count` pre-mined blocks.
    ///
    /// The cache is deterministic: fixed timestamps and coinbase script, so
    /// daemons built with the same count share an identical chain and can
    /// be connected without a sync. The coinbase outputs pay the default
    /// `MiniWallet` script unless [`TestDaemonBuilder::with_cache_script`]
    /// says otherwise.
    pub fn with_cached_blocks(mut self, count: u64) -> Self {
        self.cached_blocks = count;
        self
    }

    pub fn with_cache_script(mut self, script_pubkey: Vec<u8>) -> Self {
        self.cache_script = script_pubkey;
        self
    }

    /// Build the TestDaemon instance
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Mining the cached chain fails
    /// - The listener cannot bind
    pub async fn build(self) -> Result<TestDaemon> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let mut chain = SimChain::new(self.chain_params)
            .with_min_relay_fee(self.settings.min_relay_fee_per_kvb);
        for i in 1..=self.cached_blocks {
            let time = GENESIS_TIME + CACHE_BLOCK_INTERVAL * i as u32;
            chain
                .mine_block(&self.cache_script, time)
                .with_context(|| format!("mining cached block {}", i))?;
        }
        if self.cached_blocks > 0 {
            debug!("{}: {} cached blocks, tip {}", self.name, self.cached_blocks, chain.tip());
        }

        let codec = MessageCodec::new(self.network.magic());
        TestDaemon::spawn(self.name, self.bind, codec, chain, self.settings, clock)
            .await
            .with_context(|| format!("binding daemon listener on {}", self.bind))
    }
}

impl Default for TestDaemonBuilder {
    fn default() -> Self {
        Self::new()
    }
}
