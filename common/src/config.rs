use serde::{Deserialize, Serialize};

// Satoshis per coin
pub const COIN: u64 = 100_000_000;

// Protocol version announced by the emulated peer
pub const PROTOCOL_VERSION: i32 = 70016;

pub const USER_AGENT: &str = "/regtest-harness:0.1.0/";

// Largest payload a node accepts in one message
pub const MAX_PROTOCOL_MESSAGE_LENGTH: usize = 4 * 1000 * 1000;

// Message header: magic (4) + command (12) + length (4) + checksum (4)
pub const MESSAGE_HEADER_SIZE: usize = 24;
pub const COMMAND_SIZE: usize = 12;

pub const NODE_NETWORK: u64 = 1 << 0;
pub const NODE_WITNESS: u64 = 1 << 3;

// Minimum relay fee of a default node, in satoshis per 1000 virtual bytes
pub const DEFAULT_MIN_RELAY_FEE_PER_KVB: u64 = 1_000;

// Below this value outputs are considered dust by a default node
pub const DUST_THRESHOLD: u64 = 546;

pub const WITNESS_SCALE_FACTOR: usize = 4;

// Smallest non-witness size a default node relays
pub const MIN_STANDARD_TX_NONWITNESS_SIZE: usize = 65;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl Network {
    pub fn magic(&self) -> [u8; 4] {
        match self {
            Network::Mainnet => [0xf9, 0xbe, 0xb4, 0xd9],
            Network::Testnet => [0x0b, 0x11, 0x09, 0x07],
            Network::Signet => [0x0a, 0x03, 0xcf, 0x40],
            Network::Regtest => [0xfa, 0xbf, 0xb5, 0xda],
        }
    }

    pub fn default_p2p_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Signet => 38333,
            Network::Regtest => 18444,
        }
    }

    pub fn default_rpc_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8332,
            Network::Testnet => 18332,
            Network::Signet => 38332,
            Network::Regtest => 18443,
        }
    }
}

impl Default for Network {
    fn default() -> Self {
        Network::Regtest
    }
}

/// Consensus parameters the harness needs to reason about balances.
///
/// These are properties of the target network and are deliberately
/// configuration rather than constants: the maturity threshold and the block
/// reward cannot be derived from the scenarios themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainParams {
    /// Confirmations a coinbase output needs before it can be spent
    pub coinbase_maturity: u64,
    /// Block reward of the first halving era, in satoshis
    pub initial_subsidy: u64,
    /// Blocks between two subsidy halvings
    pub halving_interval: u64,
}

impl ChainParams {
    pub fn regtest() -> Self {
        Self {
            coinbase_maturity: 100,
            initial_subsidy: 50 * COIN,
            halving_interval: 150,
        }
    }

    pub fn block_subsidy(&self, height: u64) -> u64 {
        let halvings = height / self.halving_interval.max(1);
        if halvings >= 64 {
            return 0;
        }
        self.initial_subsidy >> halvings
    }

    /// Whether a coinbase output created at `coin_height` may be spent by a
    /// transaction entering the mempool on top of `tip_height`.
    pub fn is_coinbase_spendable(&self, coin_height: u64, tip_height: u64) -> bool {
        (tip_height + 1).saturating_sub(coin_height) >= self.coinbase_maturity
    }

    /// Remaining blocks before a node wallet counts a coinbase output as
    /// mature. Node wallets wait one block longer than mempool acceptance.
    pub fn blocks_to_maturity(&self, coin_height: u64, tip_height: u64) -> u64 {
        let depth = (tip_height + 1).saturating_sub(coin_height);
        (self.coinbase_maturity + 1).saturating_sub(depth)
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::regtest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regtest_subsidy_halving() {
        let params = ChainParams::regtest();
        assert_eq!(params.block_subsidy(1), 50 * COIN);
        assert_eq!(params.block_subsidy(149), 50 * COIN);
        assert_eq!(params.block_subsidy(150), 25 * COIN);
        assert_eq!(params.block_subsidy(150 * 64), 0);
    }

    #[test]
    fn test_maturity_rules() {
        let params = ChainParams::regtest();
        // 101 blocks on top of genesis: only the first coinbase is mature for the wallet
        assert_eq!(params.blocks_to_maturity(1, 101), 0);
        assert_eq!(params.blocks_to_maturity(2, 101), 1);
        // Mempool acceptance is one block more permissive
        assert!(params.is_coinbase_spendable(2, 101));
        assert!(!params.is_coinbase_spendable(3, 101));
    }
}
