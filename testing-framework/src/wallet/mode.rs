use regtest_common::{
    crypto::KeyPair,
    script::{op_true_script, p2pk_script, p2wsh_script},
};
use serde::{Deserialize, Serialize};

/// Which script a wallet receives to and how it spends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WalletMode {
    /// Segwit v0 script hash of `OP_TRUE`; spent with the witness `[OP_TRUE]`
    #[default]
    AddressOpTrue,
    /// Bare `OP_TRUE`; spent with a script_sig of no-ops
    RawOpTrue,
    /// Pay-to-pubkey under a single key; spent with a legacy signature
    RawP2pk,
}

impl WalletMode {
    pub fn needs_key(&self) -> bool {
        matches!(self, WalletMode::RawP2pk)
    }

    /// Locking script of this mode. Only `RawP2pk` uses `key`.
    pub fn script_pubkey(&self, key: &KeyPair) -> Vec<u8> {
        match self {
            WalletMode::AddressOpTrue => p2wsh_script(&op_true_script()),
            WalletMode::RawOpTrue => op_true_script(),
            WalletMode::RawP2pk => p2pk_script(&key.public_key_bytes()),
        }
    }
}
