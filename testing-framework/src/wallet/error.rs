use thiserror::Error;

use crate::p2p::PeerError;
use crate::tier2_integration::RpcError;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("insufficient funds: need {needed} sat, {available} sat spendable")]
    InsufficientFunds { needed: u64, available: u64 },
    /// The node refused the transaction; code and reason are the node's own
    #[error("transaction rejected ({code}): {reason}")]
    Rejected { code: i64, reason: String },
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("signing failed: {0}")]
    Signing(String),
}

impl WalletError {
    /// Rejection reason reported by the node, if any.
    pub fn reject_reason(&self) -> Option<&str> {
        match self {
            WalletError::Rejected { reason, .. } => Some(reason),
            _ => None,
        }
    }
}
