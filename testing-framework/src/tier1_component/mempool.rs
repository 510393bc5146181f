use std::collections::HashMap;

use indexmap::IndexMap;
use regtest_common::{
    crypto::Hash,
    transaction::{OutPoint, Transaction, TxOut},
};
use thiserror::Error;

use crate::tier2_integration::{codes, RpcError};

/// Reason reported when a transaction is already in the mempool. Callers
/// submitting over RPC treat it as success.
pub const ALREADY_IN_MEMPOOL: &str = "txn-already-in-mempool";

/// A node refusing a request, with the RPC code and reason it reports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} (code {code})")]
pub struct Rejection {
    pub code: i64,
    pub reason: String,
}

impl Rejection {
    pub fn new(code: i64, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Policy or consensus refusal of a transaction.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::new(codes::RPC_VERIFY_REJECTED, reason)
    }

    pub fn is_already_in_mempool(&self) -> bool {
        self.reason == ALREADY_IN_MEMPOOL
    }
}

impl From<Rejection> for RpcError {
    fn from(rejection: Rejection) -> Self {
        RpcError::rpc(rejection.code, rejection.reason)
    }
}

/// Transaction accepted into the mempool.
#[derive(Debug, Clone)]
pub struct MempoolTx {
    pub tx: Transaction,
    pub txid: Hash,
    /// Satoshis
    pub fee: u64,
    pub vsize: usize,
    pub weight: usize,
    /// Entry time in seconds
    pub time: u64,
    /// Chain height when the transaction entered
    pub height: u64,
}

/// Unconfirmed transactions in arrival order.
///
/// Arrival order doubles as a valid block order: a transaction is only
/// accepted after every mempool parent it spends.
#[derive(Debug, Default)]
pub struct Mempool {
    entries: IndexMap<Hash, MempoolTx>,
    // outpoint -> txid of the mempool transaction spending it
    spends: HashMap<OutPoint, Hash>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash) -> Option<&MempoolTx> {
        self.entries.get(txid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MempoolTx> {
        self.entries.values()
    }

    pub fn txids(&self) -> Vec<Hash> {
        self.entries.keys().copied().collect()
    }

    /// Total fee of every entry.
    pub fn total_fee(&self) -> u64 {
        self.entries.values().map(|entry| entry.fee).sum()
    }

    /// Mempool transaction spending `outpoint`, if any.
    pub fn spender(&self, outpoint: &OutPoint) -> Option<&Hash> {
        self.spends.get(outpoint)
    }

    /// Output created by a mempool transaction.
    pub fn output(&self, outpoint: &OutPoint) -> Option<&TxOut> {
        self.entries
            .get(&outpoint.txid)
            .and_then(|entry| entry.tx.outputs.get(outpoint.vout as usize))
    }

    /// Mempool parents of `txid`.
    pub fn depends(&self, txid: &Hash) -> Vec<Hash> {
        let Some(entry) = self.entries.get(txid) else {
            return Vec::new();
        };
        let mut parents: Vec<Hash> = Vec::new();
        for input in &entry.tx.inputs {
            let parent = input.previous_output.txid;
            if self.entries.contains_key(&parent) && !parents.contains(&parent) {
                parents.push(parent);
            }
        }
        parents
    }

    pub(crate) fn insert(&mut self, entry: MempoolTx) {
        for outpoint in entry.tx.spent_outpoints() {
            self.spends.insert(outpoint, entry.txid);
        }
        self.entries.insert(entry.txid, entry);
    }

    /// Remove `txid` and every mempool descendant of it.
    pub(crate) fn remove_recursive(&mut self, txid: &Hash) -> Vec<MempoolTx> {
        let mut removed = Vec::new();
        let mut queue = vec![*txid];
        while let Some(next) = queue.pop() {
            let Some(entry) = self.entries.shift_remove(&next) else {
                continue;
            };
            for outpoint in entry.tx.spent_outpoints() {
                self.spends.remove(&outpoint);
            }
            for vout in 0..entry.tx.outputs.len() {
                if let Some(child) = self.spends.get(&OutPoint::new(next, vout as u32)) {
                    queue.push(*child);
                }
            }
            removed.push(entry);
        }
        removed
    }

    /// Drop the transactions confirmed by a block and everything that
    /// conflicts with them.
    pub(crate) fn remove_for_block(&mut self, transactions: &[Transaction]) -> usize {
        let mut removed = 0;
        for tx in transactions {
            let txid = tx.txid();
            if let Some(entry) = self.entries.shift_remove(&txid) {
                for outpoint in entry.tx.spent_outpoints() {
                    self.spends.remove(&outpoint);
                }
                removed += 1;
            }
            for outpoint in tx.spent_outpoints() {
                if let Some(conflict) = self.spends.get(&outpoint).copied() {
                    removed += self.remove_recursive(&conflict).len();
                }
            }
        }
        removed
    }

    /// Empty the pool, returning entries in arrival order.
    pub(crate) fn drain(&mut self) -> Vec<MempoolTx> {
        self.spends.clear();
        self.entries.drain(..).map(|(_, entry)| entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regtest_common::crypto::sha256d;
    use regtest_common::transaction::TxIn;

    fn entry(inputs: &[OutPoint], outputs: usize) -> MempoolTx {
        let tx = Transaction::new(
            inputs.iter().map(|outpoint| TxIn::new(*outpoint)).collect(),
            (0..outputs).map(|i| TxOut::new(1_000 + i as u64, vec![0x51])).collect(),
        );
        MempoolTx {
            txid: tx.txid(),
            fee: 100,
            vsize: tx.vsize(),
            weight: tx.weight(),
            time: 0,
            height: 0,
            tx,
        }
    }

    #[test]
    fn test_remove_recursive_takes_descendants() {
        let mut pool = Mempool::new();
        let parent = entry(&[OutPoint::new(sha256d(b"coin"), 0)], 2);
        let child = entry(&[OutPoint::new(parent.txid, 0)], 1);
        let grandchild = entry(&[OutPoint::new(child.txid, 0)], 1);
        let unrelated = entry(&[OutPoint::new(sha256d(b"other"), 0)], 1);
        for e in [parent.clone(), child.clone(), grandchild.clone(), unrelated.clone()] {
            pool.insert(e);
        }
        assert_eq!(pool.depends(&child.txid), vec![parent.txid]);

        let removed = pool.remove_recursive(&parent.txid);
        assert_eq!(removed.len(), 3);
        assert_eq!(pool.txids(), vec![unrelated.txid]);
        assert!(pool.spender(&OutPoint::new(parent.txid, 0)).is_none());
    }

    #[test]
    fn test_spend_index_tracks_inputs() {
        let mut pool = Mempool::new();
        let coin = OutPoint::new(sha256d(b"coin"), 0);
        let parent = entry(&[coin], 2);
        pool.insert(parent.clone());

        assert_eq!(pool.spender(&coin), Some(&parent.txid));
        // Outputs of a mempool transaction are unspent until a child arrives
        assert!(pool.spender(&OutPoint::new(parent.txid, 0)).is_none());
        assert!(pool.spender(&OutPoint::new(parent.txid, 1)).is_none());

        let child = entry(&[OutPoint::new(parent.txid, 1)], 1);
        pool.insert(child.clone());
        assert_eq!(pool.spender(&OutPoint::new(parent.txid, 1)), Some(&child.txid));

        pool.remove_recursive(&child.txid);
        assert!(pool.spender(&OutPoint::new(parent.txid, 1)).is_none());
        assert_eq!(pool.spender(&coin), Some(&parent.txid));
    }

    #[test]
    fn test_block_removes_conflicts() {
        let mut pool = Mempool::new();
        let coin = OutPoint::new(sha256d(b"coin"), 0);
        let ours = entry(&[coin], 1);
        pool.insert(ours.clone());

        // A different spend of the same coin confirms
        let theirs = entry(&[coin], 2);
        assert_eq!(pool.remove_for_block(&[theirs.tx]), 1);
        assert!(pool.is_empty());
        assert!(pool.spender(&coin).is_none());
    }

    #[test]
    fn test_rejection_maps_to_rpc_error() {
        let err: RpcError = Rejection::rejected("dust").into();
        assert_eq!(err.code(), Some(codes::RPC_VERIFY_REJECTED));
        assert_eq!(err.message(), Some("dust"));
    }
}
