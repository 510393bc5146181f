use std::collections::BTreeMap;

use regtest_common::{config::ChainParams, crypto::Hash, transaction::OutPoint};

/// One output owned by a wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    /// Satoshis
    pub value: u64,
    pub script_pubkey: Vec<u8>,
    pub coinbase: bool,
    /// Confirmation height; `None` while the creating transaction is unconfirmed
    pub height: Option<u64>,
}

impl Utxo {
    pub fn is_confirmed(&self) -> bool {
        self.height.is_some()
    }

    /// Whether a transaction spending this output may enter the mempool on
    /// top of `tip_height`.
    pub fn is_spendable(&self, chain: &ChainParams, tip_height: u64) -> bool {
        if !self.coinbase {
            return true;
        }
        match self.height {
            Some(height) => chain.is_coinbase_spendable(height, tip_height),
            None => false,
        }
    }
}

/// Live outputs of a wallet keyed by outpoint.
///
/// Only the wallet mutates it: the mutators are crate-private and called
/// from `scan`, `scan_tx` and transaction construction.
#[derive(Debug, Clone, Default)]
pub struct UtxoSet {
    utxos: BTreeMap<OutPoint, Utxo>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.utxos.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.utxos.contains_key(outpoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Utxo> {
        self.utxos.values()
    }

    pub fn total(&self) -> u64 {
        self.utxos.values().map(|utxo| utxo.value).sum()
    }

    pub fn spendable<'a>(
        &'a self,
        chain: &'a ChainParams,
        tip_height: u64,
    ) -> impl Iterator<Item = &'a Utxo> + 'a {
        self.utxos
            .values()
            .filter(move |utxo| utxo.is_spendable(chain, tip_height))
    }

    /// Candidates for coin selection: largest value first, ties broken by
    /// ascending outpoint.
    pub fn selection_order(&self, chain: &ChainParams, tip_height: u64) -> Vec<Utxo> {
        let mut candidates: Vec<Utxo> = self.spendable(chain, tip_height).cloned().collect();
        candidates.sort_by(|a, b| b.value.cmp(&a.value).then(a.outpoint.cmp(&b.outpoint)));
        candidates
    }

    /// Outputs created by `txid`.
    pub fn created_by(&self, txid: &Hash) -> Vec<OutPoint> {
        self.utxos
            .keys()
            .filter(|outpoint| outpoint.txid == *txid)
            .copied()
            .collect()
    }

    pub(crate) fn insert(&mut self, utxo: Utxo) -> Option<Utxo> {
        self.utxos.insert(utxo.outpoint, utxo)
    }

    pub(crate) fn remove(&mut self, outpoint: &OutPoint) -> Option<Utxo> {
        self.utxos.remove(outpoint)
    }
}
