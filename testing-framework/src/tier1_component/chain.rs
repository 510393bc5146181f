use std::collections::{HashMap, HashSet};

use log::{debug, trace, warn};
use regtest_common::{
    block::{calculate_merkle_root, Block, BlockHeader, REGTEST_BITS},
    config::{
        ChainParams, DEFAULT_MIN_RELAY_FEE_PER_KVB, DUST_THRESHOLD,
        MIN_STANDARD_TX_NONWITNESS_SIZE,
    },
    crypto::{sha256, verify_signature, Hash, COMPRESSED_PUBLIC_KEY_SIZE},
    script::{op_return_script, push_data, push_int, OP_0, OP_CHECKSIG, OP_PUSHDATA1, OP_RETURN},
    time::get_current_time_in_seconds,
    transaction::{legacy_signature_hash, OutPoint, Transaction, TxIn, TxOut},
};
use thiserror::Error;

use super::mempool::{Mempool, MempoolTx, Rejection, ALREADY_IN_MEMPOOL};
use crate::tier2_integration::codes;

/// Header time of the genesis block.
pub const GENESIS_TIME: u32 = 1_296_688_602;
const GENESIS_NONCE: u32 = 2;
const BLOCK_VERSION: i32 = 0x2000_0000;

/// Unspent output of the active chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub output: TxOut,
    /// Height of the block that created it
    pub height: u64,
    pub coinbase: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    AlreadyKnown,
    /// Parent unknown; the block waits until `missing` arrives
    Orphan { missing: Hash },
    /// Stored on a branch that does not beat the active chain
    Stored { height: u64 },
    /// Part of the active chain, which now ends at `tip_height`
    Connected { tip_height: u64, disconnected: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("block {hash} rejected: {reason}")]
    InvalidBlock { hash: Hash, reason: String },
    #[error("unknown block {0}")]
    UnknownBlock(Hash),
}

struct BlockEntry {
    block: Block,
    height: u64,
    // Arrival order, first seen wins between branches of equal height
    sequence: u64,
}

/// Deterministic genesis block shared by every simulated node.
pub fn genesis_block(params: &ChainParams) -> Block {
    let mut script_sig = Vec::new();
    push_int(&mut script_sig, 0);
    push_data(&mut script_sig, b"regtest harness genesis");

    let mut input = TxIn::new(OutPoint::null());
    input.script_sig = script_sig;
    let mut coinbase = Transaction::new(
        vec![input],
        vec![TxOut::new(params.initial_subsidy, op_return_script(b"genesis"))],
    );
    coinbase.version = 1;

    let transactions = vec![coinbase];
    Block {
        header: BlockHeader {
            version: 1,
            prev_blockhash: Hash::zero(),
            merkle_root: calculate_merkle_root(&transactions),
            time: GENESIS_TIME,
            bits: REGTEST_BITS,
            nonce: GENESIS_NONCE,
        },
        transactions,
    }
}

/// In-memory regtest chain: block tree, active chain, UTXO set and mempool.
///
/// Validation is partial. Structure, value flow, coinbase
/// maturity, the relay policy used by tests and the two script forms the
/// harness spends (`p2wsh(OP_TRUE)` and pay-to-pubkey) are checked; other
/// scripts are accepted unexecuted and there is no proof of work.
///
/// # Example
///
/// ```rust
/// use regtest_common::{config::ChainParams, script::op_true_script};
/// use regtest_testing_framework::tier1_component::SimChain;
///
/// let mut chain = SimChain::new(ChainParams::regtest());
/// let block = chain.mine_block(&op_true_script(), 1_700_000_000).unwrap();
/// assert_eq!(chain.height(), 1);
/// assert_eq!(chain.tip(), block.hash());
/// ```
pub struct SimChain {
    params: ChainParams,
    min_relay_fee_per_kvb: u64,
    blocks: HashMap<Hash, BlockEntry>,
    invalid: HashSet<Hash>,
    orphans: HashMap<Hash, Block>,
    // Index is height
    active: Vec<Hash>,
    utxos: HashMap<OutPoint, Coin>,
    // Coins spent by each connected block, restored on disconnect
    undo: HashMap<Hash, Vec<(OutPoint, Coin)>>,
    mempool: Mempool,
    next_sequence: u64,
}

impl SimChain {
    pub fn new(params: ChainParams) -> Self {
        let genesis = genesis_block(&params);
        let hash = genesis.hash();
        let mut blocks = HashMap::new();
        blocks.insert(
            hash,
            BlockEntry {
                block: genesis,
                height: 0,
                sequence: 0,
            },
        );

        Self {
            params,
            min_relay_fee_per_kvb: DEFAULT_MIN_RELAY_FEE_PER_KVB,
            blocks,
            invalid: HashSet::new(),
            orphans: HashMap::new(),
            active: vec![hash],
            utxos: HashMap::new(),
            undo: HashMap::new(),
            mempool: Mempool::new(),
            next_sequence: 1,
        }
    }

    pub fn with_min_relay_fee(mut self, sat_per_kvb: u64) -> Self {
        self.min_relay_fee_per_kvb = sat_per_kvb;
        self
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn min_relay_fee_per_kvb(&self) -> u64 {
        self.min_relay_fee_per_kvb
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn height(&self) -> u64 {
        (self.active.len() - 1) as u64
    }

    pub fn tip(&self) -> Hash {
        self.active[self.active.len() - 1]
    }

    pub fn genesis_hash(&self) -> Hash {
        self.active[0]
    }

    pub fn block_hash_at(&self, height: u64) -> Option<Hash> {
        self.active.get(height as usize).copied()
    }

    pub fn get_block(&self, hash: &Hash) -> Option<&Block> {
        self.blocks.get(hash).map(|entry| &entry.block)
    }

    /// Height of any stored block, active or not.
    pub fn block_height(&self, hash: &Hash) -> Option<u64> {
        self.blocks.get(hash).map(|entry| entry.height)
    }

    pub fn is_active(&self, hash: &Hash) -> bool {
        match self.blocks.get(hash) {
            Some(entry) => self.active.get(entry.height as usize) == Some(hash),
            None => false,
        }
    }

    /// Whether the block is stored, waiting as an orphan, or known invalid.
    pub fn knows_block(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash) || self.orphans.contains_key(hash) || self.invalid.contains(hash)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn coin(&self, outpoint: &OutPoint) -> Option<&Coin> {
        self.utxos.get(outpoint)
    }

    pub fn coins(&self) -> impl Iterator<Item = (&OutPoint, &Coin)> {
        self.utxos.iter()
    }

    /// Unspent outputs paying to any of `scripts`, ordered by outpoint.
    pub fn scan_scripts(&self, scripts: &[Vec<u8>]) -> Vec<(OutPoint, Coin)> {
        let mut found: Vec<(OutPoint, Coin)> = self
            .utxos
            .iter()
            .filter(|(_, coin)| scripts.iter().any(|script| *script == coin.output.script_pubkey))
            .map(|(outpoint, coin)| (*outpoint, coin.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    /// Block locator of the active chain: the last ten hashes, then
    /// exponentially sparser back to genesis.
    pub fn locator(&self) -> Vec<Hash> {
        let mut hashes = Vec::new();
        let mut height = self.height() as i64;
        let mut step = 1;
        while height > 0 {
            hashes.push(self.active[height as usize]);
            if hashes.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        hashes.push(self.genesis_hash());
        hashes
    }

    /// Active chain hashes following the first locator entry we have on the
    /// active chain, up to `stop` (inclusive) or `limit` entries.
    pub fn hashes_after(&self, locator: &[Hash], stop: &Hash, limit: usize) -> Vec<Hash> {
        let fork = locator
            .iter()
            .find(|hash| self.is_active(hash))
            .and_then(|hash| self.block_height(hash))
            .unwrap_or(0);

        let mut hashes = Vec::new();
        for hash in self.active.iter().skip(fork as usize + 1) {
            hashes.push(*hash);
            if hash == stop || hashes.len() >= limit {
                break;
            }
        }
        hashes
    }

    pub fn headers_after(&self, locator: &[Hash], stop: &Hash, limit: usize) -> Vec<BlockHeader> {
        self.hashes_after(locator, stop, limit)
            .iter()
            .filter_map(|hash| self.get_block(hash).map(|block| block.header.clone()))
            .collect()
    }

    // ========================================================================
    // Mempool
    // ========================================================================

    /// Validate `tx` against the active chain and mempool and add it.
    ///
    /// # Errors
    ///
    /// The [`Rejection`] carries the code and reason a node reports for the
    /// first failed check. Resubmitting a transaction already in the pool
    /// fails with [`ALREADY_IN_MEMPOOL`].
    pub fn accept_transaction(&mut self, tx: Transaction, time: u64) -> Result<Hash, Rejection> {
        let txid = tx.txid();

        if tx.inputs.is_empty() {
            return Err(Rejection::rejected("bad-txns-vin-empty"));
        }
        if tx.outputs.is_empty() {
            return Err(Rejection::rejected("bad-txns-vout-empty"));
        }
        if tx.is_coinbase() {
            return Err(Rejection::rejected("coinbase"));
        }
        let mut seen = HashSet::with_capacity(tx.inputs.len());
        if !tx.inputs.iter().all(|input| seen.insert(input.previous_output)) {
            return Err(Rejection::rejected("bad-txns-inputs-duplicate"));
        }
        if tx.base_size() < MIN_STANDARD_TX_NONWITNESS_SIZE {
            return Err(Rejection::rejected("tx-size-small"));
        }
        if tx
            .outputs
            .iter()
            .any(|output| !is_unspendable(&output.script_pubkey) && output.value < DUST_THRESHOLD)
        {
            return Err(Rejection::rejected("dust"));
        }
        if self.mempool.contains(&txid) {
            return Err(Rejection::rejected(ALREADY_IN_MEMPOOL));
        }
        if tx.outpoints().any(|outpoint| self.utxos.contains_key(&outpoint)) {
            return Err(Rejection::new(
                codes::RPC_VERIFY_ALREADY_IN_CHAIN,
                "Transaction outputs already in utxo set",
            ));
        }

        let tip = self.height();
        let mut value_in = 0u64;
        for (index, input) in tx.inputs.iter().enumerate() {
            let outpoint = &input.previous_output;
            if self.mempool.spender(outpoint).is_some() {
                return Err(Rejection::rejected("txn-mempool-conflict"));
            }

            let output = if let Some(coin) = self.utxos.get(outpoint) {
                if coin.coinbase && !self.params.is_coinbase_spendable(coin.height, tip) {
                    return Err(Rejection::rejected(format!(
                        "bad-txns-premature-spend-of-coinbase, tried to spend coinbase at depth {}",
                        (tip + 1).saturating_sub(coin.height)
                    )));
                }
                &coin.output
            } else if let Some(output) = self.mempool.output(outpoint) {
                output
            } else {
                return Err(Rejection::new(
                    codes::RPC_VERIFY_ERROR,
                    "bad-txns-inputs-missingorspent",
                ));
            };

            verify_input_script(&tx, index, &output.script_pubkey).map_err(|reason| {
                Rejection::rejected(format!("mandatory-script-verify-flag-failed ({})", reason))
            })?;
            value_in += output.value;
        }

        let value_out = tx.output_value();
        let fee = match value_in.checked_sub(value_out) {
            Some(fee) => fee,
            None => {
                return Err(Rejection::rejected(format!(
                    "bad-txns-in-belowout, value in ({}) < value out ({})",
                    value_in, value_out
                )))
            }
        };
        let vsize = tx.vsize();
        let required = (vsize as u64 * self.min_relay_fee_per_kvb).div_ceil(1000);
        if fee < required {
            return Err(Rejection::rejected(format!(
                "min relay fee not met, {} < {}",
                fee, required
            )));
        }

        trace!("mempool accepted {} fee {} vsize {}", txid, fee, vsize);
        self.mempool.insert(MempoolTx {
            weight: tx.weight(),
            tx,
            txid,
            fee,
            vsize,
            time,
            height: tip,
        });
        Ok(txid)
    }

    // ========================================================================
    // Blocks
    // ========================================================================

    /// Build a block on the tip with every mempool transaction, pay its
    /// reward to `script_pubkey` and connect it.
    pub fn mine_block(&mut self, script_pubkey: &[u8], time: u32) -> Result<Block, ChainError> {
        let height = self.height() + 1;
        let tip = self.tip();
        let prev_time = self
            .blocks
            .get(&tip)
            .map(|entry| entry.block.header.time)
            .ok_or(ChainError::UnknownBlock(tip))?;

        let mut script_sig = Vec::new();
        push_int(&mut script_sig, height as i64);
        script_sig.push(OP_0);
        let mut input = TxIn::new(OutPoint::null());
        input.script_sig = script_sig;
        let reward = self.params.block_subsidy(height) + self.mempool.total_fee();
        let coinbase = Transaction::new(vec![input], vec![TxOut::new(reward, script_pubkey.to_vec())]);

        let mut transactions = vec![coinbase];
        transactions.extend(self.mempool.iter().map(|entry| entry.tx.clone()));

        let block = Block {
            header: BlockHeader {
                version: BLOCK_VERSION,
                prev_blockhash: tip,
                merkle_root: calculate_merkle_root(&transactions),
                time: time.max(prev_time),
                bits: REGTEST_BITS,
                nonce: 0,
            },
            transactions,
        };

        let hash = block.hash();
        match self.process_block(block.clone())? {
            BlockOutcome::Connected { .. } => Ok(block),
            other => Err(ChainError::InvalidBlock {
                hash,
                reason: format!("mined block not connected: {:?}", other),
            }),
        }
    }

    /// Store a block from anywhere and move the active chain to the best
    /// known branch. Orphans waiting on this block are adopted too.
    ///
    /// # Errors
    ///
    /// [`ChainError::InvalidBlock`] when the block fails structural checks
    /// or cannot be connected; the previous active chain is restored.
    pub fn process_block(&mut self, block: Block) -> Result<BlockOutcome, ChainError> {
        let hash = block.hash();
        if self.blocks.contains_key(&hash) || self.orphans.contains_key(&hash) {
            return Ok(BlockOutcome::AlreadyKnown);
        }
        if self.invalid.contains(&hash) {
            return Err(invalid_block(hash, "duplicate-invalid"));
        }
        check_block(&block).map_err(|reason| invalid_block(hash, reason))?;

        let prev = block.header.prev_blockhash;
        if self.invalid.contains(&prev) {
            self.invalid.insert(hash);
            return Err(invalid_block(hash, "bad-prevblk"));
        }
        let Some(parent_height) = self.blocks.get(&prev).map(|entry| entry.height) else {
            debug!("block {} is an orphan, waiting for {}", hash, prev);
            self.orphans.insert(hash, block);
            return Ok(BlockOutcome::Orphan { missing: prev });
        };

        let height = parent_height + 1;
        self.store(hash, block, height);
        self.adopt_orphans(hash);

        let (disconnected, failure) = self.activate_best_chain();
        if self.invalid.contains(&hash) {
            return Err(failure.unwrap_or_else(|| invalid_block(hash, "bad-prevblk")));
        }
        if self.is_active(&hash) {
            Ok(BlockOutcome::Connected {
                tip_height: self.height(),
                disconnected,
            })
        } else {
            Ok(BlockOutcome::Stored { height })
        }
    }

    fn store(&mut self, hash: Hash, block: Block, height: u64) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.blocks.insert(
            hash,
            BlockEntry {
                block,
                height,
                sequence,
            },
        );
    }

    fn adopt_orphans(&mut self, parent: Hash) {
        let mut queue = vec![parent];
        while let Some(parent) = queue.pop() {
            let Some(parent_height) = self.block_height(&parent) else {
                continue;
            };
            let children: Vec<Hash> = self
                .orphans
                .iter()
                .filter(|(_, block)| block.header.prev_blockhash == parent)
                .map(|(hash, _)| *hash)
                .collect();
            for child in children {
                if let Some(block) = self.orphans.remove(&child) {
                    debug!("adopting orphan {} at height {}", child, parent_height + 1);
                    self.store(child, block, parent_height + 1);
                    queue.push(child);
                }
            }
        }
    }

    // Highest valid block beating the active tip, earliest arrival on ties
    fn best_candidate(&self) -> Option<Hash> {
        let tip_height = self.height();
        self.blocks
            .iter()
            .filter(|(_, entry)| entry.height > tip_height)
            .max_by(|a, b| {
                a.1.height
                    .cmp(&b.1.height)
                    .then(b.1.sequence.cmp(&a.1.sequence))
            })
            .map(|(hash, _)| *hash)
    }

    fn activate_best_chain(&mut self) -> (usize, Option<ChainError>) {
        let mut disconnected = 0;
        let mut failure = None;
        while let Some(best) = self.best_candidate() {
            match self.reorganize_to(best) {
                Ok(count) => {
                    disconnected += count;
                    break;
                }
                Err((bad, reason)) => {
                    warn!("block {} failed to connect: {}", bad, reason);
                    self.mark_invalid(bad);
                    failure = Some(invalid_block(bad, reason));
                }
            }
        }
        (disconnected, failure)
    }

    // Drop `hash` and every stored descendant
    fn mark_invalid(&mut self, hash: Hash) {
        self.invalid.insert(hash);
        self.blocks.remove(&hash);
        loop {
            let descendants: Vec<Hash> = self
                .blocks
                .iter()
                .filter(|(_, entry)| self.invalid.contains(&entry.block.header.prev_blockhash))
                .map(|(hash, _)| *hash)
                .collect();
            if descendants.is_empty() {
                break;
            }
            for descendant in descendants {
                self.blocks.remove(&descendant);
                self.invalid.insert(descendant);
            }
        }
    }

    fn reorganize_to(&mut self, target: Hash) -> Result<usize, (Hash, String)> {
        let mut path = Vec::new();
        let mut cursor = target;
        let fork_height = loop {
            let entry = self
                .blocks
                .get(&cursor)
                .ok_or_else(|| (cursor, "missing ancestor".to_string()))?;
            if self.active.get(entry.height as usize) == Some(&cursor) {
                break entry.height;
            }
            path.push(cursor);
            cursor = entry.block.header.prev_blockhash;
        };
        path.reverse();

        let snapshot: Vec<MempoolTx> = self.mempool.iter().cloned().collect();
        let mut disconnected = Vec::new();
        while self.height() > fork_height {
            match self.disconnect_tip() {
                Some(hash) => disconnected.push(hash),
                None => break,
            }
        }
        disconnected.reverse();
        if !disconnected.is_empty() {
            debug!(
                "reorganizing: {} blocks disconnected back to height {}",
                disconnected.len(),
                fork_height
            );
        }

        for (connected, hash) in path.iter().enumerate() {
            if let Err(reason) = self.connect_block(*hash) {
                for _ in 0..connected {
                    self.disconnect_tip();
                }
                for old in &disconnected {
                    if let Err(reason) = self.connect_block(*old) {
                        warn!("failed to restore block {}: {}", old, reason);
                        break;
                    }
                }
                self.refill_mempool(Vec::new(), snapshot);
                return Err((*hash, reason));
            }
        }

        if !disconnected.is_empty() {
            let resurrected: Vec<Transaction> = disconnected
                .iter()
                .filter_map(|hash| self.get_block(hash))
                .flat_map(|block| block.transactions.iter().skip(1).cloned())
                .collect();
            self.refill_mempool(resurrected, snapshot);
        }
        Ok(disconnected.len())
    }

    // Re-accept transactions after the chain moved under the mempool
    fn refill_mempool(&mut self, resurrected: Vec<Transaction>, previous: Vec<MempoolTx>) {
        self.mempool.drain();
        let now = get_current_time_in_seconds();
        for tx in resurrected {
            if let Err(rejection) = self.accept_transaction(tx, now) {
                trace!("dropped disconnected transaction: {}", rejection);
            }
        }
        for entry in previous {
            match self.accept_transaction(entry.tx, entry.time) {
                Ok(_) => {}
                Err(rejection) if rejection.is_already_in_mempool() => {}
                Err(rejection) => trace!("dropped mempool transaction {}: {}", entry.txid, rejection),
            }
        }
    }

    fn disconnect_tip(&mut self) -> Option<Hash> {
        if self.active.len() <= 1 {
            return None;
        }
        let hash = self.active.pop()?;
        if let Some(entry) = self.blocks.get(&hash) {
            for tx in entry.block.transactions.iter().rev() {
                for outpoint in tx.outpoints() {
                    self.utxos.remove(&outpoint);
                }
            }
        }
        for (outpoint, coin) in self.undo.remove(&hash).unwrap_or_default() {
            self.utxos.insert(outpoint, coin);
        }
        Some(hash)
    }

    fn connect_block(&mut self, hash: Hash) -> Result<(), String> {
        let (block, height) = match self.blocks.get(&hash) {
            Some(entry) => (entry.block.clone(), entry.height),
            None => return Err("unknown block".to_string()),
        };
        if block.header.prev_blockhash != self.tip() {
            return Err("bad-prevblk".to_string());
        }

        let mut expected_height = Vec::new();
        push_int(&mut expected_height, height as i64);
        let coinbase = block.coinbase().ok_or("bad-cb-missing")?;
        if !coinbase.inputs[0].script_sig.starts_with(&expected_height) {
            return Err("bad-cb-height".to_string());
        }

        let tip = height - 1;
        let mut spent: Vec<(OutPoint, Coin)> = Vec::new();
        let mut spent_set: HashSet<OutPoint> = HashSet::new();
        let mut created: HashMap<OutPoint, Coin> = HashMap::new();
        let mut fees = 0u64;

        for (index, tx) in block.transactions.iter().enumerate() {
            if index > 0 {
                let mut value_in = 0u64;
                for (input_index, input) in tx.inputs.iter().enumerate() {
                    let outpoint = input.previous_output;
                    let coin = match created.remove(&outpoint) {
                        Some(coin) => coin,
                        None => {
                            let coin = self
                                .utxos
                                .get(&outpoint)
                                .filter(|_| spent_set.insert(outpoint))
                                .cloned()
                                .ok_or("bad-txns-inputs-missingorspent")?;
                            spent.push((outpoint, coin.clone()));
                            coin
                        }
                    };
                    if coin.coinbase && !self.params.is_coinbase_spendable(coin.height, tip) {
                        return Err("bad-txns-premature-spend-of-coinbase".to_string());
                    }
                    verify_input_script(tx, input_index, &coin.output.script_pubkey)?;
                    value_in += coin.output.value;
                }
                fees += value_in
                    .checked_sub(tx.output_value())
                    .ok_or("bad-txns-in-belowout")?;
            }

            for (outpoint, output) in tx.outpoints().zip(tx.outputs.iter()) {
                if is_unspendable(&output.script_pubkey) {
                    continue;
                }
                if self.utxos.contains_key(&outpoint) || created.contains_key(&outpoint) {
                    return Err("bad-txns-BIP30".to_string());
                }
                created.insert(
                    outpoint,
                    Coin {
                        output: output.clone(),
                        height,
                        coinbase: index == 0,
                    },
                );
            }
        }

        if coinbase.output_value() > self.params.block_subsidy(height) + fees {
            return Err("bad-cb-amount".to_string());
        }

        for (outpoint, _) in &spent {
            self.utxos.remove(outpoint);
        }
        self.utxos.extend(created);
        self.undo.insert(hash, spent);
        self.active.push(hash);
        let removed = self.mempool.remove_for_block(&block.transactions);
        if log::log_enabled!(log::Level::Trace) {
            trace!(
                "connected {} at height {}, {} txs, {} left the mempool",
                hash,
                height,
                block.transactions.len(),
                removed
            );
        }
        Ok(())
    }
}

fn invalid_block(hash: Hash, reason: impl Into<String>) -> ChainError {
    ChainError::InvalidBlock {
        hash,
        reason: reason.into(),
    }
}

fn check_block(block: &Block) -> Result<(), String> {
    let Some(first) = block.transactions.first() else {
        return Err("bad-blk-length".to_string());
    };
    if !first.is_coinbase() {
        return Err("bad-cb-missing".to_string());
    }
    if block.transactions.iter().skip(1).any(|tx| tx.is_coinbase()) {
        return Err("bad-cb-multiple".to_string());
    }
    if !(2..=100).contains(&first.inputs[0].script_sig.len()) {
        return Err("bad-cb-length".to_string());
    }
    if !block.check_merkle_root() {
        return Err("bad-txnmrklroot".to_string());
    }
    Ok(())
}

fn is_unspendable(script_pubkey: &[u8]) -> bool {
    script_pubkey.first() == Some(&OP_RETURN)
}

fn is_p2wsh(script_pubkey: &[u8]) -> bool {
    script_pubkey.len() == 34 && script_pubkey[0] == OP_0 && script_pubkey[1] == 0x20
}

fn p2pk_public_key(script_pubkey: &[u8]) -> Option<&[u8]> {
    let size = COMPRESSED_PUBLIC_KEY_SIZE;
    if script_pubkey.len() == size + 2
        && script_pubkey[0] as usize == size
        && script_pubkey[size + 1] == OP_CHECKSIG
    {
        Some(&script_pubkey[1..=size])
    } else {
        None
    }
}

// Data of a script consisting of exactly one push
fn single_push(script: &[u8]) -> Option<&[u8]> {
    match script.first().copied()? {
        len @ 1..=0x4b if script.len() == len as usize + 1 => Some(&script[1..]),
        OP_PUSHDATA1 if script.len() >= 2 && script.len() == script[1] as usize + 2 => {
            Some(&script[2..])
        }
        _ => None,
    }
}

fn verify_input_script(tx: &Transaction, index: usize, script_pubkey: &[u8]) -> Result<(), String> {
    let input = tx.inputs.get(index).ok_or("input index out of range")?;

    if is_p2wsh(script_pubkey) {
        if !input.script_sig.is_empty() {
            return Err("Witness requires empty scriptSig".to_string());
        }
        let witness_script = input
            .witness
            .last()
            .ok_or("Witness program was passed an empty witness")?;
        if sha256(witness_script)[..] != script_pubkey[2..] {
            return Err("Witness program hash mismatch".to_string());
        }
        return Ok(());
    }

    if !input.witness.is_empty() {
        return Err("Witness provided for non-witness script".to_string());
    }

    if let Some(public_key) = p2pk_public_key(script_pubkey) {
        let signature = single_push(&input.script_sig)
            .filter(|signature| !signature.is_empty())
            .ok_or("Operation not valid with the current stack size")?;
        let sighash_type = signature[signature.len() - 1];
        let sighash = legacy_signature_hash(tx, index, script_pubkey, sighash_type)
            .ok_or("input index out of range")?;
        return match verify_signature(public_key, &sighash, signature) {
            Ok(true) => Ok(()),
            _ => Err("Signature must be zero for failed CHECK(MULTI)SIG operation".to_string()),
        };
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use regtest_common::config::COIN;
    use regtest_common::crypto::{KeyPair, SIGHASH_ALL};
    use regtest_common::script::{op_true_script, p2pk_script, p2wsh_script, tagged_op_true_script};

    const TIME: u32 = 1_700_000_000;

    fn mined_chain(blocks: u64, script: &[u8]) -> SimChain {
        let mut chain = SimChain::new(ChainParams::regtest());
        for i in 0..blocks {
            chain.mine_block(script, TIME + i as u32).unwrap();
        }
        chain
    }

    fn coinbase_outpoint(chain: &SimChain, height: u64) -> OutPoint {
        let hash = chain.block_hash_at(height).unwrap();
        let coinbase = chain.get_block(&hash).unwrap().coinbase().unwrap();
        OutPoint::new(coinbase.txid(), 0)
    }

    fn spend_p2wsh(outpoint: OutPoint, value: u64) -> Transaction {
        let mut input = TxIn::new(outpoint);
        input.witness = vec![op_true_script()];
        Transaction::new(vec![input], vec![TxOut::new(value, p2wsh_script(&op_true_script()))])
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let a = SimChain::new(ChainParams::regtest());
        let b = SimChain::new(ChainParams::regtest());
        assert_eq!(a.tip(), b.tip());
        assert_eq!(a.height(), 0);
        // The genesis reward is not spendable
        assert_eq!(a.coins().count(), 0);
    }

    #[test]
    fn test_mining_pays_subsidy_and_updates_utxos() {
        let script = p2wsh_script(&op_true_script());
        let chain = mined_chain(3, &script);
        assert_eq!(chain.height(), 3);
        let found = chain.scan_scripts(&[script]);
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|(_, coin)| coin.coinbase && coin.output.value == 50 * COIN));
    }

    #[test]
    fn test_coinbase_maturity_boundary() {
        let script = p2wsh_script(&op_true_script());
        let mut chain = mined_chain(100, &script);
        let first = coinbase_outpoint(&chain, 1);

        // Depth 100 at tip 100 is enough for the mempool
        let tx = spend_p2wsh(first, 50 * COIN - 10_000);
        assert!(chain.accept_transaction(tx, 0).is_ok());

        let second = coinbase_outpoint(&chain, 2);
        let err = chain
            .accept_transaction(spend_p2wsh(second, 50 * COIN - 10_000), 0)
            .unwrap_err();
        assert_eq!(
            err.reason,
            "bad-txns-premature-spend-of-coinbase, tried to spend coinbase at depth 99"
        );
    }

    #[test]
    fn test_mempool_policy_rejections() {
        let script = p2wsh_script(&op_true_script());
        let mut chain = mined_chain(101, &script);
        let coin = coinbase_outpoint(&chain, 1);

        let dust = spend_p2wsh(coin, 100);
        assert_eq!(chain.accept_transaction(dust, 0).unwrap_err().reason, "dust");

        let too_much = spend_p2wsh(coin, 51 * COIN);
        assert!(chain
            .accept_transaction(too_much, 0)
            .unwrap_err()
            .reason
            .starts_with("bad-txns-in-belowout"));

        // At 1000 sat/kvB the required fee equals the vsize
        let no_fee = spend_p2wsh(coin, 50 * COIN);
        let vsize = no_fee.vsize();
        assert_eq!(
            chain.accept_transaction(no_fee, 0).unwrap_err().reason,
            format!("min relay fee not met, 0 < {}", vsize)
        );

        let mut bad_witness = spend_p2wsh(coin, COIN);
        bad_witness.inputs[0].witness = vec![vec![0x52]];
        assert!(chain
            .accept_transaction(bad_witness, 0)
            .unwrap_err()
            .reason
            .starts_with("mandatory-script-verify-flag-failed"));

        let good = spend_p2wsh(coin, COIN);
        let txid = chain.accept_transaction(good.clone(), 0).unwrap();
        assert!(chain.accept_transaction(good, 0).unwrap_err().is_already_in_mempool());

        let conflict = spend_p2wsh(coin, 2 * COIN);
        assert_eq!(
            chain.accept_transaction(conflict, 0).unwrap_err().reason,
            "txn-mempool-conflict"
        );

        let missing = spend_p2wsh(OutPoint::new(Hash::zero(), 7), COIN);
        let err = chain.accept_transaction(missing, 0).unwrap_err();
        assert_eq!(err.code, codes::RPC_VERIFY_ERROR);
        assert_eq!(chain.mempool().txids(), vec![txid]);
    }

    #[test]
    fn test_chained_mempool_spend_then_confirm() {
        let script = p2wsh_script(&op_true_script());
        let mut chain = mined_chain(101, &script);
        let parent = spend_p2wsh(coinbase_outpoint(&chain, 1), 49 * COIN);
        let parent_txid = chain.accept_transaction(parent, 0).unwrap();
        let child = spend_p2wsh(OutPoint::new(parent_txid, 0), 48 * COIN);
        let child_txid = chain.accept_transaction(child, 0).unwrap();
        assert_eq!(chain.mempool().depends(&child_txid), vec![parent_txid]);

        let miner = tagged_op_true_script(b"miner");
        let block = chain.mine_block(&miner, TIME + 500).unwrap();
        assert_eq!(block.transactions.len(), 3);
        assert!(chain.mempool().is_empty());
        // Subsidy plus both fees
        assert_eq!(block.transactions[0].outputs[0].value, 52 * COIN);
        assert!(chain.coin(&OutPoint::new(child_txid, 0)).is_some());
        assert!(chain.coin(&OutPoint::new(parent_txid, 0)).is_none());
    }

    #[test]
    fn test_p2pk_spend_requires_valid_signature() {
        let key = KeyPair::new();
        let script = p2pk_script(&key.public_key_bytes());
        let mut chain = mined_chain(101, &script);
        let coin = coinbase_outpoint(&chain, 1);

        let mut tx = Transaction::new(vec![TxIn::new(coin)], vec![TxOut::new(COIN, script.clone())]);
        let sighash = legacy_signature_hash(&tx, 0, &script, SIGHASH_ALL).unwrap();
        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &KeyPair::new().sign(&sighash, SIGHASH_ALL));
        tx.inputs[0].script_sig = script_sig;
        assert!(chain.accept_transaction(tx.clone(), 0).is_err());

        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &key.sign(&sighash, SIGHASH_ALL));
        tx.inputs[0].script_sig = script_sig;
        assert!(chain.accept_transaction(tx, 0).is_ok());
    }

    #[test]
    fn test_longer_branch_reorganizes_and_resurrects_transactions() {
        let script = p2wsh_script(&op_true_script());
        let mut a = mined_chain(101, &script);
        let mut b = SimChain::new(ChainParams::regtest());
        for height in 1..=101 {
            let hash = a.block_hash_at(height).unwrap();
            b.process_block(a.get_block(&hash).unwrap().clone()).unwrap();
        }
        assert_eq!(a.tip(), b.tip());

        // `a` confirms a spend in one block; `b` builds two empty blocks
        let spend = spend_p2wsh(coinbase_outpoint(&a, 1), 49 * COIN);
        let txid = a.accept_transaction(spend, 0).unwrap();
        a.mine_block(&tagged_op_true_script(b"a"), TIME + 200).unwrap();
        let b1 = b.mine_block(&tagged_op_true_script(b"b"), TIME + 200).unwrap();
        let b2 = b.mine_block(&tagged_op_true_script(b"b"), TIME + 201).unwrap();

        assert_eq!(
            a.process_block(b1).unwrap(),
            BlockOutcome::Stored { height: 102 }
        );
        assert_eq!(
            a.process_block(b2.clone()).unwrap(),
            BlockOutcome::Connected {
                tip_height: 103,
                disconnected: 1
            }
        );
        assert_eq!(a.tip(), b2.hash());
        assert!(a.coin(&OutPoint::new(txid, 0)).is_none());
        assert_eq!(a.mempool().txids(), vec![txid]);
    }

    #[test]
    fn test_orphan_is_adopted_when_parent_arrives() {
        let script = tagged_op_true_script(b"x");
        let source = mined_chain(2, &script);
        let first = source.get_block(&source.block_hash_at(1).unwrap()).unwrap().clone();
        let second = source.get_block(&source.block_hash_at(2).unwrap()).unwrap().clone();

        let mut chain = SimChain::new(ChainParams::regtest());
        assert_eq!(
            chain.process_block(second.clone()).unwrap(),
            BlockOutcome::Orphan {
                missing: first.hash()
            }
        );
        assert_eq!(chain.orphan_count(), 1);
        chain.process_block(first).unwrap();
        assert_eq!(chain.tip(), second.hash());
        assert_eq!(chain.orphan_count(), 0);
    }

    #[test]
    fn test_invalid_block_is_refused() {
        let script = tagged_op_true_script(b"x");
        let mut source = mined_chain(1, &script);
        let mut block = source.mine_block(&script, TIME + 10).unwrap();
        block.transactions[0].outputs[0].value += 1;
        block.header.merkle_root = calculate_merkle_root(&block.transactions);

        let mut chain = SimChain::new(ChainParams::regtest());
        chain
            .process_block(source.get_block(&source.block_hash_at(1).unwrap()).unwrap().clone())
            .unwrap();
        let err = chain.process_block(block).unwrap_err();
        assert!(matches!(err, ChainError::InvalidBlock { ref reason, .. } if reason == "bad-cb-amount"));
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn test_locator_and_hashes_after() {
        let chain = mined_chain(30, &tagged_op_true_script(b"x"));
        let locator = chain.locator();
        assert_eq!(locator[0], chain.tip());
        assert_eq!(*locator.last().unwrap(), chain.genesis_hash());
        assert!(locator.len() < 20);

        let from_genesis = chain.hashes_after(&[chain.genesis_hash()], &Hash::zero(), 500);
        assert_eq!(from_genesis.len(), 30);
        let limited = chain.hashes_after(&[chain.genesis_hash()], &Hash::zero(), 5);
        assert_eq!(limited.last(), chain.block_hash_at(5).as_ref());
        let stopped = chain.hashes_after(&[chain.genesis_hash()], &chain.block_hash_at(3).unwrap(), 500);
        assert_eq!(stopped.len(), 3);
    }
}
