//! Minimal wallet.
//!
//! Tracks its own outputs independently of any node wallet: it learns about
//! confirmed outputs through `scantxoutset` on its descriptor, follows its
//! own unconfirmed transactions, and builds and signs transactions for one
//! script. Used to create mempool load and to fund scenarios without
//! depending on the node's wallet.

mod error;
mod fee;
mod mode;
mod utxo;

pub use error::WalletError;
pub use fee::{FeePolicy, DEFAULT_FEE_RATE_PER_KVB};
pub use mode::WalletMode;
pub use utxo::{Utxo, UtxoSet};

use std::collections::{BTreeMap, HashSet};

use log::{debug, trace};
use regtest_common::{
    config::{ChainParams, DUST_THRESHOLD, MIN_STANDARD_TX_NONWITNESS_SIZE},
    crypto::{Hash, KeyPair, SIGHASH_ALL},
    descriptor::RawDescriptor,
    p2p::NetworkMessage,
    script::{op_true_script, push_data, OP_NOP},
    transaction::{legacy_signature_hash, OutPoint, Transaction, TxIn, TxOut},
};

use crate::p2p::PeerConnection;
use crate::tier2_integration::{NodeRpc, RpcError};

// Signature sizes vary by a byte, which can move a rate fee by a satoshi
const MAX_FEE_ITERATIONS: usize = 8;

#[derive(Debug, Clone)]
struct PendingSpend {
    spending_txid: Hash,
    utxo: Utxo,
}

/// Wallet over a single anyone-can-spend or single-key script.
///
/// # Example
///
/// ```rust,no_run
/// use regtest_testing_framework::tier2_integration::NodeRpc;
/// use regtest_testing_framework::wallet::{FeePolicy, MiniWallet, WalletMode};
///
/// # async fn run(node: &dyn NodeRpc) -> anyhow::Result<()> {
/// let mut wallet = MiniWallet::new(WalletMode::AddressOpTrue);
/// wallet.generate(node, 101).await?;
/// let txid = wallet.send_self_transfer(node, FeePolicy::default()).await?;
/// assert!(node.get_raw_mempool().await?.contains(&txid));
/// # Ok(())
/// # }
/// ```
pub struct MiniWallet {
    mode: WalletMode,
    key: KeyPair,
    script_pubkey: Vec<u8>,
    descriptor: String,
    chain: ChainParams,
    utxos: UtxoSet,
    pending_spends: BTreeMap<OutPoint, PendingSpend>,
    tip_height: u64,
}

impl MiniWallet {
    pub fn new(mode: WalletMode) -> Self {
        Self::with_key(mode, KeyPair::new())
    }

    /// Wallet whose `RawP2pk` script is bound to `key`.
    pub fn with_key(mode: WalletMode, key: KeyPair) -> Self {
        let script_pubkey = mode.script_pubkey(&key);
        let descriptor = RawDescriptor::new(script_pubkey.clone()).to_string_with_checksum();
        Self {
            mode,
            key,
            script_pubkey,
            descriptor,
            chain: ChainParams::regtest(),
            utxos: UtxoSet::new(),
            pending_spends: BTreeMap::new(),
            tip_height: 0,
        }
    }

    pub fn with_chain_params(mut self, chain: ChainParams) -> Self {
        self.chain = chain;
        self
    }

    pub fn mode(&self) -> WalletMode {
        self.mode
    }

    pub fn script_pubkey(&self) -> &[u8] {
        &self.script_pubkey
    }

    /// `raw(<script hex>)#<checksum>`, as accepted by `scantxoutset` and
    /// `generatetodescriptor`.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn utxos(&self) -> &UtxoSet {
        &self.utxos
    }

    /// Height of the tip at the last scan.
    pub fn tip_height(&self) -> u64 {
        self.tip_height
    }

    /// Sum of outputs a transaction could spend right now.
    pub fn get_balance(&self) -> u64 {
        self.utxos
            .spendable(&self.chain, self.tip_height)
            .map(|utxo| utxo.value)
            .sum()
    }

    /// Sum of every tracked output, immature coinbase included.
    pub fn get_total_balance(&self) -> u64 {
        self.utxos.total()
    }

    // ========================================================================
    // Synchronisation with a node
    // ========================================================================

    /// Refresh the output set from `node`.
    ///
    /// Confirmed outputs are exactly what the node's UTXO scan reports, so
    /// outputs invalidated by a reorg disappear here without notice. Our own
    /// unconfirmed outputs survive while their transaction is in the
    /// mempool, and outputs we spent stay hidden while the spending
    /// transaction is.
    pub async fn scan(&mut self, node: &dyn NodeRpc) -> Result<(), WalletError> {
        let result = node.scan_tx_out_set(&[self.descriptor.clone()]).await?;
        let mempool: HashSet<Hash> = node.get_raw_mempool().await?.into_iter().collect();

        let mut fresh = UtxoSet::new();
        for unspent in result.unspents {
            fresh.insert(Utxo {
                outpoint: unspent.outpoint,
                value: unspent.amount,
                script_pubkey: unspent.script_pubkey,
                coinbase: unspent.coinbase,
                height: Some(unspent.height),
            });
        }

        for utxo in self.utxos.iter().filter(|utxo| !utxo.is_confirmed()) {
            if mempool.contains(&utxo.outpoint.txid) && !fresh.contains(&utxo.outpoint) {
                fresh.insert(utxo.clone());
            }
        }

        let mut pending = BTreeMap::new();
        for (outpoint, spend) in std::mem::take(&mut self.pending_spends) {
            if mempool.contains(&spend.spending_txid) {
                fresh.remove(&outpoint);
                pending.insert(outpoint, spend);
            } else if !spend.utxo.is_confirmed() && mempool.contains(&outpoint.txid) {
                // The spender left the mempool but the parent is still there
                fresh.insert(spend.utxo);
            }
        }

        debug!(
            "wallet scan at height {}: {} outputs ({} before), {} pending spends",
            result.height,
            fresh.len(),
            self.utxos.len(),
            pending.len()
        );
        self.utxos = fresh;
        self.pending_spends = pending;
        self.tip_height = result.height;
        Ok(())
    }

    /// Track the outputs of `tx` that pay to this wallet and hide the
    /// outputs it spends.
    pub fn scan_tx(&mut self, tx: &Transaction) {
        let txid = tx.txid();
        for input in &tx.inputs {
            if let Some(utxo) = self.utxos.remove(&input.previous_output) {
                self.pending_spends.insert(
                    input.previous_output,
                    PendingSpend {
                        spending_txid: txid,
                        utxo,
                    },
                );
            }
        }
        for (vout, output) in tx.outputs.iter().enumerate() {
            if output.script_pubkey == self.script_pubkey {
                self.utxos.insert(Utxo {
                    outpoint: OutPoint::new(txid, vout as u32),
                    value: output.value,
                    script_pubkey: output.script_pubkey.clone(),
                    coinbase: false,
                    height: None,
                });
            }
        }
    }

    // Undo `scan_tx` for a transaction the node refused
    fn forget_tx(&mut self, txid: &Hash) {
        for outpoint in self.utxos.created_by(txid) {
            self.utxos.remove(&outpoint);
        }
        let restored: Vec<OutPoint> = self
            .pending_spends
            .iter()
            .filter(|(_, spend)| spend.spending_txid == *txid)
            .map(|(outpoint, _)| *outpoint)
            .collect();
        for outpoint in restored {
            if let Some(spend) = self.pending_spends.remove(&outpoint) {
                self.utxos.insert(spend.utxo);
            }
        }
    }

    /// Mine `count` blocks to this wallet's descriptor and rescan.
    pub async fn generate(&mut self, node: &dyn NodeRpc, count: u64) -> Result<Vec<Hash>, WalletError> {
        let hashes = node.generate_to_descriptor(count, &self.descriptor).await?;
        self.scan(node).await?;
        Ok(hashes)
    }

    // ========================================================================
    // Transaction construction
    // ========================================================================

    /// Spend the fewest spendable outputs that cover `fee_policy`, paying
    /// everything minus the fee back to this wallet.
    ///
    /// The spent outputs are hidden and the new output is tracked as
    /// unconfirmed; a later [`MiniWallet::scan`] restores the inputs if the
    /// transaction never reaches the mempool.
    ///
    /// # Errors
    ///
    /// [`WalletError::InsufficientFunds`] when the spendable outputs cannot
    /// cover the fee plus a non-dust output.
    pub fn create_self_transfer(&mut self, fee_policy: FeePolicy) -> Result<Transaction, WalletError> {
        self.create_transaction(Vec::new(), fee_policy)
    }

    /// Pay `amount` to `script_pubkey`, with change back to this wallet.
    pub fn create_transfer(
        &mut self,
        script_pubkey: Vec<u8>,
        amount: u64,
        fee_policy: FeePolicy,
    ) -> Result<Transaction, WalletError> {
        self.create_transaction(vec![TxOut::new(amount, script_pubkey)], fee_policy)
    }

    /// [`MiniWallet::create_self_transfer`] then `sendrawtransaction`.
    ///
    /// # Errors
    ///
    /// [`WalletError::Rejected`] with the node's code and reason when the
    /// node refuses the transaction; the wallet state is rolled back.
    pub async fn send_self_transfer(
        &mut self,
        node: &dyn NodeRpc,
        fee_policy: FeePolicy,
    ) -> Result<Hash, WalletError> {
        let tx = self.create_self_transfer(fee_policy)?;
        self.submit(node, tx).await
    }

    pub async fn send_to(
        &mut self,
        node: &dyn NodeRpc,
        script_pubkey: Vec<u8>,
        amount: u64,
        fee_policy: FeePolicy,
    ) -> Result<Hash, WalletError> {
        let tx = self.create_transfer(script_pubkey, amount, fee_policy)?;
        self.submit(node, tx).await
    }

    /// Build a self-transfer and announce it over a peer connection instead
    /// of RPC. Returns once the node has processed the message, whether it
    /// accepted the transaction or not.
    pub async fn send_self_transfer_via_p2p(
        &mut self,
        peer: &PeerConnection,
        fee_policy: FeePolicy,
    ) -> Result<Transaction, WalletError> {
        let tx = self.create_self_transfer(fee_policy)?;
        if let Err(e) = peer.send_and_ping(NetworkMessage::Tx(tx.clone())).await {
            self.forget_tx(&tx.txid());
            return Err(e.into());
        }
        Ok(tx)
    }

    async fn submit(&mut self, node: &dyn NodeRpc, tx: Transaction) -> Result<Hash, WalletError> {
        let txid = tx.txid();
        match node.send_raw_transaction(&tx).await {
            Ok(accepted) => {
                debug!("wallet transaction {} accepted", accepted);
                Ok(accepted)
            }
            Err(RpcError::Rpc { code, message }) => {
                debug!("wallet transaction {} rejected: {}", txid, message);
                self.forget_tx(&txid);
                Err(WalletError::Rejected {
                    code,
                    reason: message,
                })
            }
            Err(e) => {
                self.forget_tx(&txid);
                Err(e.into())
            }
        }
    }

    fn create_transaction(
        &mut self,
        payments: Vec<TxOut>,
        fee_policy: FeePolicy,
    ) -> Result<Transaction, WalletError> {
        let candidates = self.utxos.selection_order(&self.chain, self.tip_height);
        let available: u64 = candidates.iter().map(|utxo| utxo.value).sum();
        let payment_total: u64 = payments.iter().map(|output| output.value).sum();

        // Largest outputs first, so the first prefix that works is the smallest set
        let mut last_fee = fee_policy.fee_for_vsize(0);
        for count in 1..=candidates.len() {
            let selected = &candidates[..count];
            match self.fund(selected, &payments, fee_policy)? {
                Funding::Complete(tx) => {
                    if log::log_enabled!(log::Level::Trace) {
                        trace!(
                            "built {} spending {} outputs, vsize {}",
                            tx.txid(),
                            count,
                            tx.vsize()
                        );
                    }
                    self.scan_tx(&tx);
                    return Ok(tx);
                }
                Funding::Short { fee } => last_fee = fee,
            }
        }

        Err(WalletError::InsufficientFunds {
            needed: payment_total + last_fee + DUST_THRESHOLD,
            available,
        })
    }

    // Build and sign over `inputs`, iterating until the rate fee matches the signed size
    fn fund(
        &self,
        inputs: &[Utxo],
        payments: &[TxOut],
        fee_policy: FeePolicy,
    ) -> Result<Funding, WalletError> {
        let input_total: u64 = inputs.iter().map(|utxo| utxo.value).sum();
        let payment_total: u64 = payments.iter().map(|output| output.value).sum();

        let mut fee = fee_policy.fee_for_vsize(0);
        for _ in 0..MAX_FEE_ITERATIONS {
            let change = match input_total.checked_sub(payment_total + fee) {
                Some(change) if change >= DUST_THRESHOLD => change,
                _ => return Ok(Funding::Short { fee }),
            };

            let mut outputs = payments.to_vec();
            outputs.push(TxOut::new(change, self.script_pubkey.clone()));
            let tx = self.sign(inputs, outputs)?;

            let required = fee_policy.fee_for_vsize(tx.vsize());
            if required == fee {
                return Ok(Funding::Complete(tx));
            }
            fee = required;
        }

        Err(WalletError::Signing(format!(
            "fee did not settle after {} attempts",
            MAX_FEE_ITERATIONS
        )))
    }

    fn sign(&self, inputs: &[Utxo], outputs: Vec<TxOut>) -> Result<Transaction, WalletError> {
        let mut tx = Transaction::new(
            inputs.iter().map(|utxo| TxIn::new(utxo.outpoint)).collect(),
            outputs,
        );

        match self.mode {
            WalletMode::AddressOpTrue => {
                for input in tx.inputs.iter_mut() {
                    input.witness = vec![op_true_script()];
                }
            }
            WalletMode::RawOpTrue => {
                // Pad so the transaction is not below the minimum relay size
                let base = tx.base_size();
                if base < MIN_STANDARD_TX_NONWITNESS_SIZE {
                    if let Some(first) = tx.inputs.first_mut() {
                        first.script_sig = vec![OP_NOP; MIN_STANDARD_TX_NONWITNESS_SIZE - base];
                    }
                }
            }
            WalletMode::RawP2pk => {
                let mut signatures = Vec::with_capacity(inputs.len());
                for (index, utxo) in inputs.iter().enumerate() {
                    let sighash =
                        legacy_signature_hash(&tx, index, &utxo.script_pubkey, SIGHASH_ALL)
                            .ok_or_else(|| {
                                WalletError::Signing(format!("input {} out of range", index))
                            })?;
                    signatures.push(self.key.sign(&sighash, SIGHASH_ALL));
                }
                for (input, signature) in tx.inputs.iter_mut().zip(signatures) {
                    let mut script_sig = Vec::with_capacity(signature.len() + 1);
                    push_data(&mut script_sig, &signature);
                    input.script_sig = script_sig;
                }
            }
        }

        Ok(tx)
    }
}

enum Funding {
    Complete(Transaction),
    /// The inputs cannot cover payments, `fee` and a non-dust change output
    Short { fee: u64 },
}
