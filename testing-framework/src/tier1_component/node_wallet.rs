use std::collections::HashSet;

use log::debug;
use rand::RngCore;
use regtest_common::{
    config::DUST_THRESHOLD,
    crypto::sha256,
    script::tagged_op_true_script,
    transaction::{OutPoint, Transaction, TxIn, TxOut},
};

use super::chain::SimChain;
use super::mempool::Rejection;
use crate::tier2_integration::codes;

/// Prefix of addresses handed out by simulated node wallets.
pub const ADDRESS_PREFIX: &str = "sim1";

const TAG_SIZE: usize = 20;

/// Address form of a script: the prefix followed by the script in hex.
pub fn encode_address(script_pubkey: &[u8]) -> String {
    format!("{}{}", ADDRESS_PREFIX, hex::encode(script_pubkey))
}

/// Script an address pays to.
///
/// # Errors
///
/// `RPC_INVALID_ADDRESS_OR_KEY` when the string is not a simulated address.
pub fn decode_address(address: &str) -> Result<Vec<u8>, Rejection> {
    let invalid = || Rejection::new(codes::RPC_INVALID_ADDRESS_OR_KEY, "Invalid address");
    let script_hex = address.strip_prefix(ADDRESS_PREFIX).ok_or_else(invalid)?;
    match hex::decode(script_hex) {
        Ok(script) if !script.is_empty() => Ok(script),
        _ => Err(invalid()),
    }
}

/// Named wallet of a simulated node.
///
/// Every address is a distinct tagged anyone-can-spend script, so wallets
/// never need keys. Balances follow the usual node rules: coinbase outputs
/// count once they are one block past the mempool maturity threshold, and
/// unconfirmed outputs count only when the wallet funded the transaction.
pub struct SimWallet {
    name: String,
    salt: [u8; 16],
    next_index: u64,
    scripts: HashSet<Vec<u8>>,
}

impl SimWallet {
    pub fn new(name: impl Into<String>) -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        Self {
            name: name.into(),
            salt,
            next_index: 0,
            scripts: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address_count(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_mine(&self, script_pubkey: &[u8]) -> bool {
        self.scripts.contains(script_pubkey)
    }

    /// Allocate a fresh receiving script and return its address.
    pub fn new_address(&mut self) -> String {
        encode_address(&self.new_script())
    }

    fn new_script(&mut self) -> Vec<u8> {
        let mut preimage = Vec::with_capacity(self.salt.len() + self.name.len() + 8);
        preimage.extend_from_slice(&self.salt);
        preimage.extend_from_slice(self.name.as_bytes());
        preimage.extend_from_slice(&self.next_index.to_le_bytes());
        self.next_index += 1;

        let script = tagged_op_true_script(&sha256(&preimage)[..TAG_SIZE]);
        self.scripts.insert(script.clone());
        script
    }

    /// Sum of the outputs the wallet could spend now.
    pub fn balance(&self, chain: &SimChain) -> u64 {
        self.available_coins(chain).iter().map(|(_, value)| value).sum()
    }

    // A mempool transaction is ours when every input it spends is ours
    fn is_from_me(&self, chain: &SimChain, tx: &Transaction) -> bool {
        tx.inputs.iter().all(|input| {
            let outpoint = &input.previous_output;
            chain
                .coin(outpoint)
                .map(|coin| &coin.output)
                .or_else(|| chain.mempool().output(outpoint))
                .is_some_and(|output| self.is_mine(&output.script_pubkey))
        })
    }

    // Spendable outputs, largest first with ties broken by outpoint
    fn available_coins(&self, chain: &SimChain) -> Vec<(OutPoint, u64)> {
        let tip = chain.height();
        let params = chain.params();
        let mempool = chain.mempool();

        let mut coins: Vec<(OutPoint, u64)> = chain
            .coins()
            .filter(|(outpoint, coin)| {
                self.is_mine(&coin.output.script_pubkey)
                    && (!coin.coinbase || params.blocks_to_maturity(coin.height, tip) == 0)
                    && mempool.spender(outpoint).is_none()
            })
            .map(|(outpoint, coin)| (*outpoint, coin.output.value))
            .collect();

        for entry in mempool.iter().filter(|entry| self.is_from_me(chain, &entry.tx)) {
            for (outpoint, output) in entry.tx.outpoints().zip(entry.tx.outputs.iter()) {
                if self.is_mine(&output.script_pubkey) && mempool.spender(&outpoint).is_none() {
                    coins.push((outpoint, output.value));
                }
            }
        }

        coins.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        coins
    }

    /// Build a payment of `amount` to `script_pubkey` at `fee_per_kvb`,
    /// with change to a new address of this wallet. Change below the dust
    /// threshold is left to the fee.
    ///
    /// # Errors
    ///
    /// The codes a node wallet reports: `RPC_TYPE_ERROR` for a zero amount,
    /// `RPC_WALLET_ERROR` for dust and `RPC_WALLET_INSUFFICIENT_FUNDS`.
    pub fn create_send(
        &mut self,
        chain: &SimChain,
        script_pubkey: Vec<u8>,
        amount: u64,
        fee_per_kvb: u64,
    ) -> Result<Transaction, Rejection> {
        if amount == 0 {
            return Err(Rejection::new(codes::RPC_TYPE_ERROR, "Invalid amount for send"));
        }
        if amount < DUST_THRESHOLD {
            return Err(Rejection::new(
                codes::RPC_WALLET_ERROR,
                "Transaction amount too small",
            ));
        }

        let coins = self.available_coins(chain);
        let placeholder_change = tagged_op_true_script(&[0u8; TAG_SIZE]);
        let mut total = 0u64;

        for count in 1..=coins.len() {
            total += coins[count - 1].1;
            let inputs: Vec<TxIn> = coins[..count]
                .iter()
                .map(|(outpoint, _)| TxIn::new(*outpoint))
                .collect();

            let estimate = Transaction::new(
                inputs.clone(),
                vec![
                    TxOut::new(amount, script_pubkey.clone()),
                    TxOut::new(0, placeholder_change.clone()),
                ],
            );
            let fee = (estimate.vsize() as u64 * fee_per_kvb).div_ceil(1000);
            let Some(change) = total.checked_sub(amount + fee) else {
                continue;
            };

            let mut outputs = vec![TxOut::new(amount, script_pubkey)];
            if change >= DUST_THRESHOLD {
                outputs.push(TxOut::new(change, self.new_script()));
            }
            let tx = Transaction::new(inputs, outputs);
            debug!(
                "wallet {} pays {} sat with {} inputs, fee {}",
                self.name,
                amount,
                count,
                total - tx.output_value()
            );
            return Ok(tx);
        }

        Err(Rejection::new(
            codes::RPC_WALLET_INSUFFICIENT_FUNDS,
            "Insufficient funds",
        ))
    }
}
