//! Core invariant checkers
//!
//! Checks that hold for any healthy regtest node or network, whatever the
//! scenario did to it:
//! - Coin supply: the unspent set never exceeds the subsidies issued
//! - Mempool consistency: every input resolves and no outpoint is spent twice
//! - Wallet tracking: a minimal wallet only holds outputs the node knows
//! - Agreement: connected nodes share a tip and a mempool

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use regtest_common::{crypto::Hash, utils::format_coin};

use crate::tier1_component::SimChain;
use crate::tier2_integration::NodeRpc;
use crate::wallet::MiniWallet;

/// Check that the unspent outputs of the active chain do not exceed the
/// subsidies of blocks 1 to tip.
///
/// Fees only move coins around, so the two sides are equal unless a block
/// paid less than it could claim.
pub fn check_coin_supply(chain: &SimChain) -> Result<()> {
    let issued: u64 = (1..=chain.height())
        .map(|height| chain.params().block_subsidy(height))
        .sum();
    let unspent: u64 = chain.coins().map(|(_, coin)| coin.output.value).sum();

    if unspent > issued {
        bail!(
            "Coin supply exceeded at height {}: {} unspent, {} issued",
            chain.height(),
            format_coin(unspent),
            format_coin(issued)
        );
    }
    Ok(())
}

/// Check that each mempool input spends either an unspent chain output or
/// an output of an earlier mempool transaction, and that the spend index
/// points back at the spending transaction.
pub fn check_mempool_consistency(chain: &SimChain) -> Result<()> {
    let mempool = chain.mempool();
    let mut spent = BTreeSet::new();
    let mut seen = BTreeSet::new();

    for entry in mempool.iter() {
        for input in &entry.tx.inputs {
            let outpoint = &input.previous_output;
            if !spent.insert((outpoint.txid, outpoint.vout)) {
                bail!("Outpoint {} spent twice in mempool", outpoint);
            }

            let from_chain = chain.coin(outpoint).is_some();
            let from_parent = seen.contains(&outpoint.txid) && mempool.output(outpoint).is_some();
            if !from_chain && !from_parent {
                bail!(
                    "Mempool transaction {} spends unknown outpoint {}",
                    entry.txid,
                    outpoint
                );
            }

            if mempool.spender(outpoint) != Some(&entry.txid) {
                bail!(
                    "Spend index of {} does not point at {}",
                    outpoint,
                    entry.txid
                );
            }
        }
        seen.insert(entry.txid);
    }
    Ok(())
}

/// Check that every output the wallet tracks exists on the node with the
/// same value: confirmed ones in the unspent set, unconfirmed ones in the
/// unspent set or the mempool (they may have been mined since).
pub fn check_wallet_utxos(wallet: &MiniWallet, chain: &SimChain) -> Result<()> {
    for utxo in wallet.utxos().iter() {
        let confirmed = chain.coin(&utxo.outpoint).map(|coin| coin.output.value);
        let value = if utxo.is_confirmed() {
            confirmed
        } else {
            confirmed.or_else(|| chain.mempool().output(&utxo.outpoint).map(|output| output.value))
        };

        match value {
            Some(value) if value == utxo.value => {}
            Some(value) => bail!(
                "Wallet output {} worth {} but node has {}",
                utxo.outpoint,
                format_coin(utxo.value),
                format_coin(value)
            ),
            None => bail!("Wallet output {} unknown to node", utxo.outpoint),
        }
    }
    Ok(())
}

/// Check that all `nodes` report the same best block, returning it.
pub async fn check_tips_agree(nodes: &[&dyn NodeRpc]) -> Result<Hash> {
    let mut tips = Vec::with_capacity(nodes.len());
    for (index, node) in nodes.iter().enumerate() {
        let tip = node
            .get_best_block_hash()
            .await
            .with_context(|| format!("Failed to get best block of node{}", index))?;
        tips.push(tip);
    }

    match tips.split_first() {
        None => bail!("No nodes to compare"),
        Some((first, rest)) => {
            if let Some(index) = rest.iter().position(|tip| tip != first) {
                bail!(
                    "Tips differ: node0 at {}, node{} at {}",
                    first,
                    index + 1,
                    rest[index]
                );
            }
            Ok(*first)
        }
    }
}

/// Check that all `nodes` hold the same set of mempool transactions.
pub async fn check_mempools_agree(nodes: &[&dyn NodeRpc]) -> Result<()> {
    let mut reference: Option<BTreeSet<Hash>> = None;
    for (index, node) in nodes.iter().enumerate() {
        let mempool: BTreeSet<Hash> = node
            .get_raw_mempool()
            .await
            .with_context(|| format!("Failed to get mempool of node{}", index))?
            .into_iter()
            .collect();

        match &reference {
            None => reference = Some(mempool),
            Some(expected) if *expected != mempool => bail!(
                "Mempools differ: node0 has {} entries, node{} has {}",
                expected.len(),
                index,
                mempool.len()
            ),
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use crate::tier1_component::GENESIS_TIME;
    use crate::wallet::{FeePolicy, WalletMode};
    use regtest_common::{
        config::{ChainParams, COIN},
        script::{op_true_script, p2wsh_script},
        transaction::{OutPoint, Transaction, TxIn, TxOut},
    };

    fn funded_chain(blocks: u32) -> SimChain {
        let mut chain = SimChain::new(ChainParams::regtest());
        let script = p2wsh_script(&op_true_script());
        for i in 0..blocks {
            chain.mine_block(&script, GENESIS_TIME + 600 * (i + 1)).unwrap();
        }
        chain
    }

    fn spend(outpoint: OutPoint, value: u64) -> Transaction {
        let mut input = TxIn::new(outpoint);
        input.witness = vec![op_true_script()];
        Transaction::new(vec![input], vec![TxOut::new(value, p2wsh_script(&op_true_script()))])
    }

    #[test]
    fn test_coin_supply_holds_after_mining() {
        let chain = funded_chain(10);
        assert!(check_coin_supply(&chain).is_ok());
        let unspent: u64 = chain.coins().map(|(_, coin)| coin.output.value).sum();
        assert_eq!(unspent, 10 * 50 * COIN);
    }

    #[test]
    fn test_mempool_consistency_with_chained_spends() {
        let mut chain = funded_chain(101);
        let coinbase = chain.get_block(&chain.block_hash_at(1).unwrap()).unwrap().transactions[0].txid();

        let parent = spend(OutPoint::new(coinbase, 0), 50 * COIN - 10_000);
        let parent_id = chain.accept_transaction(parent, 0).unwrap();
        let child = spend(OutPoint::new(parent_id, 0), 50 * COIN - 20_000);
        chain.accept_transaction(child, 0).unwrap();

        assert_eq!(chain.mempool().len(), 2);
        assert!(check_mempool_consistency(&chain).is_ok());
        assert!(check_coin_supply(&chain).is_ok());
    }

    #[tokio::test]
    async fn test_wallet_utxos_match_node() {
        use crate::tier2_integration::TestDaemonBuilder;

        let daemon = TestDaemonBuilder::new().with_cached_blocks(101).build().await.unwrap();
        let mut wallet = MiniWallet::new(WalletMode::AddressOpTrue);
        wallet.scan(&daemon).await.unwrap();
        wallet.send_self_transfer(&daemon, FeePolicy::default()).await.unwrap();

        daemon.with_chain(|chain| {
            check_wallet_utxos(&wallet, chain).unwrap();
            check_mempool_consistency(chain).unwrap();
        });

        let stranger = MiniWallet::new(WalletMode::RawOpTrue);
        daemon.with_chain(|chain| assert!(check_wallet_utxos(&stranger, chain).is_ok()));
    }

    #[tokio::test]
    async fn test_tips_and_mempools_agree() {
        use crate::tier2_integration::TestDaemonBuilder;

        let a = TestDaemonBuilder::new().with_cached_blocks(3).build().await.unwrap();
        let b = TestDaemonBuilder::new().with_cached_blocks(3).build().await.unwrap();
        let nodes: [&dyn NodeRpc; 2] = [&a, &b];
        let tip = check_tips_agree(&nodes).await.unwrap();
        assert_eq!(tip, a.get_best_block_hash().await.unwrap());
        check_mempools_agree(&nodes).await.unwrap();

        a.generate_to_descriptor(1, &crate::tier3_e2e::default_mining_descriptor())
            .await
            .unwrap();
        let err = check_tips_agree(&nodes).await.unwrap_err();
        assert!(err.to_string().contains("Tips differ"));
        assert!(check_tips_agree(&[]).await.is_err());
    }
}
