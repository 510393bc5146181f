#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::disallowed_methods)]
//! Property tests for the minimal wallet against a simulated daemon
//!
//! Whatever the chain length and fee policy, a self-transfer never spends
//! an immature coinbase, pays exactly the fee its policy asks for and is
//! accepted by the node.

use std::collections::HashMap;

use proptest::prelude::*;
use regtest_testing_framework::prelude::*;

fn fee_policy() -> impl Strategy<Value = FeePolicy> {
    prop_oneof![
        (1_000u64..50_000).prop_map(FeePolicy::Fixed),
        (1_000u64..100_000).prop_map(FeePolicy::rate),
    ]
}

fn mode() -> impl Strategy<Value = WalletMode> {
    prop_oneof![
        Just(WalletMode::AddressOpTrue),
        Just(WalletMode::RawOpTrue),
        Just(WalletMode::RawP2pk),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_self_transfer_respects_maturity_and_fee(
        blocks in 100u64..140,
        policy in fee_policy(),
        mode in mode(),
    ) {
        tokio_test::block_on(async move {
            let mut wallet = MiniWallet::new(mode);
            let daemon = TestDaemonBuilder::new()
                .with_cached_blocks(blocks)
                .with_cache_script(wallet.script_pubkey().to_vec())
                .build()
                .await
                .unwrap();

            wallet.scan(&daemon).await.unwrap();
            let tip = wallet.tip_height();
            prop_assert_eq!(tip, blocks);

            let before: HashMap<_, _> = wallet
                .utxos()
                .iter()
                .map(|utxo| (utxo.outpoint, utxo.clone()))
                .collect();
            let tx = wallet.create_self_transfer(policy).unwrap();

            let params = ChainParams::regtest();
            let mut value_in = 0;
            for input in &tx.inputs {
                let utxo = &before[&input.previous_output];
                let height = utxo.height.unwrap();
                prop_assert!(params.is_coinbase_spendable(height, tip));
                value_in += utxo.value;
            }
            let fee = value_in - tx.output_value();
            prop_assert_eq!(fee, policy.fee_for_vsize(tx.vsize()));

            let txid = daemon.send_raw_transaction(&tx).await.unwrap();
            prop_assert_eq!(txid, tx.txid());
            let entry = daemon.get_mempool_entry(&txid).await.unwrap();
            prop_assert_eq!(entry.fee, fee);
            Ok(())
        })?;
    }
}
