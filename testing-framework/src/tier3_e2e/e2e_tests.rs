//! End-to-End Multi-Node Tests
//!
//! Functional scenarios over networks of simulated daemons: wallet
//! payments between nodes, minimal-wallet mempool load, peer-protocol
//! liveness, relay over multi-hop topologies and partition healing.

use crate::tier2_integration::rpc_helpers::*;
use crate::tier2_integration::NodeRpc;
use crate::tier3_e2e::network::{NetworkTopology, RegtestNetworkBuilder};
use crate::wallet::{FeePolicy, MiniWallet, WalletMode};
use anyhow::Result;
use regtest_common::{config::COIN, p2p::NetworkMessage};
use tokio::time::Duration;

/// Test 1: Minimal wallet self-transfer
///
/// Scenario:
/// - Single node on a 200-block cached chain paying the wallet's script
/// - Rescan, balance is positive
/// - Self-transfer enters the mempool
/// - One block later the mempool is empty
#[tokio::test]
async fn test_miniwallet_self_transfer() -> Result<()> {
    let network = RegtestNetworkBuilder::new()
        .with_nodes(1)
        .with_cached_blocks(200)
        .build()
        .await?;
    let node = network.node(0);

    let mut wallet = MiniWallet::new(WalletMode::AddressOpTrue);
    wallet.scan(node.rpc().as_ref()).await?;
    assert!(wallet.get_balance() > 0);

    wallet
        .send_self_transfer(node.rpc().as_ref(), FeePolicy::default())
        .await?;
    assert_mempool_size(node, 1).await?;

    network.generate(0, 1).await?;
    assert_mempool_size(node, 0).await?;

    Ok(())
}

/// Test 2: Node wallet payment between two nodes
///
/// Scenario:
/// - Two connected nodes, wallets w1 on node0 and w2 on node1
/// - 101 blocks to w1 gives a balance of 50
/// - w1 pays 1 to w2, the payment reaches node1's mempool
/// - After one block w2 holds exactly 1
#[tokio::test]
async fn test_wallet_payment_between_nodes() -> Result<()> {
    let network = RegtestNetworkBuilder::new().with_nodes(2).build().await?;
    let (node0, node1) = (network.node(0), network.node(1));

    node0.create_wallet("w1").await?;
    node1.create_wallet("w2").await?;
    let w1_address = node0.get_new_address("w1").await?;
    let w2_address = node1.get_new_address("w2").await?;

    network.generate_to_address(0, 101, &w1_address).await?;
    assert_balance(node0, "w1", 50 * COIN).await?;

    let txid = node0.send_to_address("w1", &w2_address, COIN).await?;
    network.sync_mempools().await?;
    node1.get_mempool_entry(&txid).await?;
    assert_balance_lte(node0, "w1", 49 * COIN).await?;

    network.generate(0, 1).await?;
    network.sync_mempools().await?;
    assert_mempool_size(node0, 0).await?;
    assert_mempool_size(node1, 0).await?;
    assert_balance(node1, "w2", COIN).await?;

    Ok(())
}

/// Test 3: Ping answered with the same nonce
#[tokio::test]
async fn test_ping_pong() -> Result<()> {
    let network = RegtestNetworkBuilder::new().with_nodes(1).build().await?;
    let peer = network.node(0).add_p2p_connection().await?;

    let seen = peer.message_count("pong");
    peer.send_without_ping(NetworkMessage::Ping(1)).await?;
    let pong = peer.wait_for_new_message("pong", seen).await?;
    assert_eq!(pong, NetworkMessage::Pong(1));

    Ok(())
}

/// Test 4: Relay across a line of nodes
///
/// Scenario:
/// - 4 nodes in a line, so node3 hears of node0's blocks through 2 hops
/// - Transactions and blocks reach the far end
#[tokio::test]
async fn test_multi_hop_relay() -> Result<()> {
    let network = RegtestNetworkBuilder::new()
        .with_nodes(4)
        .with_topology(NetworkTopology::Line)
        .with_cached_blocks(110)
        .build()
        .await?;

    let mut wallet = MiniWallet::new(WalletMode::AddressOpTrue);
    wallet.scan(network.node(0).rpc().as_ref()).await?;
    let txid = wallet
        .send_self_transfer(network.node(0).rpc().as_ref(), FeePolicy::default())
        .await?;

    network.sync_mempools().await?;
    assert_in_mempool(network.node(3), &txid).await?;

    let hashes = network.generate(3, 2).await?;
    for i in 0..4 {
        assert_block_count(network.node(i), 112).await?;
        assert_best_block(network.node(i), &hashes[1]).await?;
    }
    network.sync_mempools().await?;
    assert_not_in_mempool(network.node(0), &txid).await?;

    Ok(())
}

/// Test 5: Partition and healing
///
/// Scenario:
/// - Ring of 3 nodes, partitioned into [0,1] and [2]
/// - Both sides mine, node2 mines the longer branch
/// - After reconnecting, every node follows node2's chain
#[tokio::test]
async fn test_partition_heals_to_longest_chain() -> Result<()> {
    let network = RegtestNetworkBuilder::new()
        .with_nodes(3)
        .with_topology(NetworkTopology::Ring)
        .build()
        .await?;

    network.partition_groups(&[0, 1], &[2]).await?;
    assert_eq!(network.component(0), vec![0, 1]);

    network.generate(0, 2).await?;
    let winner = network.generate(2, 3).await?;
    assert_block_count(network.node(1), 2).await?;

    network.connect(1, 2).await?;
    let tip = network.sync_all().await?;
    assert_eq!(tip, winner[2]);
    for i in 0..3 {
        assert_block_count(network.node(i), 3).await?;
    }

    Ok(())
}

/// Test 6: Transaction submitted over the peer protocol
///
/// Scenario:
/// - Self-transfer announced by a scripted peer instead of RPC
/// - The node accepts it, relays it and announces it back to other peers
#[tokio::test]
async fn test_tx_via_p2p_relays() -> Result<()> {
    let network = RegtestNetworkBuilder::new()
        .with_nodes(2)
        .with_cached_blocks(101)
        .build()
        .await?;
    let sender = network.node(0).add_p2p_connection().await?;
    let listener = network.node(1).add_p2p_connection().await?;

    let mut wallet = MiniWallet::new(WalletMode::AddressOpTrue);
    wallet.scan(network.node(0).rpc().as_ref()).await?;
    let tx = wallet
        .send_self_transfer_via_p2p(&sender, FeePolicy::default())
        .await?;

    network.sync_mempools().await?;
    assert_in_mempool(network.node(1), &tx.txid()).await?;

    let txid = tx.txid();
    listener
        .wait_until(
            |log| {
                matches!(log.last("inv"), Some(NetworkMessage::Inv(items))
                    if items.iter().any(|item| item.hash == txid))
            },
            Some(Duration::from_secs(10)),
        )
        .await?;

    Ok(())
}

/// Test 7: Barriers hold through a relay delay
#[tokio::test]
async fn test_sync_all_waits_out_relay_delay() -> Result<()> {
    let network = RegtestNetworkBuilder::new()
        .with_nodes(3)
        .with_relay_delay(Duration::from_millis(200))
        .build()
        .await?;

    let hashes = network.generate(0, 5).await?;
    for i in 0..3 {
        assert_best_block(network.node(i), &hashes[4]).await?;
    }

    Ok(())
}
