//! RPC assertion helpers for integration testing
//!
//! This module provides assertion helpers for verifying node state via RPC interface.
//! These helpers make tests more readable and provide better error messages.

use crate::tier2_integration::{NodeRpc, RpcError};
use anyhow::{Context, Result};
use regtest_common::{crypto::Hash, utils::format_coin};

/// Assert that node is at expected block count
///
/// # Arguments
///
/// * `node` - Node implementing NodeRpc
/// * `expected_height` - Expected height of the active tip
///
/// # Errors
///
/// Returns an error if:
/// - RPC call fails
/// - Actual height doesn't match expected
///
/// # Example
///
/// ```rust,ignore
/// assert_block_count(&daemon, 101).await?;
/// ```
pub async fn assert_block_count(node: &dyn NodeRpc, expected_height: u64) -> Result<()> {
    let actual = node
        .get_block_count()
        .await
        .context("Failed to get block count")?;

    if actual != expected_height {
        anyhow::bail!(
            "Block count mismatch: expected {}, got {}",
            expected_height,
            actual
        );
    }

    Ok(())
}

/// Assert that a wallet has exactly the expected balance
///
/// # Arguments
///
/// * `node` - Node implementing NodeRpc
/// * `wallet` - Name of the node wallet
/// * `expected_balance` - Expected balance in satoshis
///
/// # Errors
///
/// Returns an error if:
/// - RPC call fails
/// - Actual balance doesn't match expected
///
/// # Example
///
/// ```rust,ignore
/// assert_balance(&node1, "w2", COIN).await?;
/// ```
pub async fn assert_balance(
    node: &dyn NodeRpc,
    wallet: &str,
    expected_balance: u64,
) -> Result<()> {
    let actual = node
        .get_balance(wallet)
        .await
        .with_context(|| format!("Failed to get balance of wallet {}", wallet))?;

    if actual != expected_balance {
        anyhow::bail!(
            "Balance mismatch for wallet {}: expected {}, got {}",
            wallet,
            format_coin(expected_balance),
            format_coin(actual)
        );
    }

    Ok(())
}

/// Assert that a wallet balance is greater than or equal to threshold
pub async fn assert_balance_gte(
    node: &dyn NodeRpc,
    wallet: &str,
    min_balance: u64,
) -> Result<()> {
    let actual = node
        .get_balance(wallet)
        .await
        .with_context(|| format!("Failed to get balance of wallet {}", wallet))?;

    if actual < min_balance {
        anyhow::bail!(
            "Balance of wallet {} below minimum: expected >= {}, got {}",
            wallet,
            format_coin(min_balance),
            format_coin(actual)
        );
    }

    Ok(())
}

/// Assert that a wallet balance is less than or equal to threshold
///
/// Spending wallets pay a fee that depends on the inputs chosen, so checks
/// after a send usually bound the balance instead of pinning it.
///
/// # Example
///
/// ```rust,ignore
/// node0.send_to_address("w1", &address, COIN).await?;
/// assert_balance_lte(&node0, "w1", 49 * COIN).await?;
/// ```
pub async fn assert_balance_lte(
    node: &dyn NodeRpc,
    wallet: &str,
    max_balance: u64,
) -> Result<()> {
    let actual = node
        .get_balance(wallet)
        .await
        .with_context(|| format!("Failed to get balance of wallet {}", wallet))?;

    if actual > max_balance {
        anyhow::bail!(
            "Balance of wallet {} above maximum: expected <= {}, got {}",
            wallet,
            format_coin(max_balance),
            format_coin(actual)
        );
    }

    Ok(())
}

pub async fn assert_mempool_size(node: &dyn NodeRpc, expected_size: usize) -> Result<()> {
    let mempool = node
        .get_raw_mempool()
        .await
        .context("Failed to get raw mempool")?;

    if mempool.len() != expected_size {
        anyhow::bail!(
            "Mempool size mismatch: expected {}, got {} ({:?})",
            expected_size,
            mempool.len(),
            mempool
        );
    }

    Ok(())
}

/// Assert that `txid` is in the node's mempool
///
/// # Errors
///
/// Returns an error if:
/// - RPC call fails
/// - The transaction is missing
pub async fn assert_in_mempool(node: &dyn NodeRpc, txid: &Hash) -> Result<()> {
    let mempool = node
        .get_raw_mempool()
        .await
        .context("Failed to get raw mempool")?;

    if !mempool.contains(txid) {
        anyhow::bail!("Transaction {} not in mempool ({} entries)", txid, mempool.len());
    }

    Ok(())
}

pub async fn assert_not_in_mempool(node: &dyn NodeRpc, txid: &Hash) -> Result<()> {
    let mempool = node
        .get_raw_mempool()
        .await
        .context("Failed to get raw mempool")?;

    if mempool.contains(txid) {
        anyhow::bail!("Transaction {} unexpectedly in mempool", txid);
    }

    Ok(())
}

/// Assert that the node's best block is `expected_tip`
pub async fn assert_best_block(node: &dyn NodeRpc, expected_tip: &Hash) -> Result<()> {
    let actual = node
        .get_best_block_hash()
        .await
        .context("Failed to get best block hash")?;

    if actual != *expected_tip {
        anyhow::bail!("Best block mismatch: expected {}, got {}", expected_tip, actual);
    }

    Ok(())
}

/// Assert that an RPC call failed with `code` and a message containing
/// `message`
///
/// # Example
///
/// ```rust,ignore
/// let result = node.get_mempool_entry(&txid).await;
/// assert_rpc_error(result, codes::RPC_INVALID_ADDRESS_OR_KEY, "not in mempool")?;
/// ```
pub fn assert_rpc_error<T: std::fmt::Debug>(
    result: Result<T, RpcError>,
    code: i64,
    message: &str,
) -> Result<()> {
    match result {
        Ok(value) => anyhow::bail!("Expected RPC error {}, call succeeded with {:?}", code, value),
        Err(RpcError::Rpc {
            code: actual_code,
            message: actual_message,
        }) => {
            if actual_code != code || !actual_message.contains(message) {
                anyhow::bail!(
                    "Expected RPC error {} containing '{}', got {}: {}",
                    code,
                    message,
                    actual_code,
                    actual_message
                );
            }
            Ok(())
        }
        Err(other) => anyhow::bail!("Expected RPC error {}, got {}", code, other),
    }
}
