//! Bounded waits on the state of a single node.
//!
//! All of them are thin wrappers over [`poll_until`]: an RPC failure stops
//! the wait at once and comes back as [`WaitError::Probe`].

use regtest_common::crypto::Hash;

use super::{NodeRpc, RpcError};
use crate::orchestrator::{poll_until, Clock, Probe, WaitConfig, WaitError};

pub type NodeWaitError = WaitError<RpcError>;

/// Wait until the node's active chain reaches `height`.
///
/// # Example
///
/// ```rust,ignore
/// wait_for_block_count(&node, 101, &wait, &SystemClock).await?;
/// ```
pub async fn wait_for_block_count(
    node: &dyn NodeRpc,
    height: u64,
    config: &WaitConfig,
    clock: &dyn Clock,
) -> Result<u64, NodeWaitError> {
    let label = format!("block count >= {}", height);
    poll_until(&label, config, clock, || async move {
        let actual = node.get_block_count().await?;
        Ok(if actual >= height {
            Probe::Ready(actual)
        } else {
            Probe::Pending(format!("height {}", actual))
        })
    })
    .await
}

pub async fn wait_for_best_block(
    node: &dyn NodeRpc,
    expected: &Hash,
    config: &WaitConfig,
    clock: &dyn Clock,
) -> Result<(), NodeWaitError> {
    let label = format!("best block {}", expected);
    poll_until(&label, config, clock, || async move {
        let tip = node.get_best_block_hash().await?;
        Ok(if tip == *expected {
            Probe::Ready(())
        } else {
            Probe::Pending(format!("tip {}", tip))
        })
    })
    .await
}

/// Wait until `txid` is in the node's mempool.
pub async fn wait_for_mempool_tx(
    node: &dyn NodeRpc,
    txid: &Hash,
    config: &WaitConfig,
    clock: &dyn Clock,
) -> Result<(), NodeWaitError> {
    let label = format!("{} in mempool", txid);
    poll_until(&label, config, clock, || async move {
        let mempool = node.get_raw_mempool().await?;
        Ok(if mempool.contains(txid) {
            Probe::Ready(())
        } else {
            Probe::Pending(format!("{} mempool entries", mempool.len()))
        })
    })
    .await
}

pub async fn wait_for_mempool_size(
    node: &dyn NodeRpc,
    size: usize,
    config: &WaitConfig,
    clock: &dyn Clock,
) -> Result<(), NodeWaitError> {
    let label = format!("mempool size {}", size);
    poll_until(&label, config, clock, || async move {
        let mempool = node.get_raw_mempool().await?;
        Ok(if mempool.len() == size {
            Probe::Ready(())
        } else {
            Probe::Pending(format!("{} mempool entries", mempool.len()))
        })
    })
    .await
}

/// Wait until the node reports at least `count` established peers.
pub async fn wait_for_connection_count(
    node: &dyn NodeRpc,
    count: usize,
    config: &WaitConfig,
    clock: &dyn Clock,
) -> Result<usize, NodeWaitError> {
    let label = format!("{} connections", count);
    poll_until(&label, config, clock, || async move {
        let actual = node.get_connection_count().await?;
        Ok(if actual >= count {
            Probe::Ready(actual)
        } else {
            Probe::Pending(format!("{} connections", actual))
        })
    })
    .await
}

/// Wait until a wallet balance satisfies `predicate`, returning it.
pub async fn wait_for_balance<F>(
    node: &dyn NodeRpc,
    wallet: &str,
    predicate: F,
    config: &WaitConfig,
    clock: &dyn Clock,
) -> Result<u64, NodeWaitError>
where
    F: Fn(u64) -> bool,
{
    let label = format!("balance of wallet {}", wallet);
    let predicate = &predicate;
    poll_until(&label, config, clock, || async move {
        let balance = node.get_balance(wallet).await?;
        Ok(if predicate(balance) {
            Probe::Ready(balance)
        } else {
            Probe::Pending(format!("balance {}", balance))
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use crate::orchestrator::SystemClock;
    use crate::tier2_integration::{codes, TestDaemonBuilder};
    use regtest_common::config::COIN;
    use tokio::time::Duration;

    fn short_wait() -> WaitConfig {
        WaitConfig::new(Duration::from_millis(300)).with_poll_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_block_count_ready_and_timeout() {
        let daemon = TestDaemonBuilder::new().with_cached_blocks(5).build().await.unwrap();
        let height = wait_for_block_count(&daemon, 5, &short_wait(), &SystemClock)
            .await
            .unwrap();
        assert_eq!(height, 5);

        match wait_for_block_count(&daemon, 6, &short_wait(), &SystemClock).await {
            Err(WaitError::Timeout(timeout)) => {
                assert_eq!(timeout.last_state, "height 5");
                assert!(timeout.attempts > 1);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rpc_error_stops_wait() {
        let daemon = TestDaemonBuilder::new().build().await.unwrap();
        let result = wait_for_balance(&daemon, "missing", |_| true, &short_wait(), &SystemClock).await;
        match result {
            Err(WaitError::Probe(e)) => assert_eq!(e.code(), Some(codes::RPC_WALLET_NOT_FOUND)),
            other => panic!("expected probe error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mempool_waits() {
        let daemon = TestDaemonBuilder::new().build().await.unwrap();
        daemon.create_wallet("w").await.unwrap();
        let address = daemon.get_new_address("w").await.unwrap();
        daemon.generate_to_address(101, &address).await.unwrap();

        let txid = daemon.send_to_address("w", &address, COIN).await.unwrap();
        wait_for_mempool_tx(&daemon, &txid, &short_wait(), &SystemClock)
            .await
            .unwrap();
        wait_for_mempool_size(&daemon, 1, &short_wait(), &SystemClock)
            .await
            .unwrap();

        let balance = wait_for_balance(&daemon, "w", |b| b > 49 * COIN, &short_wait(), &SystemClock)
            .await
            .unwrap();
        assert!(balance < 50 * COIN);
    }
}
