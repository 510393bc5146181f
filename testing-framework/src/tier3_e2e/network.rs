//! Multi-node regtest networks: topology wiring and synchronization barriers.

use std::collections::{BTreeSet, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Context;
use futures::future::join_all;
use log::{debug, info};
use parking_lot::Mutex;
use regtest_common::{
    crypto::Hash,
    descriptor::RawDescriptor,
    script::{op_true_script, p2wsh_script},
};
use thiserror::Error;
use tokio::time::Duration;

use crate::orchestrator::{poll_until, Clock, HarnessConfig, Probe, SystemClock, WaitConfig, WaitError};
use crate::tier2_integration::{NodeHandle, NodeRpc, RpcError, TestDaemon, TestDaemonBuilder};

/// Failure of a network-level barrier or operation.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The nodes did not converge before the deadline; `last_seen` lists
    /// what each node reported on the final attempt.
    #[error("{what} timed out after {elapsed:?} ({attempts} attempts); last seen: {last_seen}")]
    Timeout {
        what: String,
        attempts: u32,
        elapsed: Duration,
        last_seen: String,
    },
    #[error("node{node}: {source}")]
    Rpc {
        node: usize,
        #[source]
        source: RpcError,
    },
    #[error("no node with index {0}")]
    UnknownNode(usize),
}

impl From<WaitError<SyncError>> for SyncError {
    fn from(e: WaitError<SyncError>) -> Self {
        match e {
            WaitError::Probe(e) => e,
            WaitError::Timeout(timeout) => SyncError::Timeout {
                what: timeout.label,
                attempts: timeout.attempts,
                elapsed: timeout.elapsed,
                last_seen: timeout.last_state,
            },
        }
    }
}

/// How the builder wires nodes together
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NetworkTopology {
    /// 0-1, 1-2, ... n-2 - n-1
    #[default]
    Line,
    /// Line plus n-1 - 0
    Ring,
    FullMesh,
    /// Every node connected to node 0
    Star,
    Custom(Vec<(usize, usize)>),
    /// No connections
    Isolated,
}

impl NetworkTopology {
    /// Edges for `count` nodes, as (connecting node, target node).
    pub fn edges(&self, count: usize) -> Vec<(usize, usize)> {
        match self {
            NetworkTopology::Line => (1..count).map(|i| (i - 1, i)).collect(),
            NetworkTopology::Ring => {
                let mut edges: Vec<_> = (1..count).map(|i| (i - 1, i)).collect();
                if count > 2 {
                    edges.push((count - 1, 0));
                }
                edges
            }
            NetworkTopology::FullMesh => (0..count)
                .flat_map(|a| (a + 1..count).map(move |b| (a, b)))
                .collect(),
            NetworkTopology::Star => (1..count).map(|i| (i, 0)).collect(),
            NetworkTopology::Custom(edges) => edges.clone(),
            NetworkTopology::Isolated => Vec::new(),
        }
    }
}

/// Descriptor `generate` mines to: the default minimal-wallet script
pub fn default_mining_descriptor() -> String {
    RawDescriptor::new(p2wsh_script(&op_true_script())).to_string_with_checksum()
}

/// A set of nodes and the links between them.
///
/// Works over any [`NodeRpc`] binding. Networks built by
/// [`RegtestNetworkBuilder`] are made of in-process [`TestDaemon`]s, which
/// stay reachable through [`RegtestNetwork::daemon`].
///
/// # Example
///
/// ```rust,no_run
/// use regtest_testing_framework::tier3_e2e::{NetworkTopology, RegtestNetworkBuilder};
/// use regtest_testing_framework::NodeRpc;
///
/// # async fn run() -> anyhow::Result<()> {
/// let network = RegtestNetworkBuilder::new()
///     .with_nodes(3)
///     .with_topology(NetworkTopology::Ring)
///     .build()
///     .await?;
/// network.generate(0, 10).await?;
/// assert_eq!(network.node(2).get_block_count().await?, 10);
/// # Ok(())
/// # }
/// ```
pub struct RegtestNetwork {
    nodes: Vec<NodeHandle>,
    daemons: Vec<Arc<TestDaemon>>,
    edges: Mutex<BTreeSet<(usize, usize)>>,
    wait: WaitConfig,
    clock: Arc<dyn Clock>,
}

impl RegtestNetwork {
    /// Network over existing node bindings, with no links recorded.
    pub fn new(nodes: Vec<Arc<dyn NodeRpc>>, wait: WaitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .enumerate()
                .map(|(index, rpc)| NodeHandle::new(index, rpc))
                .collect(),
            daemons: Vec::new(),
            edges: Mutex::new(BTreeSet::new()),
            wait,
            clock,
        }
    }

    fn from_daemons(daemons: Vec<Arc<TestDaemon>>, wait: WaitConfig, clock: Arc<dyn Clock>) -> Self {
        let rpcs = daemons
            .iter()
            .map(|daemon| daemon.clone() as Arc<dyn NodeRpc>)
            .collect();
        let mut network = Self::new(rpcs, wait, clock);
        network.daemons = daemons;
        network
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// # Panics
    ///
    /// Panics if `index` is out of range; use [`RegtestNetwork::try_node`]
    /// for a checked lookup.
    pub fn node(&self, index: usize) -> &NodeHandle {
        &self.nodes[index]
    }

    pub fn try_node(&self, index: usize) -> Result<&NodeHandle, SyncError> {
        self.nodes.get(index).ok_or(SyncError::UnknownNode(index))
    }

    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    /// The simulated daemon behind node `index`, if the network was built
    /// from daemons.
    pub fn daemon(&self, index: usize) -> Option<&Arc<TestDaemon>> {
        self.daemons.get(index)
    }

    pub fn wait_config(&self) -> &WaitConfig {
        &self.wait
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Recorded links as `(dialer, listener)` pairs, sorted.
    pub fn edges(&self) -> Vec<(usize, usize)> {
        self.edges.lock().iter().copied().collect()
    }

    fn all(&self) -> Vec<usize> {
        (0..self.nodes.len()).collect()
    }

    // ========================================================================
    // Topology
    // ========================================================================

    /// Have node `a` connect to node `b` and wait until both sides count
    /// the new link.
    ///
    /// # Errors
    ///
    /// [`SyncError::Rpc`] when `addnode` fails, [`SyncError::Timeout`] when
    /// the handshake does not complete in time.
    pub async fn connect(&self, a: usize, b: usize) -> Result<(), SyncError> {
        let (node_a, node_b) = (self.try_node(a)?, self.try_node(b)?);
        let before_a = connection_count(node_a, a).await?;
        let before_b = connection_count(node_b, b).await?;

        node_a
            .add_node(node_b.p2p_endpoint())
            .await
            .map_err(|source| SyncError::Rpc { node: a, source })?;

        let label = format!("connect node{} -> node{}", a, b);
        poll_until(&label, &self.wait, self.clock.as_ref(), || async move {
            let count_a = connection_count(node_a, a).await?;
            let count_b = connection_count(node_b, b).await?;
            Ok::<_, SyncError>(if count_a > before_a && count_b > before_b {
                Probe::Ready(())
            } else {
                Probe::Pending(format!("node{}={} node{}={}", a, count_a, b, count_b))
            })
        })
        .await?;

        self.edges.lock().insert((a, b));
        debug!("connected node{} -> node{}", a, b);
        Ok(())
    }

    /// Drop the link between `a` and `b`, whichever side opened it, and wait
    /// until `a` no longer counts it.
    pub async fn disconnect(&self, a: usize, b: usize) -> Result<(), SyncError> {
        let (node_a, node_b) = (self.try_node(a)?, self.try_node(b)?);
        let before_a = connection_count(node_a, a).await?;

        // Edges are (dialer, listener); only the dialer knows the endpoint
        let dialed_by_b = {
            let edges = self.edges.lock();
            edges.contains(&(b, a)) && !edges.contains(&(a, b))
        };
        let (dialer, dialer_index, listener) = if dialed_by_b {
            (node_b, b, node_a)
        } else {
            (node_a, a, node_b)
        };
        if let Err(first) = dialer.disconnect_node(listener.p2p_endpoint()).await {
            listener
                .disconnect_node(dialer.p2p_endpoint())
                .await
                .map_err(|_| SyncError::Rpc { node: dialer_index, source: first })?;
        }

        let label = format!("disconnect node{} - node{}", a, b);
        poll_until(&label, &self.wait, self.clock.as_ref(), || async move {
            let count = connection_count(node_a, a).await?;
            Ok::<_, SyncError>(if count < before_a {
                Probe::Ready(())
            } else {
                Probe::Pending(format!("node{}={}", a, count))
            })
        })
        .await?;

        {
            let mut edges = self.edges.lock();
            if !edges.remove(&(a, b)) {
                edges.remove(&(b, a));
            }
        }
        debug!("disconnected node{} - node{}", a, b);
        Ok(())
    }

    /// Cut every recorded link between `group_a` and `group_b`.
    pub async fn partition_groups(&self, group_a: &[usize], group_b: &[usize]) -> Result<(), SyncError> {
        let crossing: Vec<(usize, usize)> = self
            .edges()
            .into_iter()
            .filter(|(x, y)| {
                (group_a.contains(x) && group_b.contains(y)) || (group_a.contains(y) && group_b.contains(x))
            })
            .collect();
        for (x, y) in crossing {
            self.disconnect(x, y).await?;
        }
        info!("partitioned {:?} from {:?}", group_a, group_b);
        Ok(())
    }

    /// Nodes reachable from `index` over recorded links in either
    /// direction, sorted.
    pub fn component(&self, index: usize) -> Vec<usize> {
        let edges = self.edges.lock();
        let mut seen = BTreeSet::from([index]);
        let mut queue = VecDeque::from([index]);
        while let Some(current) = queue.pop_front() {
            for &(x, y) in edges.iter() {
                let next = if x == current {
                    y
                } else if y == current {
                    x
                } else {
                    continue;
                };
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen.into_iter().collect()
    }

    // ========================================================================
    // Synchronization barriers
    // ========================================================================

    /// Wait until every node reports the same best block.
    pub async fn sync_all(&self) -> Result<Hash, SyncError> {
        self.sync_blocks(&self.all()).await
    }

    /// Wait until the nodes of `subset` report the same best block, and
    /// return it.
    pub async fn sync_blocks(&self, subset: &[usize]) -> Result<Hash, SyncError> {
        let nodes = self.subset(subset)?;
        let nodes = &nodes;
        let label = format!("sync_blocks {:?}", subset);
        let tip = poll_until(&label, &self.wait, self.clock.as_ref(), || async move {
            let tips = join_all(nodes.iter().map(|(index, node)| async move {
                node.get_best_block_hash()
                    .await
                    .map_err(|source| SyncError::Rpc { node: *index, source })
            }))
            .await
            .into_iter()
            .collect::<Result<Vec<Hash>, SyncError>>()?;

            Ok::<_, SyncError>(match tips.first() {
                Some(first) if tips.iter().all(|tip| tip == first) => Probe::Ready(*first),
                None => Probe::Ready(Hash::zero()),
                Some(_) => {
                    let mut state = String::new();
                    for ((index, _), tip) in nodes.iter().zip(&tips) {
                        let _ = write!(state, "node{}={} ", index, tip);
                    }
                    Probe::Pending(state.trim_end().to_string())
                }
            })
        })
        .await?;
        debug!("blocks in sync on {:?} at {}", subset, tip);
        Ok(tip)
    }

    pub async fn sync_mempools(&self) -> Result<(), SyncError> {
        self.sync_mempools_of(&self.all()).await
    }

    /// Wait until the nodes of `subset` hold the same set of mempool txids.
    pub async fn sync_mempools_of(&self, subset: &[usize]) -> Result<(), SyncError> {
        let nodes = self.subset(subset)?;
        let nodes = &nodes;
        let label = format!("sync_mempools {:?}", subset);
        poll_until(&label, &self.wait, self.clock.as_ref(), || async move {
            let pools = join_all(nodes.iter().map(|(index, node)| async move {
                node.get_raw_mempool()
                    .await
                    .map(|txids| txids.into_iter().collect::<BTreeSet<Hash>>())
                    .map_err(|source| SyncError::Rpc { node: *index, source })
            }))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, SyncError>>()?;

            Ok::<_, SyncError>(match pools.first() {
                Some(first) if !pools.iter().all(|pool| pool == first) => {
                    let mut state = String::new();
                    for ((index, _), pool) in nodes.iter().zip(&pools) {
                        let _ = write!(state, "node{}={} txs ", index, pool.len());
                    }
                    Probe::Pending(state.trim_end().to_string())
                }
                _ => Probe::Ready(()),
            })
        })
        .await?;
        Ok(())
    }

    fn subset(&self, subset: &[usize]) -> Result<Vec<(usize, &NodeHandle)>, SyncError> {
        subset
            .iter()
            .map(|&index| self.try_node(index).map(|node| (index, node)))
            .collect()
    }

    // ========================================================================
    // Mining
    // ========================================================================

    /// Mine `count` blocks on node `index` to the default mining descriptor,
    /// then wait until its connected component agrees on the tip.
    pub async fn generate(&self, index: usize, count: u64) -> Result<Vec<Hash>, SyncError> {
        self.generate_to_descriptor(index, count, &default_mining_descriptor())
            .await
    }

    pub async fn generate_to_address(
        &self,
        index: usize,
        count: u64,
        address: &str,
    ) -> Result<Vec<Hash>, SyncError> {
        let hashes = self
            .try_node(index)?
            .generate_to_address(count, address)
            .await
            .map_err(|source| SyncError::Rpc { node: index, source })?;
        self.sync_blocks(&self.component(index)).await?;
        Ok(hashes)
    }

    pub async fn generate_to_descriptor(
        &self,
        index: usize,
        count: u64,
        descriptor: &str,
    ) -> Result<Vec<Hash>, SyncError> {
        let hashes = self
            .try_node(index)?
            .generate_to_descriptor(count, descriptor)
            .await
            .map_err(|source| SyncError::Rpc { node: index, source })?;
        self.sync_blocks(&self.component(index)).await?;
        Ok(hashes)
    }
}

async fn connection_count(node: &NodeHandle, index: usize) -> Result<usize, SyncError> {
    node.get_connection_count()
        .await
        .map_err(|source| SyncError::Rpc { node: index, source })
}

/// Builder for networks of in-process daemons
pub struct RegtestNetworkBuilder {
    node_count: usize,
    topology: NetworkTopology,
    config: HarnessConfig,
    cached_blocks: u64,
    clock: Option<Arc<dyn Clock>>,
}

impl RegtestNetworkBuilder {
    /// Two nodes in a line, default configuration
    pub fn new() -> Self {
        Self {
            node_count: 2,
            topology: NetworkTopology::Line,
            config: HarnessConfig::default(),
            cached_blocks: 0,
            clock: None,
        }
    }

    pub fn with_nodes(mut self, count: usize) -> Self {
        self.node_count = count;
        self
    }

    pub fn with_topology(mut self, topology: NetworkTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_config(mut self, config: HarnessConfig) -> Self {
        self.config = config;
        self
    }

    /// Every node starts from the same pre-mined chain of `count` blocks.
    pub fn with_cached_blocks(mut self, count: u64) -> Self {
        self.cached_blocks = count;
        self
    }

    pub fn with_relay_delay(mut self, delay: Duration) -> Self {
        self.config.daemon.relay_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Start the daemons, wire the topology and wait for block sync.
    ///
    /// # Errors
    ///
    /// Returns an error if a daemon fails to start, an edge names a node
    /// that does not exist or the initial sync times out.
    pub async fn build(self) -> anyhow::Result<RegtestNetwork> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let mut daemons = Vec::with_capacity(self.node_count);
        for index in 0..self.node_count {
            let daemon = TestDaemonBuilder::new()
                .with_name(format!("node{}", index))
                .with_config(&self.config)
                .with_cached_blocks(self.cached_blocks)
                .with_clock(clock.clone())
                .build()
                .await
                .with_context(|| format!("starting node{}", index))?;
            daemons.push(Arc::new(daemon));
        }

        let network = RegtestNetwork::from_daemons(daemons, self.config.wait_config(), clock);
        for (a, b) in self.topology.edges(self.node_count) {
            network
                .connect(a, b)
                .await
                .with_context(|| format!("wiring {:?}", self.topology))?;
        }
        network.sync_all().await.context("initial sync")?;

        info!(
            "network of {} nodes up ({:?}, {} edges)",
            network.len(),
            self.topology,
            network.edges().len()
        );
        Ok(network)
    }
}

impl Default for RegtestNetworkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;

    #[test]
    fn test_topology_edges() {
        assert_eq!(NetworkTopology::Line.edges(3), vec![(0, 1), (1, 2)]);
        assert_eq!(NetworkTopology::Ring.edges(3), vec![(0, 1), (1, 2), (2, 0)]);
        assert_eq!(NetworkTopology::Ring.edges(2), vec![(0, 1)]);
        assert_eq!(NetworkTopology::FullMesh.edges(4).len(), 6);
        assert_eq!(NetworkTopology::Star.edges(3), vec![(1, 0), (2, 0)]);
        assert!(NetworkTopology::Isolated.edges(5).is_empty());
        assert!(NetworkTopology::Line.edges(1).is_empty());
    }

    #[test]
    fn test_default_mining_descriptor_is_p2wsh_op_true() {
        let descriptor = default_mining_descriptor();
        assert!(descriptor.starts_with("raw(00204ae81572"));
    }

    #[tokio::test]
    async fn test_components_follow_edges() {
        let network = RegtestNetworkBuilder::new()
            .with_nodes(4)
            .with_topology(NetworkTopology::Custom(vec![(0, 1), (2, 3)]))
            .build()
            .await
            .unwrap();

        assert_eq!(network.component(0), vec![0, 1]);
        assert_eq!(network.component(3), vec![2, 3]);
        assert_eq!(network.edges(), vec![(0, 1), (2, 3)]);
        assert!(matches!(network.try_node(9), Err(SyncError::UnknownNode(9))));
    }

    #[tokio::test]
    async fn test_edges_keep_dialer_order() {
        let network = RegtestNetworkBuilder::new()
            .with_nodes(3)
            .with_topology(NetworkTopology::Star)
            .build()
            .await
            .unwrap();
        assert_eq!(network.edges(), NetworkTopology::Star.edges(3));
        assert_eq!(network.edges(), vec![(1, 0), (2, 0)]);
        assert_eq!(network.component(0), vec![0, 1, 2]);

        // Either orientation finds the link node1 dialed
        network.disconnect(0, 1).await.unwrap();
        assert_eq!(network.edges(), vec![(2, 0)]);
        assert_eq!(network.component(1), vec![1]);

        network.partition_groups(&[0], &[2]).await.unwrap();
        assert!(network.edges().is_empty());
        assert_eq!(network.node(0).get_connection_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sync_timeout_reports_tips() {
        let config = HarnessConfig::from_yaml_str("wait:\n  timeout_ms: 300\n  poll_interval_ms: 20\n").unwrap();
        let network = RegtestNetworkBuilder::new()
            .with_nodes(2)
            .with_topology(NetworkTopology::Isolated)
            .with_config(config)
            .build()
            .await
            .unwrap();

        // Isolated nodes mine independently and never converge
        network.generate(0, 1).await.unwrap();
        match network.sync_all().await {
            Err(SyncError::Timeout { last_seen, attempts, .. }) => {
                assert!(last_seen.contains("node0="));
                assert!(last_seen.contains("node1="));
                assert!(attempts > 1);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
