// Tier 3: multi-node networks.
//
// `RegtestNetwork` wires node handles into a topology and provides the
// barriers scenarios synchronise on: `sync_all`, `sync_mempools` and
// `generate`, which mines and waits for the miner's connected component.

pub mod network;

pub use network::{
    default_mining_descriptor, NetworkTopology, RegtestNetwork, RegtestNetworkBuilder, SyncError,
};

#[cfg(test)]
mod e2e_tests;
