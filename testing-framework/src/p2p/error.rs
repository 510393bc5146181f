use std::io;
use std::net::SocketAddr;

use regtest_common::p2p::ProtocolError;
use thiserror::Error;
use tokio::time::Duration;

use crate::orchestrator::TimeoutError;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("timed out after {timeout:?} connecting to {endpoint}")]
    ConnectTimeout {
        endpoint: SocketAddr,
        timeout: Duration,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error("connection was closed by the remote peer")]
    Disconnected,
    #[error("operation on a closed connection")]
    Closed,
}

impl PeerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PeerError::Timeout(_) | PeerError::ConnectTimeout { .. })
    }
}
