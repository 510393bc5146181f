//! Peer-protocol emulator.
//!
//! A [`PeerConnection`] is a scripted peer: it connects to a node's P2P
//! endpoint, performs the handshake, records everything it receives and lets
//! scenarios send arbitrary messages, install per-command handlers and wait
//! for conditions over what has been received.

mod connection;
mod error;
mod handlers;
mod message_log;

pub use connection::{ConnectionStatus, PeerConfig, PeerConnection, DEFAULT_CONNECT_TIMEOUT};
pub use error::PeerError;
pub use handlers::{Handler, HandlerRegistry, PeerFlags, Replies};
pub use message_log::MessageLog;
