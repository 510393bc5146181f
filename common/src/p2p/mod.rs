//! Peer-to-peer wire protocol: message framing and typed payloads.

mod codec;
mod error;
mod inventory;
mod message;
mod version;

pub use codec::{Decoded, MessageCodec};
pub use error::ProtocolError;
pub use inventory::{
    BlockLocator, InvType, Inventory, MAX_HEADERS_RESULTS, MAX_INV_SIZE, MAX_LOCATOR_SIZE,
};
pub use message::{NetworkMessage, SendCmpct};
pub use version::{NetAddress, VersionMessage, MAX_USER_AGENT_LENGTH};
