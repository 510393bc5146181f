use std::fmt::{Display, Formatter};

use super::{
    inventory::{read_bounded_list, read_headers, write_headers, BlockLocator, Inventory, MAX_INV_SIZE},
    version::VersionMessage,
};
use crate::{
    block::{Block, BlockHeader},
    serializer::{Reader, ReaderError, Serializer, Writer},
    transaction::Transaction,
};

/// Payload of `sendcmpct`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendCmpct {
    pub announce: bool,
    pub version: u64,
}

/// Every message kind the harness can exchange with a node.
///
/// Commands the harness does not model decode into [`NetworkMessage::Unknown`]
/// with the raw payload untouched, so scenarios can exercise forward
/// compatibility or send deliberately malformed data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    Inv(Vec<Inventory>),
    GetData(Vec<Inventory>),
    NotFound(Vec<Inventory>),
    Tx(Transaction),
    Block(Block),
    Headers(Vec<BlockHeader>),
    GetHeaders(BlockLocator),
    GetBlocks(BlockLocator),
    SendHeaders,
    MemPool,
    GetAddr,
    FeeFilter(u64),
    WtxidRelay,
    SendAddrV2,
    SendCmpct(SendCmpct),
    /// `command` must be 1 to 12 printable ASCII characters to be encoded.
    Unknown { command: String, payload: Vec<u8> },
}

impl NetworkMessage {
    /// Command tag written in the message header.
    pub fn command(&self) -> &str {
        match self {
            NetworkMessage::Version(_) => "version",
            NetworkMessage::Verack => "verack",
            NetworkMessage::Ping(_) => "ping",
            NetworkMessage::Pong(_) => "pong",
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::NotFound(_) => "notfound",
            NetworkMessage::Tx(_) => "tx",
            NetworkMessage::Block(_) => "block",
            NetworkMessage::Headers(_) => "headers",
            NetworkMessage::GetHeaders(_) => "getheaders",
            NetworkMessage::GetBlocks(_) => "getblocks",
            NetworkMessage::SendHeaders => "sendheaders",
            NetworkMessage::MemPool => "mempool",
            NetworkMessage::GetAddr => "getaddr",
            NetworkMessage::FeeFilter(_) => "feefilter",
            NetworkMessage::WtxidRelay => "wtxidrelay",
            NetworkMessage::SendAddrV2 => "sendaddrv2",
            NetworkMessage::SendCmpct(_) => "sendcmpct",
            NetworkMessage::Unknown { command, .. } => command,
        }
    }

    pub fn write_payload(&self, writer: &mut Writer) {
        match self {
            NetworkMessage::Version(version) => version.write(writer),
            NetworkMessage::Ping(nonce)
            | NetworkMessage::Pong(nonce)
            | NetworkMessage::FeeFilter(nonce) => writer.write_u64(*nonce),
            NetworkMessage::Inv(items)
            | NetworkMessage::GetData(items)
            | NetworkMessage::NotFound(items) => items.write(writer),
            NetworkMessage::Tx(tx) => tx.write(writer),
            NetworkMessage::Block(block) => block.write(writer),
            NetworkMessage::Headers(headers) => write_headers(headers, writer),
            NetworkMessage::GetHeaders(locator) | NetworkMessage::GetBlocks(locator) => {
                locator.write(writer)
            }
            NetworkMessage::SendCmpct(cmpct) => {
                writer.write_bool(cmpct.announce);
                writer.write_u64(cmpct.version);
            }
            NetworkMessage::Unknown { payload, .. } => writer.write_bytes(payload),
            NetworkMessage::Verack
            | NetworkMessage::SendHeaders
            | NetworkMessage::MemPool
            | NetworkMessage::GetAddr
            | NetworkMessage::WtxidRelay
            | NetworkMessage::SendAddrV2 => {}
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.write_payload(&mut writer);
        writer.bytes()
    }

    /// Decode a payload for `command`. The reader must be bounded to the
    /// payload; leftover bytes are reported by the caller.
    pub fn read_payload(command: &str, reader: &mut Reader) -> Result<Self, ReaderError> {
        let message = match command {
            "version" => NetworkMessage::Version(VersionMessage::read(reader)?),
            "verack" => NetworkMessage::Verack,
            "ping" => NetworkMessage::Ping(reader.read_u64()?),
            "pong" => NetworkMessage::Pong(reader.read_u64()?),
            "inv" => NetworkMessage::Inv(read_bounded_list(reader, MAX_INV_SIZE)?),
            "getdata" => NetworkMessage::GetData(read_bounded_list(reader, MAX_INV_SIZE)?),
            "notfound" => NetworkMessage::NotFound(read_bounded_list(reader, MAX_INV_SIZE)?),
            "tx" => NetworkMessage::Tx(Transaction::read(reader)?),
            "block" => NetworkMessage::Block(Block::read(reader)?),
            "headers" => NetworkMessage::Headers(read_headers(reader)?),
            "getheaders" => NetworkMessage::GetHeaders(BlockLocator::read(reader)?),
            "getblocks" => NetworkMessage::GetBlocks(BlockLocator::read(reader)?),
            "sendheaders" => NetworkMessage::SendHeaders,
            "mempool" => NetworkMessage::MemPool,
            "getaddr" => NetworkMessage::GetAddr,
            "feefilter" => NetworkMessage::FeeFilter(reader.read_u64()?),
            "wtxidrelay" => NetworkMessage::WtxidRelay,
            "sendaddrv2" => NetworkMessage::SendAddrV2,
            "sendcmpct" => NetworkMessage::SendCmpct(SendCmpct {
                announce: reader.read_bool()?,
                version: reader.read_u64()?,
            }),
            other => {
                let payload = reader.read_bytes_vec(reader.size())?;
                NetworkMessage::Unknown {
                    command: other.to_string(),
                    payload,
                }
            }
        };
        Ok(message)
    }
}

impl Display for NetworkMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkMessage::Ping(nonce) => write!(f, "ping(nonce={})", nonce),
            NetworkMessage::Pong(nonce) => write!(f, "pong(nonce={})", nonce),
            NetworkMessage::Inv(items) => write!(f, "inv({} items)", items.len()),
            NetworkMessage::GetData(items) => write!(f, "getdata({} items)", items.len()),
            NetworkMessage::Tx(tx) => write!(f, "tx({})", tx.txid()),
            NetworkMessage::Block(block) => write!(f, "block({})", block.hash()),
            NetworkMessage::Unknown { command, payload } => {
                write!(f, "{}({} bytes)", command, payload.len())
            }
            other => write!(f, "{}", other.command()),
        }
    }
}
