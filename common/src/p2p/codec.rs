use log::trace;

use super::{NetworkMessage, ProtocolError};
use crate::{
    config::{Network, COMMAND_SIZE, MAX_PROTOCOL_MESSAGE_LENGTH, MESSAGE_HEADER_SIZE},
    crypto::sha256d,
    serializer::{Reader, Writer},
};

/// Outcome of one decode attempt over a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete message and the number of bytes it occupied.
    Message {
        message: NetworkMessage,
        consumed: usize,
    },
    /// The buffer holds only a prefix of the next message.
    NeedMoreData,
}

/// Frames messages for one network.
///
/// Stateless: `decode` can be called repeatedly over a growing buffer, and
/// the caller drops `consumed` bytes from its front after every message.
///
/// # Example
///
/// ```
/// use regtest_common::p2p::{Decoded, MessageCodec, NetworkMessage};
///
/// let codec = MessageCodec::regtest();
/// let bytes = codec.encode(&NetworkMessage::Ping(42)).unwrap();
/// assert_eq!(codec.decode(&bytes[..10]).unwrap(), Decoded::NeedMoreData);
/// match codec.decode(&bytes).unwrap() {
///     Decoded::Message { message, consumed } => {
///         assert_eq!(message, NetworkMessage::Ping(42));
///         assert_eq!(consumed, bytes.len());
///     }
///     Decoded::NeedMoreData => unreachable!(),
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageCodec {
    magic: [u8; 4],
}

impl MessageCodec {
    pub fn new(magic: [u8; 4]) -> Self {
        Self { magic }
    }

    pub fn regtest() -> Self {
        Self::new(Network::Regtest.magic())
    }

    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }

    /// # Errors
    ///
    /// [`ProtocolError::UnencodableCommand`] when a
    /// [`NetworkMessage::Unknown`] carries a command that does not fit the
    /// header field.
    pub fn encode(&self, message: &NetworkMessage) -> Result<Vec<u8>, ProtocolError> {
        self.frame(message.command(), &message.payload())
    }

    /// Frame an arbitrary command and payload.
    ///
    /// Used directly by tests that need bytes no typed message would
    /// produce. The command must be 1 to 12 printable ASCII characters.
    pub fn frame(&self, command: &str, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let bytes = command.as_bytes();
        if bytes.is_empty() || bytes.len() > COMMAND_SIZE || !bytes.iter().all(|b| (0x20..=0x7e).contains(b)) {
            return Err(ProtocolError::UnencodableCommand(command.to_string()));
        }
        let mut command_bytes = [0u8; COMMAND_SIZE];
        command_bytes[..bytes.len()].copy_from_slice(bytes);

        let checksum = sha256d(payload);
        let mut writer = Writer::with_capacity(MESSAGE_HEADER_SIZE + payload.len());
        writer.write_bytes(&self.magic);
        writer.write_bytes(&command_bytes);
        writer.write_u32(payload.len() as u32);
        writer.write_bytes(&checksum.as_bytes()[..4]);
        writer.write_bytes(payload);
        Ok(writer.bytes())
    }

    pub fn decode(&self, buffer: &[u8]) -> Result<Decoded, ProtocolError> {
        // Reject a wrong magic as soon as it is visible
        let visible = buffer.len().min(4);
        if buffer[..visible] != self.magic[..visible] {
            let mut found = [0u8; 4];
            found[..visible].copy_from_slice(&buffer[..visible]);
            return Err(ProtocolError::BadMagic {
                expected: self.magic,
                found,
            });
        }
        if buffer.len() < MESSAGE_HEADER_SIZE {
            return Ok(Decoded::NeedMoreData);
        }

        let mut command_bytes = [0u8; COMMAND_SIZE];
        command_bytes.copy_from_slice(&buffer[4..16]);
        let command = parse_command(&command_bytes)?;

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buffer[16..20]);
        let length = u32::from_le_bytes(length_bytes) as usize;
        if length > MAX_PROTOCOL_MESSAGE_LENGTH {
            return Err(ProtocolError::Oversized {
                length,
                max: MAX_PROTOCOL_MESSAGE_LENGTH,
            });
        }

        let total = MESSAGE_HEADER_SIZE + length;
        if buffer.len() < total {
            return Ok(Decoded::NeedMoreData);
        }

        let payload = &buffer[MESSAGE_HEADER_SIZE..total];
        let mut expected = [0u8; 4];
        expected.copy_from_slice(&buffer[20..24]);
        let mut computed = [0u8; 4];
        computed.copy_from_slice(&sha256d(payload).as_bytes()[..4]);
        if expected != computed {
            return Err(ProtocolError::ChecksumMismatch {
                command,
                expected,
                computed,
            });
        }

        let mut reader = Reader::new(payload);
        let message = NetworkMessage::read_payload(&command, &mut reader).map_err(|source| {
            ProtocolError::Payload {
                command: command.clone(),
                source,
            }
        })?;
        if reader.size() != 0 {
            return Err(ProtocolError::PayloadLength {
                command,
                remaining: reader.size(),
            });
        }

        trace!("decoded {} ({} bytes)", message, total);
        Ok(Decoded::Message {
            message,
            consumed: total,
        })
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::regtest()
    }
}

// Printable ASCII followed only by NUL padding
fn parse_command(bytes: &[u8; COMMAND_SIZE]) -> Result<String, ProtocolError> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(COMMAND_SIZE);
    let (name, padding) = bytes.split_at(end);
    if padding.iter().any(|b| *b != 0) || name.iter().any(|b| !(0x20..=0x7e).contains(b)) {
        return Err(ProtocolError::InvalidCommand(*bytes));
    }
    Ok(name.iter().map(|b| *b as char).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::{calculate_merkle_root, Block, BlockHeader, REGTEST_BITS},
        crypto::Hash,
        p2p::{BlockLocator, Inventory, InvType, SendCmpct, VersionMessage},
        script::{op_true_script, p2wsh_script},
        serializer::ReaderError,
        transaction::{OutPoint, Transaction, TxIn, TxOut},
    };
    use proptest::prelude::*;

    fn sample_tx() -> Transaction {
        let mut input = TxIn::new(OutPoint::new(crate::crypto::sha256d(b"funding"), 0));
        input.witness = vec![op_true_script()];
        Transaction::new(
            vec![input],
            vec![TxOut::new(4_999_990_000, p2wsh_script(&op_true_script()))],
        )
    }

    fn sample_block() -> Block {
        let coinbase = Transaction::new(
            vec![TxIn::new(OutPoint::null())],
            vec![TxOut::new(5_000_000_000, op_true_script())],
        );
        let transactions = vec![coinbase, sample_tx()];
        Block {
            header: BlockHeader {
                version: 0x2000_0000,
                prev_blockhash: crate::crypto::sha256d(b"parent"),
                merkle_root: calculate_merkle_root(&transactions),
                time: 1_700_000_000,
                bits: REGTEST_BITS,
                nonce: 0,
            },
            transactions,
        }
    }

    fn all_variants() -> Vec<NetworkMessage> {
        let block = sample_block();
        let locator = BlockLocator::new(vec![block.hash(), Hash::zero()], Hash::zero());
        vec![
            NetworkMessage::Version(VersionMessage::new("127.0.0.1:18444".parse().unwrap(), 99, 101)),
            NetworkMessage::Verack,
            NetworkMessage::Ping(u64::MAX),
            NetworkMessage::Pong(0),
            NetworkMessage::Inv(vec![Inventory::tx(sample_tx().txid()), Inventory::block(block.hash())]),
            NetworkMessage::GetData(vec![Inventory::witness_tx(sample_tx().wtxid())]),
            NetworkMessage::NotFound(vec![Inventory::new(InvType::Unknown(77), Hash::zero())]),
            NetworkMessage::Tx(sample_tx()),
            NetworkMessage::Block(block.clone()),
            NetworkMessage::Headers(vec![block.header.clone()]),
            NetworkMessage::GetHeaders(locator.clone()),
            NetworkMessage::GetBlocks(locator),
            NetworkMessage::SendHeaders,
            NetworkMessage::MemPool,
            NetworkMessage::GetAddr,
            NetworkMessage::FeeFilter(1_000),
            NetworkMessage::WtxidRelay,
            NetworkMessage::SendAddrV2,
            NetworkMessage::SendCmpct(SendCmpct {
                announce: true,
                version: 2,
            }),
            NetworkMessage::Unknown {
                command: "futurecmd".to_string(),
                payload: vec![1, 2, 3],
            },
        ]
    }

    fn decode_one(codec: &MessageCodec, bytes: &[u8]) -> NetworkMessage {
        match codec.decode(bytes).unwrap() {
            Decoded::Message { message, consumed } => {
                assert_eq!(consumed, bytes.len());
                message
            }
            Decoded::NeedMoreData => panic!("incomplete message"),
        }
    }

    #[test]
    fn test_every_variant_roundtrips() {
        let codec = MessageCodec::regtest();
        for message in all_variants() {
            let bytes = codec.encode(&message).unwrap();
            assert_eq!(decode_one(&codec, &bytes), message, "{}", message.command());
        }
    }

    #[test]
    fn test_zero_length_payload() {
        let codec = MessageCodec::regtest();
        let bytes = codec.encode(&NetworkMessage::Verack).unwrap();
        assert_eq!(bytes.len(), MESSAGE_HEADER_SIZE);
        // Checksum of the empty payload
        assert_eq!(&bytes[20..24], &[0x5d, 0xf6, 0xe0, 0xe2]);
        assert_eq!(&bytes[4..16], b"verack\0\0\0\0\0\0");
        assert_eq!(decode_one(&codec, &bytes), NetworkMessage::Verack);
    }

    #[test]
    fn test_maximum_length_payload() {
        let codec = MessageCodec::regtest();
        let message = NetworkMessage::Unknown {
            command: "bigpayload".to_string(),
            payload: vec![0xab; MAX_PROTOCOL_MESSAGE_LENGTH],
        };
        let bytes = codec.encode(&message).unwrap();
        assert_eq!(decode_one(&codec, &bytes), message);
    }

    #[test]
    fn test_oversized_declared_length() {
        let codec = MessageCodec::regtest();
        let mut bytes = codec.encode(&NetworkMessage::Verack).unwrap();
        let length = (MAX_PROTOCOL_MESSAGE_LENGTH as u32 + 1).to_le_bytes();
        bytes[16..20].copy_from_slice(&length);
        assert!(matches!(
            codec.decode(&bytes),
            Err(ProtocolError::Oversized { .. })
        ));
    }

    #[test]
    fn test_bad_magic_detected_early() {
        let codec = MessageCodec::regtest();
        let other = MessageCodec::new(Network::Mainnet.magic());
        let bytes = other.encode(&NetworkMessage::Verack).unwrap();
        assert!(matches!(
            codec.decode(&bytes[..2]),
            Err(ProtocolError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        let codec = MessageCodec::regtest();
        let mut bytes = codec.encode(&NetworkMessage::Ping(1)).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            codec.decode(&bytes),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_command_padding() {
        let codec = MessageCodec::regtest();
        let mut bytes = codec.encode(&NetworkMessage::Verack).unwrap();
        // NUL inside the name followed by a non-NUL byte
        bytes[4 + 7] = b'x';
        assert!(matches!(
            codec.decode(&bytes),
            Err(ProtocolError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_unencodable_commands_rejected() {
        let codec = MessageCodec::regtest();
        for command in ["", "thirteenchars", "tab\tin", "caf\u{e9}"] {
            let message = NetworkMessage::Unknown {
                command: command.to_string(),
                payload: vec![1],
            };
            assert_eq!(
                codec.encode(&message),
                Err(ProtocolError::UnencodableCommand(command.to_string()))
            );
        }

        // Exactly twelve characters fills the field with no padding
        let message = NetworkMessage::Unknown {
            command: "twelvechars!".to_string(),
            payload: Vec::new(),
        };
        let bytes = codec.encode(&message).unwrap();
        assert_eq!(&bytes[4..16], b"twelvechars!");
        assert_eq!(decode_one(&codec, &bytes), message);
    }

    #[test]
    fn test_payload_shorter_and_longer_than_declared() {
        let codec = MessageCodec::regtest();

        let short = codec.frame("ping", &[1, 2, 3]).unwrap();
        assert!(matches!(
            codec.decode(&short),
            Err(ProtocolError::Payload {
                source: ReaderError::InvalidSize,
                ..
            })
        ));

        let long = codec.frame("ping", &[0; 9]).unwrap();
        assert_eq!(
            codec.decode(&long),
            Err(ProtocolError::PayloadLength {
                command: "ping".to_string(),
                remaining: 1
            })
        );
    }

    #[test]
    fn test_back_to_back_messages() {
        let codec = MessageCodec::regtest();
        let mut stream = codec.encode(&NetworkMessage::Ping(5)).unwrap();
        stream.extend(codec.encode(&NetworkMessage::Verack).unwrap());

        let mut decoded = Vec::new();
        let mut offset = 0;
        while offset < stream.len() {
            match codec.decode(&stream[offset..]).unwrap() {
                Decoded::Message { message, consumed } => {
                    decoded.push(message);
                    offset += consumed;
                }
                Decoded::NeedMoreData => break,
            }
        }
        assert_eq!(decoded, vec![NetworkMessage::Ping(5), NetworkMessage::Verack]);
    }

    proptest! {
        #[test]
        fn prop_split_delivery_reconstructs_messages(
            chunk_sizes in prop::collection::vec(1usize..64, 1..32),
            nonce in any::<u64>(),
        ) {
            let codec = MessageCodec::regtest();
            let messages = vec![
                NetworkMessage::Ping(nonce),
                NetworkMessage::Tx(sample_tx()),
                NetworkMessage::Verack,
                NetworkMessage::Block(sample_block()),
            ];
            let stream: Vec<u8> = messages.iter().flat_map(|m| codec.encode(m).unwrap()).collect();

            let mut buffer = Vec::new();
            let mut received = Vec::new();
            let mut position = 0;
            let mut sizes = chunk_sizes.iter().cycle();
            while position < stream.len() {
                let size = (*sizes.next().unwrap()).min(stream.len() - position);
                buffer.extend_from_slice(&stream[position..position + size]);
                position += size;
                loop {
                    match codec.decode(&buffer).unwrap() {
                        Decoded::Message { message, consumed } => {
                            received.push(message);
                            buffer.drain(..consumed);
                        }
                        Decoded::NeedMoreData => break,
                    }
                }
            }

            prop_assert!(buffer.is_empty());
            prop_assert_eq!(received, messages);
        }

        #[test]
        fn prop_unknown_commands_roundtrip(
            suffix in "[a-z]{1,8}",
            payload in prop::collection::vec(any::<u8>(), 0..256),
        ) {
            let codec = MessageCodec::regtest();
            let message = NetworkMessage::Unknown {
                command: format!("zz{}", suffix),
                payload,
            };
            let bytes = codec.encode(&message).unwrap();
            prop_assert_eq!(decode_one(&codec, &bytes), message);
        }
    }
}
