use thiserror::Error;

use crate::serializer::ReaderError;

/// Malformed or unparseable wire data.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad network magic: expected {}, found {}", hex::encode(.expected), hex::encode(.found))]
    BadMagic { expected: [u8; 4], found: [u8; 4] },
    #[error("malformed command field {}", hex::encode(.0))]
    InvalidCommand([u8; 12]),
    #[error("command '{0}' is not 1 to 12 printable ASCII characters")]
    UnencodableCommand(String),
    #[error("declared payload length {length} exceeds maximum {max}")]
    Oversized { length: usize, max: usize },
    #[error("checksum mismatch for '{command}': header {}, computed {}", hex::encode(.expected), hex::encode(.computed))]
    ChecksumMismatch {
        command: String,
        expected: [u8; 4],
        computed: [u8; 4],
    },
    #[error("payload of '{command}' does not match its declared length ({remaining} bytes left)")]
    PayloadLength { command: String, remaining: usize },
    #[error("invalid '{command}' payload: {source}")]
    Payload {
        command: String,
        #[source]
        source: ReaderError,
    },
}
