//! Output descriptors in the minimal form the harness needs.
//!
//! Only `raw(<hex script>)` is modelled. It is enough to scan a UTXO set
//! for a wallet's script and to direct block rewards to it, without any
//! address encoding.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

const INPUT_CHARSET: &str =
    "0123456789()[],'/*abcdefgh@:$%{}IJKLMNOPQRSTUVWXYZ&+-.;<=>?!^_|~ijklmnopqrstuvwxyzABCDEFGH`#\"\\ ";
const CHECKSUM_CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";
pub const CHECKSUM_LENGTH: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("invalid character {0:?} in descriptor")]
    InvalidCharacter(char),
    #[error("descriptor checksum mismatch: expected {expected}, got {found}")]
    ChecksumMismatch { expected: String, found: String },
    #[error("unsupported descriptor: {0}")]
    Unsupported(String),
    #[error("invalid script hex")]
    InvalidHex,
}

fn polymod(c: u64, value: u64) -> u64 {
    let c0 = c >> 35;
    let mut c = ((c & 0x7_ffff_ffff) << 5) ^ value;
    if c0 & 1 != 0 {
        c ^= 0xf5_dee5_1989;
    }
    if c0 & 2 != 0 {
        c ^= 0xa9_fdca_3312;
    }
    if c0 & 4 != 0 {
        c ^= 0x1b_ab10_e32d;
    }
    if c0 & 8 != 0 {
        c ^= 0x37_06b1_677a;
    }
    if c0 & 16 != 0 {
        c ^= 0x64_4d62_6ffd;
    }
    c
}

/// Compute the 8 character checksum of a descriptor string (without `#`).
pub fn descriptor_checksum(descriptor: &str) -> Result<String, DescriptorError> {
    let mut c = 1u64;
    let mut class = 0u64;
    let mut class_count = 0;
    for ch in descriptor.chars() {
        let position = INPUT_CHARSET
            .find(ch)
            .ok_or(DescriptorError::InvalidCharacter(ch))? as u64;
        c = polymod(c, position & 31);
        class = class * 3 + (position >> 5);
        class_count += 1;
        if class_count == 3 {
            c = polymod(c, class);
            class = 0;
            class_count = 0;
        }
    }
    if class_count > 0 {
        c = polymod(c, class);
    }
    for _ in 0..CHECKSUM_LENGTH {
        c = polymod(c, 0);
    }
    c ^= 1;

    Ok((0..CHECKSUM_LENGTH)
        .map(|j| CHECKSUM_CHARSET[((c >> (5 * (7 - j))) & 31) as usize] as char)
        .collect())
}

/// Append `#checksum` to a descriptor.
pub fn add_checksum(descriptor: &str) -> Result<String, DescriptorError> {
    Ok(format!("{}#{}", descriptor, descriptor_checksum(descriptor)?))
}

/// Split off and verify a trailing checksum, if any.
pub fn strip_checksum(descriptor: &str) -> Result<&str, DescriptorError> {
    match descriptor.split_once('#') {
        None => Ok(descriptor),
        Some((body, found)) => {
            let expected = descriptor_checksum(body)?;
            if expected != found {
                return Err(DescriptorError::ChecksumMismatch {
                    expected,
                    found: found.to_string(),
                });
            }
            Ok(body)
        }
    }
}

// `raw(<hex>)` descriptor over an arbitrary output script
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawDescriptor {
    script_pubkey: Vec<u8>,
}

impl RawDescriptor {
    pub fn new(script_pubkey: Vec<u8>) -> Self {
        Self { script_pubkey }
    }

    pub fn script_pubkey(&self) -> &[u8] {
        &self.script_pubkey
    }

    /// Descriptor string with its checksum, as accepted by node RPCs.
    pub fn to_string_with_checksum(&self) -> String {
        let body = self.to_string();
        // Hex output and the raw() wrapper only use charset characters
        let checksum = descriptor_checksum(&body).unwrap_or_default();
        format!("{}#{}", body, checksum)
    }
}

impl Display for RawDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "raw({})", hex::encode(&self.script_pubkey))
    }
}

impl FromStr for RawDescriptor {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = strip_checksum(s)?;
        let inner = body
            .strip_prefix("raw(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| DescriptorError::Unsupported(body.to_string()))?;
        let script_pubkey = hex::decode(inner).map_err(|_| DescriptorError::InvalidHex)?;
        Ok(Self { script_pubkey })
    }
}
