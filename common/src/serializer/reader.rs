use thiserror::Error;

use super::MAX_SERIALIZED_SIZE;
use crate::crypto::{Hash, HASH_SIZE};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReaderError {
    #[error("Invalid size: not enough bytes left")]
    InvalidSize,
    #[error("Invalid value")]
    InvalidValue,
    #[error("Non-canonical compact size")]
    NonCanonicalCompactSize,
    #[error("Declared size {0} is too large")]
    SizeTooLarge(u64),
    #[error("{0} trailing bytes left after decoding")]
    TrailingBytes(usize),
    #[error("Invalid hex string")]
    InvalidHex,
}

// Cursor over a borrowed byte slice
pub struct Reader<'a> {
    bytes: &'a [u8],
    total: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, total: 0 }
    }

    pub fn read_bool(&mut self) -> Result<bool, ReaderError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ReaderError::InvalidValue),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, ReaderError> {
        let [byte] = self.read_bytes::<1>()?;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> Result<u16, ReaderError> {
        Ok(u16::from_le_bytes(self.read_bytes()?))
    }

    // Ports inside network addresses are big-endian
    pub fn read_u16_be(&mut self) -> Result<u16, ReaderError> {
        Ok(u16::from_be_bytes(self.read_bytes()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, ReaderError> {
        Ok(u32::from_le_bytes(self.read_bytes()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, ReaderError> {
        Ok(i32::from_le_bytes(self.read_bytes()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, ReaderError> {
        Ok(u64::from_le_bytes(self.read_bytes()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, ReaderError> {
        Ok(i64::from_le_bytes(self.read_bytes()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash, ReaderError> {
        Ok(Hash::new(self.read_bytes::<HASH_SIZE>()?))
    }

    pub fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N], ReaderError> {
        let slice = self.read_bytes_ref(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn read_bytes_ref(&mut self, n: usize) -> Result<&'a [u8], ReaderError> {
        if n > self.bytes.len() {
            return Err(ReaderError::InvalidSize);
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        self.total += n;
        Ok(head)
    }

    pub fn read_bytes_vec(&mut self, n: usize) -> Result<Vec<u8>, ReaderError> {
        Ok(self.read_bytes_ref(n)?.to_vec())
    }

    /// Read a compact-size integer, rejecting non-minimal encodings.
    pub fn read_compact_size(&mut self) -> Result<u64, ReaderError> {
        let value = match self.read_u8()? {
            0xfd => {
                let v = self.read_u16()? as u64;
                if v < 0xfd {
                    return Err(ReaderError::NonCanonicalCompactSize);
                }
                v
            }
            0xfe => {
                let v = self.read_u32()? as u64;
                if v <= 0xffff {
                    return Err(ReaderError::NonCanonicalCompactSize);
                }
                v
            }
            0xff => {
                let v = self.read_u64()?;
                if v <= 0xffff_ffff {
                    return Err(ReaderError::NonCanonicalCompactSize);
                }
                v
            }
            small => small as u64,
        };
        Ok(value)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, ReaderError> {
        let len = self.read_compact_size()?;
        if len > MAX_SERIALIZED_SIZE {
            return Err(ReaderError::SizeTooLarge(len));
        }
        self.read_bytes_vec(len as usize)
    }

    pub fn read_var_string(&mut self) -> Result<String, ReaderError> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes).map_err(|_| ReaderError::InvalidValue)
    }

    // Bytes left to read
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn total_read(&self) -> usize {
        self.total
    }
}
