mod reader;
mod writer;

pub use reader::{Reader, ReaderError};
pub use writer::{compact_size_len, Writer};

// Upper bound of any length prefix accepted while decoding (MAX_SIZE in the reference node)
pub const MAX_SERIALIZED_SIZE: u64 = 0x0200_0000;

/// Binary encoding used on the wire and for hashing.
///
/// Every type exchanged with a node implements this trait. The encoding is
/// the consensus encoding of the target network: little-endian integers and
/// compact-size length prefixes.
pub trait Serializer: Sized {
    fn write(&self, writer: &mut Writer);

    fn read(reader: &mut Reader) -> Result<Self, ReaderError>;

    fn size(&self) -> usize {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.total_write()
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.bytes()
    }

    fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    // Decode a value that must span the whole slice
    fn from_bytes(bytes: &[u8]) -> Result<Self, ReaderError> {
        let mut reader = Reader::new(bytes);
        let value = Self::read(&mut reader)?;
        if reader.size() != 0 {
            return Err(ReaderError::TrailingBytes(reader.size()));
        }
        Ok(value)
    }

    fn from_hex(hex: &str) -> Result<Self, ReaderError> {
        let bytes = hex::decode(hex).map_err(|_| ReaderError::InvalidHex)?;
        Self::from_bytes(&bytes)
    }
}

impl<T: Serializer> Serializer for Vec<T> {
    fn write(&self, writer: &mut Writer) {
        writer.write_compact_size(self.len() as u64);
        for item in self {
            item.write(writer);
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let count = reader.read_compact_size()?;
        if count > MAX_SERIALIZED_SIZE {
            return Err(ReaderError::SizeTooLarge(count));
        }
        // Never trust the declared count for the allocation
        let mut items = Vec::with_capacity((count as usize).min(reader.size()));
        for _ in 0..count {
            items.push(T::read(reader)?);
        }
        Ok(items)
    }
}

impl Serializer for u64 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u64()
    }

    fn size(&self) -> usize {
        8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_size_boundaries() {
        let cases: [(u64, usize); 7] = [
            (0, 1),
            (0xfc, 1),
            (0xfd, 3),
            (0xffff, 3),
            (0x1_0000, 5),
            (0xffff_ffff, 5),
            (0x1_0000_0000, 9),
        ];

        for (value, len) in cases {
            let mut writer = Writer::new();
            writer.write_compact_size(value);
            assert_eq!(writer.total_write(), len, "encoded length of {value}");

            let bytes = writer.bytes();
            let mut reader = Reader::new(&bytes);
            assert_eq!(reader.read_compact_size().unwrap(), value);
            assert_eq!(reader.size(), 0);
        }
    }

    #[test]
    fn test_non_canonical_compact_size_rejected() {
        // 0xfc encoded with the 3-byte form
        let bytes = [0xfd, 0xfc, 0x00];
        let mut reader = Reader::new(&bytes);
        assert!(matches!(
            reader.read_compact_size(),
            Err(ReaderError::NonCanonicalCompactSize)
        ));
    }

    #[test]
    fn test_vec_count_larger_than_input() {
        // Claims 200 items but carries none
        let bytes = [200u8];
        assert!(Vec::<u64>::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let bytes = [1, 0, 0, 0, 0, 0, 0, 0, 0xff];
        assert!(matches!(
            u64::from_bytes(&bytes),
            Err(ReaderError::TrailingBytes(1))
        ));
    }
}
