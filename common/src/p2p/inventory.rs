use crate::{
    block::BlockHeader,
    crypto::Hash,
    serializer::{Reader, ReaderError, Serializer, Writer},
};

// Upper bounds a node enforces on list payloads
pub const MAX_INV_SIZE: usize = 50_000;
pub const MAX_HEADERS_RESULTS: usize = 2_000;
pub const MAX_LOCATOR_SIZE: usize = 101;

const WITNESS_FLAG: u32 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvType {
    Error,
    Tx,
    Block,
    FilteredBlock,
    CompactBlock,
    WitnessTx,
    WitnessBlock,
    Unknown(u32),
}

impl InvType {
    pub fn to_u32(self) -> u32 {
        match self {
            InvType::Error => 0,
            InvType::Tx => 1,
            InvType::Block => 2,
            InvType::FilteredBlock => 3,
            InvType::CompactBlock => 4,
            InvType::WitnessTx => WITNESS_FLAG | 1,
            InvType::WitnessBlock => WITNESS_FLAG | 2,
            InvType::Unknown(value) => value,
        }
    }

    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => InvType::Error,
            1 => InvType::Tx,
            2 => InvType::Block,
            3 => InvType::FilteredBlock,
            4 => InvType::CompactBlock,
            v if v == WITNESS_FLAG | 1 => InvType::WitnessTx,
            v if v == WITNESS_FLAG | 2 => InvType::WitnessBlock,
            other => InvType::Unknown(other),
        }
    }

    pub fn is_tx(self) -> bool {
        matches!(self, InvType::Tx | InvType::WitnessTx)
    }

    pub fn is_block(self) -> bool {
        matches!(self, InvType::Block | InvType::WitnessBlock)
    }
}

/// One entry of an `inv`, `getdata` or `notfound` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Inventory {
    pub inv_type: InvType,
    pub hash: Hash,
}

impl Inventory {
    pub fn new(inv_type: InvType, hash: Hash) -> Self {
        Self { inv_type, hash }
    }

    pub fn tx(txid: Hash) -> Self {
        Self::new(InvType::Tx, txid)
    }

    pub fn witness_tx(wtxid: Hash) -> Self {
        Self::new(InvType::WitnessTx, wtxid)
    }

    pub fn block(hash: Hash) -> Self {
        Self::new(InvType::Block, hash)
    }
}

impl Serializer for Inventory {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.inv_type.to_u32());
        writer.write_hash(&self.hash);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            inv_type: InvType::from_u32(reader.read_u32()?),
            hash: reader.read_hash()?,
        })
    }

    fn size(&self) -> usize {
        36
    }
}

// Compact-size prefixed list with an explicit item limit
pub(crate) fn read_bounded_list<T: Serializer>(
    reader: &mut Reader,
    max: usize,
) -> Result<Vec<T>, ReaderError> {
    let count = reader.read_compact_size()?;
    if count > max as u64 {
        return Err(ReaderError::SizeTooLarge(count));
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        items.push(T::read(reader)?);
    }
    Ok(items)
}

/// Payload of `getheaders` and `getblocks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocator {
    pub version: u32,
    pub locator_hashes: Vec<Hash>,
    pub stop_hash: Hash,
}

impl BlockLocator {
    pub fn new(locator_hashes: Vec<Hash>, stop_hash: Hash) -> Self {
        Self {
            version: crate::config::PROTOCOL_VERSION as u32,
            locator_hashes,
            stop_hash,
        }
    }
}

impl Serializer for BlockLocator {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.version);
        self.locator_hashes.write(writer);
        writer.write_hash(&self.stop_hash);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            version: reader.read_u32()?,
            locator_hashes: read_bounded_list(reader, MAX_LOCATOR_SIZE)?,
            stop_hash: reader.read_hash()?,
        })
    }
}

// Entry of a `headers` message: a header followed by an empty tx count
pub(crate) fn write_headers(headers: &[BlockHeader], writer: &mut Writer) {
    writer.write_compact_size(headers.len() as u64);
    for header in headers {
        header.write(writer);
        writer.write_compact_size(0);
    }
}

pub(crate) fn read_headers(reader: &mut Reader) -> Result<Vec<BlockHeader>, ReaderError> {
    let count = reader.read_compact_size()?;
    if count > MAX_HEADERS_RESULTS as u64 {
        return Err(ReaderError::SizeTooLarge(count));
    }
    let mut headers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        headers.push(BlockHeader::read(reader)?);
        if reader.read_compact_size()? != 0 {
            return Err(ReaderError::InvalidValue);
        }
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inv_type_values() {
        assert_eq!(InvType::WitnessTx.to_u32(), 0x4000_0001);
        assert_eq!(InvType::from_u32(0x4000_0002), InvType::WitnessBlock);
        assert_eq!(InvType::from_u32(99), InvType::Unknown(99));
        assert!(InvType::WitnessTx.is_tx());
        assert!(!InvType::CompactBlock.is_block());
    }

    #[test]
    fn test_bounded_list_limit() {
        let mut writer = Writer::new();
        writer.write_compact_size(MAX_INV_SIZE as u64 + 1);
        let bytes = writer.bytes();
        let mut reader = Reader::new(&bytes);
        assert_eq!(
            read_bounded_list::<Inventory>(&mut reader, MAX_INV_SIZE),
            Err(ReaderError::SizeTooLarge(MAX_INV_SIZE as u64 + 1))
        );
    }
}
