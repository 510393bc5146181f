use crate::{
    crypto::{Hash, Hashable},
    serializer::{Reader, ReaderError, Serializer, Writer},
};

pub const BLOCK_HEADER_SIZE: usize = 80;

// Regtest proof-of-work limit in compact form
pub const REGTEST_BITS: u32 = 0x207f_ffff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_blockhash: Hash,
    pub merkle_root: Hash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn block_hash(&self) -> Hash {
        self.hash()
    }
}

impl Serializer for BlockHeader {
    fn write(&self, writer: &mut Writer) {
        writer.write_i32(self.version);
        writer.write_hash(&self.prev_blockhash);
        writer.write_hash(&self.merkle_root);
        writer.write_u32(self.time);
        writer.write_u32(self.bits);
        writer.write_u32(self.nonce);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            version: reader.read_i32()?,
            prev_blockhash: reader.read_hash()?,
            merkle_root: reader.read_hash()?,
            time: reader.read_u32()?,
            bits: reader.read_u32()?,
            nonce: reader.read_u32()?,
        })
    }

    fn size(&self) -> usize {
        BLOCK_HEADER_SIZE
    }
}

impl Hashable for BlockHeader {}
