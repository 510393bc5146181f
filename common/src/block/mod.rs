mod header;
mod merkle;

pub use header::{BlockHeader, BLOCK_HEADER_SIZE, REGTEST_BITS};
pub use merkle::calculate_merkle_root;

use crate::{
    crypto::Hash,
    serializer::{Reader, ReaderError, Serializer, Writer},
    transaction::Transaction,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.block_hash()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    // Whether the header commits to the carried transactions
    pub fn check_merkle_root(&self) -> bool {
        self.header.merkle_root == calculate_merkle_root(&self.transactions)
    }
}

impl Serializer for Block {
    fn write(&self, writer: &mut Writer) {
        self.header.write(writer);
        self.transactions.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            header: BlockHeader::read(reader)?,
            transactions: Vec::<Transaction>::read(reader)?,
        })
    }
}
