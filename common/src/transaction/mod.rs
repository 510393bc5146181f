mod sighash;

pub use sighash::legacy_signature_hash;

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::{
    config::WITNESS_SCALE_FACTOR,
    crypto::{sha256d, Hash},
    serializer::{Reader, ReaderError, Serializer, Writer, MAX_SERIALIZED_SIZE},
};

pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

// Reference to one output of one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, vout: u32) -> Self {
        Self { txid, vout }
    }

    // Outpoint referenced by coinbase inputs
    pub fn null() -> Self {
        Self {
            txid: Hash::zero(),
            vout: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid == Hash::zero() && self.vout == u32::MAX
    }
}

impl Display for OutPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl Serializer for OutPoint {
    fn write(&self, writer: &mut Writer) {
        writer.write_hash(&self.txid);
        writer.write_u32(self.vout);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            txid: reader.read_hash()?,
            vout: reader.read_u32()?,
        })
    }

    fn size(&self) -> usize {
        36
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    // Witness stack, serialized separately from the input itself
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    pub fn new(previous_output: OutPoint) -> Self {
        Self {
            previous_output,
            script_sig: Vec::new(),
            sequence: SEQUENCE_FINAL,
            witness: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: u64, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }
}

impl Serializer for TxOut {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.value);
        writer.write_var_bytes(&self.script_pubkey);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            value: reader.read_u64()?,
            script_pubkey: reader.read_var_bytes()?,
        })
    }
}

/// A transaction in the network's consensus encoding.
///
/// Immutable once signed by convention: builders mutate a local copy, then
/// hand out the finished value. Identifiers are derived from the encoding,
/// so any change to a field changes `txid()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(inputs: Vec<TxIn>, outputs: Vec<TxOut>) -> Self {
        Self {
            version: 2,
            inputs,
            outputs,
            lock_time: 0,
        }
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    // Identifier over the encoding without witness data
    pub fn txid(&self) -> Hash {
        let mut writer = Writer::new();
        self.write_with(&mut writer, false);
        sha256d(writer.as_bytes())
    }

    pub fn wtxid(&self) -> Hash {
        if self.is_coinbase() {
            return Hash::zero();
        }
        sha256d(&self.to_bytes())
    }

    pub fn base_size(&self) -> usize {
        let mut writer = Writer::new();
        self.write_with(&mut writer, false);
        writer.total_write()
    }

    pub fn total_size(&self) -> usize {
        self.size()
    }

    pub fn weight(&self) -> usize {
        self.base_size() * (WITNESS_SCALE_FACTOR - 1) + self.total_size()
    }

    pub fn vsize(&self) -> usize {
        self.weight().div_ceil(WITNESS_SCALE_FACTOR)
    }

    pub fn output_value(&self) -> u64 {
        self.outputs.iter().map(|output| output.value).sum()
    }

    /// Outpoints this transaction spends.
    pub fn spent_outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
        self.inputs.iter().map(|input| input.previous_output)
    }

    /// Outpoints of the outputs this transaction creates.
    pub fn outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
        let txid = self.txid();
        (0..self.outputs.len() as u32).map(move |vout| OutPoint::new(txid, vout))
    }

    pub(crate) fn write_with(&self, writer: &mut Writer, allow_witness: bool) {
        let witness = allow_witness && self.has_witness();
        writer.write_i32(self.version);
        if witness {
            // Extended format marker and flag
            writer.write_u8(0x00);
            writer.write_u8(0x01);
        }
        writer.write_compact_size(self.inputs.len() as u64);
        for input in &self.inputs {
            input.previous_output.write(writer);
            writer.write_var_bytes(&input.script_sig);
            writer.write_u32(input.sequence);
        }
        self.outputs.write(writer);
        if witness {
            for input in &self.inputs {
                writer.write_compact_size(input.witness.len() as u64);
                for item in &input.witness {
                    writer.write_var_bytes(item);
                }
            }
        }
        writer.write_u32(self.lock_time);
    }

    fn read_inputs(reader: &mut Reader) -> Result<Vec<TxIn>, ReaderError> {
        let count = reader.read_compact_size()?;
        if count > MAX_SERIALIZED_SIZE {
            return Err(ReaderError::SizeTooLarge(count));
        }
        let mut inputs = Vec::with_capacity((count as usize).min(reader.size()));
        for _ in 0..count {
            let previous_output = OutPoint::read(reader)?;
            let script_sig = reader.read_var_bytes()?;
            let sequence = reader.read_u32()?;
            inputs.push(TxIn {
                previous_output,
                script_sig,
                sequence,
                witness: Vec::new(),
            });
        }
        Ok(inputs)
    }
}

impl Serializer for Transaction {
    fn write(&self, writer: &mut Writer) {
        self.write_with(writer, true);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let version = reader.read_i32()?;
        let mut inputs = Self::read_inputs(reader)?;
        let mut flags = 0u8;
        let outputs = if inputs.is_empty() {
            // Either an empty transaction or the extended format marker
            flags = reader.read_u8()?;
            if flags != 0 {
                inputs = Self::read_inputs(reader)?;
                Vec::<TxOut>::read(reader)?
            } else {
                Vec::new()
            }
        } else {
            Vec::<TxOut>::read(reader)?
        };

        if flags & 1 != 0 {
            flags ^= 1;
            for input in inputs.iter_mut() {
                let items = reader.read_compact_size()?;
                if items > MAX_SERIALIZED_SIZE {
                    return Err(ReaderError::SizeTooLarge(items));
                }
                let mut stack = Vec::with_capacity((items as usize).min(reader.size()));
                for _ in 0..items {
                    stack.push(reader.read_var_bytes()?);
                }
                input.witness = stack;
            }
            // A witness flag without any witness data is not canonical
            if !inputs.iter().any(|input| !input.witness.is_empty()) {
                return Err(ReaderError::InvalidValue);
            }
        }
        if flags != 0 {
            // Unknown optional data
            return Err(ReaderError::InvalidValue);
        }

        let lock_time = reader.read_u32()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{op_true_script, p2wsh_script};

    fn sample_tx(with_witness: bool) -> Transaction {
        let mut input = TxIn::new(OutPoint::new(sha256d(b"prev"), 3));
        if with_witness {
            input.witness = vec![op_true_script()];
        }
        Transaction::new(
            vec![input],
            vec![TxOut::new(49_000, p2wsh_script(&op_true_script()))],
        )
    }

    #[test]
    fn test_legacy_roundtrip() {
        let tx = sample_tx(false);
        let bytes = tx.to_bytes();
        assert_eq!(Transaction::from_bytes(&bytes).unwrap(), tx);
        assert_eq!(tx.txid(), tx.wtxid());
        assert_eq!(tx.vsize(), bytes.len());
    }

    #[test]
    fn test_witness_roundtrip() {
        let tx = sample_tx(true);
        let bytes = tx.to_bytes();
        // version, marker, flag
        assert_eq!(&bytes[4..6], &[0x00, 0x01]);
        let decoded = Transaction::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, tx);
        assert_ne!(tx.txid(), tx.wtxid());
        // Witness data does not change the txid
        assert_eq!(tx.txid(), sample_tx(false).txid());
    }

    #[test]
    fn test_vsize_discounts_witness() {
        let tx = sample_tx(true);
        // 2 bytes of marker/flag plus 3 bytes of witness are discounted
        let witness_bytes = tx.total_size() - tx.base_size();
        assert_eq!(witness_bytes, 5);
        assert_eq!(tx.vsize(), tx.base_size() + witness_bytes.div_ceil(4));
    }

    #[test]
    fn test_witness_flag_without_witness_rejected() {
        let mut bytes = sample_tx(false).to_bytes();
        // Inject marker + flag after the version with no witness data at the end
        bytes.splice(4..4, [0x00, 0x01]);
        let lock_time_pos = bytes.len() - 4;
        bytes.insert(lock_time_pos, 0x00);
        assert!(Transaction::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_coinbase_detection() {
        let coinbase = Transaction::new(
            vec![TxIn::new(OutPoint::null())],
            vec![TxOut::new(50, op_true_script())],
        );
        assert!(coinbase.is_coinbase());
        assert_eq!(coinbase.wtxid(), Hash::zero());
        assert!(!sample_tx(false).is_coinbase());
    }
}
