use super::Transaction;
use crate::{
    crypto::{sha256d, Hash},
    serializer::Writer,
};

/// Legacy (pre-segwit) signature hash for SIGHASH_ALL style signatures.
///
/// All script_sigs are cleared, the signed input carries `script_code`
/// (the previous output's script_pubkey), and the sighash type is appended
/// as a 4-byte little-endian integer before double hashing.
///
/// Returns `None` when `input_index` is out of range.
pub fn legacy_signature_hash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    sighash_type: u8,
) -> Option<Hash> {
    if input_index >= tx.inputs.len() {
        return None;
    }

    let mut copy = tx.clone();
    for (index, input) in copy.inputs.iter_mut().enumerate() {
        input.witness.clear();
        input.script_sig = if index == input_index {
            script_code.to_vec()
        } else {
            Vec::new()
        };
    }

    let mut writer = Writer::new();
    copy.write_with(&mut writer, false);
    writer.write_u32(sighash_type as u32);
    Some(sha256d(writer.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SIGHASH_ALL;
    use crate::transaction::{OutPoint, TxIn, TxOut};

    fn two_input_tx() -> Transaction {
        Transaction::new(
            vec![
                TxIn::new(OutPoint::new(sha256d(b"a"), 0)),
                TxIn::new(OutPoint::new(sha256d(b"b"), 1)),
            ],
            vec![TxOut::new(1_000, vec![0x51])],
        )
    }

    #[test]
    fn test_sighash_depends_on_input_index() {
        let tx = two_input_tx();
        let first = legacy_signature_hash(&tx, 0, &[0xac], SIGHASH_ALL).unwrap();
        let second = legacy_signature_hash(&tx, 1, &[0xac], SIGHASH_ALL).unwrap();
        assert_ne!(first, second);
        assert!(legacy_signature_hash(&tx, 2, &[0xac], SIGHASH_ALL).is_none());
    }

    #[test]
    fn test_sighash_ignores_existing_script_sigs() {
        let tx = two_input_tx();
        let mut signed = tx.clone();
        signed.inputs[0].script_sig = vec![0x01, 0x02];
        signed.inputs[1].script_sig = vec![0x03];
        assert_eq!(
            legacy_signature_hash(&tx, 0, &[0xac], SIGHASH_ALL),
            legacy_signature_hash(&signed, 0, &[0xac], SIGHASH_ALL)
        );
    }

    #[test]
    fn test_sighash_commits_to_outputs() {
        let tx = two_input_tx();
        let mut changed = tx.clone();
        changed.outputs[0].value -= 1;
        assert_ne!(
            legacy_signature_hash(&tx, 0, &[0xac], SIGHASH_ALL),
            legacy_signature_hash(&changed, 0, &[0xac], SIGHASH_ALL)
        );
    }
}
