// Merkle root calculation for transaction lists

use crate::crypto::{sha256d, Hash};
use crate::transaction::Transaction;

/// Calculate merkle root from a list of transactions
///
/// Leaves are txids. At every level an odd trailing node is paired with
/// itself. A single transaction is its own root.
pub fn calculate_merkle_root(transactions: &[Transaction]) -> Hash {
    if transactions.is_empty() {
        return Hash::zero();
    }

    let mut hashes: Vec<Hash> = transactions.iter().map(|tx| tx.txid()).collect();

    while hashes.len() > 1 {
        let mut next_level = Vec::with_capacity(hashes.len().div_ceil(2));
        for chunk in hashes.chunks(2) {
            let left = &chunk[0];
            let right = chunk.get(1).unwrap_or(left);
            next_level.push(hash_pair(left, right));
        }
        hashes = next_level;
    }

    hashes[0]
}

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(left.as_bytes());
    bytes[32..].copy_from_slice(right.as_bytes());
    sha256d(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{OutPoint, TxIn, TxOut};

    fn tx(tag: u32) -> Transaction {
        Transaction::new(
            vec![TxIn::new(OutPoint::new(Hash::zero(), tag))],
            vec![TxOut::new(tag as u64, vec![0x51])],
        )
    }

    #[test]
    fn test_single_transaction_root_is_txid() {
        let single = tx(1);
        assert_eq!(calculate_merkle_root(&[single.clone()]), single.txid());
    }

    #[test]
    fn test_odd_level_duplicates_last() {
        let three = [tx(1), tx(2), tx(3)];
        let four = [tx(1), tx(2), tx(3), tx(3)];
        assert_eq!(calculate_merkle_root(&three), calculate_merkle_root(&four));
    }

    #[test]
    fn test_order_matters() {
        assert_ne!(
            calculate_merkle_root(&[tx(1), tx(2)]),
            calculate_merkle_root(&[tx(2), tx(1)])
        );
    }
}
