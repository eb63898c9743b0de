use crate::config::{GENESIS_PARENT_HASH, GENESIS_TIMESTAMP};
use crate::error::LedgerError;
use crate::transaction::{Transaction, TxId};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex encoded double sha256 of a block header.
pub type BlockHash = String;

/// block header
#[derive(Encode, Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub previous_hash: BlockHash, // hex
    pub merkle_root: String,      // hex
    pub timestamp: i64,           // unix seconds
    pub nonce: u64,
}

/// A block is immutable once built: `hash` always commits to `header`, and the
/// header's merkle root commits to `transactions`.
#[derive(Encode, Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub hash: BlockHash, // hex string (computed from serialized header)
}

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let h1 = Sha256::digest(data);
    let h2 = Sha256::digest(h1);
    let mut out = [0u8; 32];
    out.copy_from_slice(&h2);
    out
}

pub fn to_hex(hash: &[u8; 32]) -> String {
    hex::encode(hash)
}

/// Deterministic serialization: use bincode (v2 Encode trait)
pub fn serialize_header(header: &BlockHeader) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let config = bincode::config::standard().with_fixed_int_encoding(); // u64 = 8 bytes
    bincode::encode_to_vec(header, config)
}

/// Compute hash from the header (sha256d)
pub fn compute_header_hash(header: &BlockHeader) -> Result<BlockHash, LedgerError> {
    let bytes = serialize_header(header)?;
    Ok(to_hex(&sha256d(&bytes)))
}

/// Compute merkle root (assuming txids are in hex format)
pub fn compute_merkle_root(txids: &[TxId]) -> String {
    if txids.is_empty() {
        return to_hex(&sha256d(&[]));
    }

    let mut leaves: Vec<[u8; 32]> = txids
        .iter()
        .map(|h| {
            let b = hex::decode(h).unwrap_or_default();
            let mut a = [0u8; 32];
            if b.len() == 32 {
                a.copy_from_slice(&b);
            }
            a
        })
        .collect();

    while leaves.len() > 1 {
        if leaves.len() % 2 == 1 {
            let last = leaves[leaves.len() - 1];
            leaves.push(last);
        }

        leaves = leaves
            .chunks_exact(2)
            .map(|pair| {
                let mut concat = [0u8; 64];
                concat[..32].copy_from_slice(&pair[0]);
                concat[32..].copy_from_slice(&pair[1]);
                sha256d(&concat)
            })
            .collect();
    }

    to_hex(&leaves[0])
}

impl Block {
    /// Build a block on top of `previous_hash`.
    pub fn new(previous_hash: &str, transactions: Vec<Transaction>) -> Result<Self, LedgerError> {
        Self::assemble(
            previous_hash,
            transactions,
            chrono::Utc::now().timestamp(),
            rand::random(),
        )
    }

    fn assemble(
        previous_hash: &str,
        transactions: Vec<Transaction>,
        timestamp: i64,
        nonce: u64,
    ) -> Result<Self, LedgerError> {
        let txids: Vec<TxId> = transactions.iter().map(|t| t.txid.clone()).collect();
        let header = BlockHeader {
            previous_hash: previous_hash.to_string(),
            merkle_root: compute_merkle_root(&txids),
            timestamp,
            nonce,
        };
        let hash = compute_header_hash(&header)?;
        Ok(Block {
            header,
            transactions,
            hash,
        })
    }

    /// Deterministic genesis block paying `amount` to `address`.
    pub fn genesis(address: &str, amount: u64) -> Result<Self, LedgerError> {
        let cb = Transaction::coinbase_at(address, amount, GENESIS_TIMESTAMP, 0)?;
        Self::assemble(GENESIS_PARENT_HASH, vec![cb], GENESIS_TIMESTAMP, 0)
    }

    pub fn is_genesis(&self) -> bool {
        self.header.previous_hash == GENESIS_PARENT_HASH
    }

    pub fn parent_hash(&self) -> &str {
        &self.header.previous_hash
    }

    /// Recompute header hash, merkle root and every txid from the block's content.
    pub fn verify_integrity(&self) -> Result<(), LedgerError> {
        let computed = compute_header_hash(&self.header)?;
        if computed != self.hash {
            return Err(LedgerError::HashMismatch {
                computed,
                claimed: self.hash.clone(),
            });
        }

        for tx in &self.transactions {
            tx.verify_txid()?;
        }

        let txids: Vec<TxId> = self.transactions.iter().map(|t| t.txid.clone()).collect();
        if compute_merkle_root(&txids) != self.header.merkle_root {
            return Err(LedgerError::MerkleMismatch(self.hash.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merkle_two() {
        let a = "00".repeat(32);
        let b = "11".repeat(32);
        let root = compute_merkle_root(&[a.clone(), b.clone()]);
        assert_eq!(root.len(), 64);
        assert_ne!(root, compute_merkle_root(&[b, a]));
    }

    #[test]
    fn merkle_odd_duplicates_last() {
        let a = "aa".repeat(32);
        let b = "bb".repeat(32);
        let c = "cc".repeat(32);
        assert_eq!(
            compute_merkle_root(&[a.clone(), b.clone(), c.clone()]),
            compute_merkle_root(&[a, b, c.clone(), c])
        );
    }

    #[test]
    fn genesis_is_deterministic() {
        let g1 = Block::genesis("founder", 100).unwrap();
        let g2 = Block::genesis("founder", 100).unwrap();
        assert_eq!(g1.hash, g2.hash);
        assert!(g1.is_genesis());
        assert_ne!(g1.hash, Block::genesis("someone", 100).unwrap().hash);
    }

    #[test]
    fn integrity_detects_tampering() {
        let genesis = Block::genesis("founder", 100).unwrap();
        let cb = Transaction::coinbase("miner", 1).unwrap();
        let mut block = Block::new(&genesis.hash, vec![cb]).unwrap();
        assert!(block.verify_integrity().is_ok());
        assert_eq!(block.parent_hash(), genesis.hash);

        block.transactions[0] = Transaction::coinbase("thief", 1).unwrap();
        assert!(matches!(
            block.verify_integrity(),
            Err(LedgerError::MerkleMismatch(_))
        ));

        let mut forged = genesis.clone();
        forged.header.nonce += 1;
        assert!(matches!(
            forged.verify_integrity(),
            Err(LedgerError::HashMismatch { .. })
        ));
    }
}
