use crate::block::BlockHash;
use crate::transaction::TxId;
use crate::utxo::OutPoint;
use thiserror::Error;

/// Failures while hashing, signing or applying ledger data.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to encode for hashing: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("block hash mismatch: computed {computed} != block.hash {claimed}")]
    HashMismatch { computed: BlockHash, claimed: BlockHash },

    #[error("merkle root mismatch in block {0}")]
    MerkleMismatch(BlockHash),

    #[error("txid mismatch: computed {computed} != tx.txid {claimed}")]
    TxIdMismatch { computed: TxId, claimed: TxId },

    #[error("block {block} does not extend {expected}")]
    WrongParent { block: BlockHash, expected: BlockHash },

    #[error("block {block} holds {count} transactions (max {max})")]
    BlockTooLarge {
        block: BlockHash,
        count: usize,
        max: usize,
    },

    #[error("referenced utxo not found {0} (already spent or never existed)")]
    MissingInput(OutPoint),

    #[error("duplicate input in tx {txid}: {outpoint}")]
    DuplicateInput { txid: TxId, outpoint: OutPoint },

    #[error("output {0} cannot be removed while rewinding: not present in snapshot")]
    MissingOutput(OutPoint),

    #[error("output {0} already exists")]
    OutputExists(OutPoint),

    #[error("tx {txid} already appears on the chain or earlier in the branch")]
    DuplicateTxId { txid: TxId },

    #[error("tx {txid} rejected by validator")]
    InvalidTransaction { txid: TxId },

    #[error("tx {txid} carries an invalid signature")]
    BadSignature { txid: TxId },

    #[error("ownership check failed for {outpoint}: expected {expected}, got {got}")]
    WrongOwner {
        outpoint: OutPoint,
        expected: String,
        got: String,
    },

    #[error("amount overflow in tx {txid}")]
    AmountOverflow { txid: TxId },

    #[error("tx {txid} outputs ({outputs}) exceed inputs ({inputs})")]
    Inflation {
        txid: TxId,
        inputs: u64,
        outputs: u64,
    },

    #[error("invalid public key: {0}")]
    InvalidKey(String),
}

/// Chain store failures. `UnknownAncestor` signals an internal inconsistency.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("ancestor {0} is not on the current chain")]
    UnknownAncestor(BlockHash),

    #[error("block {block} does not link to {expected}")]
    Disconnected { block: BlockHash, expected: BlockHash },

    #[error("genesis block {0} must reference the genesis parent hash")]
    BadGenesis(BlockHash),
}

/// Reasons a transaction is refused by the pending pool.
#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("coinbase transaction {0} cannot enter the mempool")]
    Coinbase(TxId),

    #[error("transaction {0} is already pending")]
    AlreadyKnown(TxId),

    #[error("tx {txid} spends unknown or spent output {outpoint}")]
    MissingInput { txid: TxId, outpoint: OutPoint },

    #[error("tx {txid} conflicts with pending tx {other} on {outpoint}")]
    Conflict {
        txid: TxId,
        other: TxId,
        outpoint: OutPoint,
    },

    #[error("tx {0} failed validation")]
    Invalid(TxId),

    #[error("insufficient funds: need {needed}, spendable {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
