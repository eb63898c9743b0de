pub mod block;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod error;
pub mod mempool;
pub mod transaction;
pub mod utxo;
pub mod validation;

// Explicit re-exports to avoid ambiguous glob re-exports
pub use block::{Block, BlockHash, BlockHeader, compute_header_hash, compute_merkle_root};
pub use chain::{BlockCount, ChainStore, ChainWeight, segment_weight};
pub use crypto::WalletKeypair;
pub use error::{ChainError, LedgerError, MempoolError};
pub use mempool::{Mempool, reconcile};
pub use transaction::{Transaction, TransactionInput, TransactionOutput, TxId};
pub use utxo::{OutPoint, Utxo, UtxoDelta, UtxoSet, UtxoSnapshot, UtxoView};
pub use validation::{SignatureValidator, TxValidator};
