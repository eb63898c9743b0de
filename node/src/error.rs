use crate::PeerId;
use meridian_core::{BlockHash, ChainError, LedgerError, MempoolError};
use thiserror::Error;

/// Failures talking to a peer. All of them are transient.
#[derive(Debug, Clone, Error)]
pub enum PeerError {
    #[error("peer {0} is disconnected")]
    Disconnected(PeerId),

    #[error("peer {peer} has no block {hash}")]
    NotFound { peer: PeerId, hash: BlockHash },

    #[error("request to peer {0} timed out")]
    Timeout(PeerId),
}

/// Why a block notification was dropped without changing node state.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Fatal for the peer relationship: the chains do not share genesis.
    #[error("no common ancestor with peer {peer} below {hash}")]
    NoCommonAncestor { peer: PeerId, hash: BlockHash },

    #[error("peer unreachable: {0}")]
    PeerUnreachable(#[from] PeerError),

    #[error("peer {peer} answered request for {requested} with a block hashing to {got}")]
    PeerMisbehaved {
        peer: PeerId,
        requested: BlockHash,
        got: BlockHash,
    },

    #[error("branch from peer {peer} exceeds {limit} unknown blocks")]
    BranchTooLong { peer: PeerId, limit: usize },

    #[error("local tip kept moving during resolution; gave up after {0} attempts")]
    Contention(usize),

    #[error("chain store inconsistency: {0}")]
    Internal(#[from] ChainError),

    #[error("ledger error during resolution: {0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Trying to establish connection with itself.")]
    SelfConnection,

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Mempool(#[from] MempoolError),
}
