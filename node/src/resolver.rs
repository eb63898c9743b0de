//! Fork resolution.
//!
//! A node told about a block it does not have walks the sender's chain
//! backwards until it reaches a block it holds (the intersection). If the
//! sender's branch past the intersection outweighs the local one, the branch
//! is replayed on a rewound snapshot of the ledger, block by block, and cut
//! at the first block that fails. The surviving prefix replaces the local
//! suffix only if it is still strictly heavier. Chain, ledger and mempool
//! change together under the node lock, or not at all.
//!
//! Fetching happens without the node lock. If the local tip moved in the
//! meantime, resolution starts over against the new tip.
//!
//! A transaction id appears at most once on a chain: a branch block that
//! repeats a txid from the shared prefix, from an earlier branch block, or
//! from within itself does not connect.

use crate::error::{PeerError, ResolveError};
use crate::node::Node;
use crate::peer::Peer;
use crate::NodeState;
use log::{debug, error, info, warn};
use meridian_core::config::GENESIS_PARENT_HASH;
use meridian_core::{
    Block, BlockHash, ChainError, ChainStore, LedgerError, TxId, Utxo, UtxoDelta, UtxoSnapshot,
    compute_header_hash, reconcile, segment_weight,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reorg {
    /// Deepest block shared by both chains.
    pub intersection: BlockHash,
    pub new_tip: BlockHash,
    pub removed: usize,
    pub added: usize,
    pub readmitted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The announced block is already on the local chain.
    AlreadyKnown,
    /// The announced branch is not heavier than the local one. Ties keep the local chain.
    NotLonger { own: u64, other: u64 },
    /// The branch had to be cut at an invalid block and what remained was not heavier.
    Truncated { own: u64, valid: u64 },
    Reorganized(Reorg),
}

/// Blocks fetched from a peer, oldest first. The first one links to `intersection`.
struct FetchedBranch {
    /// Local tip when the fetch started.
    local_tip: BlockHash,
    intersection: BlockHash,
    blocks: Vec<Block>,
}

impl Node {
    /// Handle "peer `sender` has new tip `hash`". Notifications are processed
    /// one at a time in arrival order.
    pub async fn notify_of_block(
        &self,
        sender: &str,
        hash: &str,
    ) -> Result<ResolveOutcome, ResolveError> {
        let Some(peer) = self.gossip.peer(sender) else {
            return Err(PeerError::Disconnected(sender.to_string()).into());
        };

        let result = self.resolve(peer, hash).await;
        match &result {
            Ok(outcome) => debug!("[{}] block {} from {}: {:?}", self.id(), hash, sender, outcome),
            Err(e @ ResolveError::NoCommonAncestor { .. }) => {
                error!("[{}] {}; dropping peer", self.id(), e);
                self.remove_peer(sender);
            }
            Err(e @ (ResolveError::Internal(_) | ResolveError::Ledger(_))) => {
                error!("[{}] block {} from {}: {}", self.id(), hash, sender, e)
            }
            Err(e) => warn!("[{}] block {} from {} ignored: {}", self.id(), hash, sender, e),
        }
        result
    }

    /// Run fork resolution against `peer` for its announced tip `announced`.
    pub async fn resolve(
        &self,
        peer: Arc<dyn Peer>,
        announced: &str,
    ) -> Result<ResolveOutcome, ResolveError> {
        let _turn = self.resolving.lock().await;
        let attempts = self.settings.max_resolve_attempts;

        for attempt in 1..=attempts {
            if self.knows_block(announced) {
                return Ok(ResolveOutcome::AlreadyKnown);
            }

            let local_tip = self.get_latest_hash();
            let fetched = self.fetch_branch(peer.as_ref(), announced, local_tip).await?;

            let outcome = {
                let mut guard = self.state.lock();
                match self.try_adopt(&mut guard, fetched)? {
                    Some(outcome) => outcome,
                    None => {
                        debug!(
                            "[{}] local tip moved during fetch from {} (attempt {}/{})",
                            self.id(),
                            peer.id(),
                            attempt,
                            attempts
                        );
                        continue;
                    }
                }
            };

            if let ResolveOutcome::Reorganized(reorg) = &outcome {
                self.gossip.propagate(&reorg.new_tip, Some(peer.id()));
            }
            return Ok(outcome);
        }

        Err(ResolveError::Contention(attempts))
    }

    /// Walk the peer's chain backwards from `announced` to the first block held locally.
    async fn fetch_branch(
        &self,
        peer: &dyn Peer,
        announced: &str,
        local_tip: BlockHash,
    ) -> Result<FetchedBranch, ResolveError> {
        let mut blocks = Vec::new();
        let mut cursor = announced.to_string();

        loop {
            if self.knows_block(&cursor) {
                break;
            }
            if cursor == GENESIS_PARENT_HASH {
                return Err(ResolveError::NoCommonAncestor {
                    peer: peer.id().to_string(),
                    hash: announced.to_string(),
                });
            }
            if blocks.len() >= self.settings.max_branch_len {
                return Err(ResolveError::BranchTooLong {
                    peer: peer.id().to_string(),
                    limit: self.settings.max_branch_len,
                });
            }

            let block = self.fetch_block(peer, &cursor).await?;
            cursor = block.header.previous_hash.clone();
            blocks.push(block);
        }

        blocks.reverse();
        Ok(FetchedBranch {
            local_tip,
            intersection: cursor,
            blocks,
        })
    }

    async fn fetch_block(&self, peer: &dyn Peer, hash: &str) -> Result<Block, ResolveError> {
        let peer_id = || peer.id().to_string();
        let block = match timeout(self.settings.fetch_timeout, peer.get_block(hash)).await {
            Err(_) => return Err(PeerError::Timeout(peer_id()).into()),
            Ok(result) => result?.ok_or_else(|| PeerError::NotFound {
                peer: peer_id(),
                hash: hash.to_string(),
            })?,
        };

        let got = compute_header_hash(&block.header)?;
        if got != hash || block.hash != hash {
            return Err(ResolveError::PeerMisbehaved {
                peer: peer_id(),
                requested: hash.to_string(),
                got,
            });
        }
        Ok(block)
    }

    /// Decide on a fetched branch under the node lock. `None` means the
    /// local tip moved since the fetch started.
    fn try_adopt(
        &self,
        state: &mut NodeState,
        fetched: FetchedBranch,
    ) -> Result<Option<ResolveOutcome>, ResolveError> {
        if state.chain.tip_hash() != fetched.local_tip {
            return Ok(None);
        }
        let Ok(own_suffix) = state.chain.suffix_after(&fetched.intersection) else {
            return Ok(None);
        };
        let own = segment_weight(self.weight.as_ref(), own_suffix);
        let other = segment_weight(self.weight.as_ref(), &fetched.blocks);
        debug!(
            "[{}] fork at {}: own {} other {}",
            self.id(),
            fetched.intersection,
            own,
            other
        );
        if other <= own {
            return Ok(Some(ResolveOutcome::NotLonger { own, other }));
        }

        let (valid, delta) = self.replay_branch(state, &fetched.intersection, fetched.blocks)?;
        let valid_weight = segment_weight(self.weight.as_ref(), &valid);
        if valid_weight <= own {
            return Ok(Some(ResolveOutcome::Truncated {
                own,
                valid: valid_weight,
            }));
        }

        let reorg = self.commit(state, &fetched.intersection, valid, delta)?;
        info!(
            "[{}] reorganized at {}: -{} +{} blocks, new tip {}",
            self.id(),
            reorg.intersection,
            reorg.removed,
            reorg.added,
            reorg.new_tip
        );
        Ok(Some(ResolveOutcome::Reorganized(reorg)))
    }

    /// Rewind a snapshot to the intersection, then apply `branch` on it until
    /// the first block that does not connect. Returns the accepted prefix and
    /// the ledger change relative to the committed set.
    fn replay_branch(
        &self,
        state: &NodeState,
        intersection: &str,
        branch: Vec<Block>,
    ) -> Result<(Vec<Block>, UtxoDelta), ResolveError> {
        let mut snapshot = UtxoSnapshot::new(&state.utxo);

        for block in state.chain.suffix_after(intersection)?.into_iter().rev() {
            for tx in block.transactions.iter().rev() {
                let restored = tx
                    .outpoints()
                    .map(|op| state.chain.find_output(&op).ok_or(LedgerError::MissingOutput(op)))
                    .collect::<Result<Vec<Utxo>, _>>()?;
                snapshot.unapply_transaction(tx, &restored)?;
            }
        }

        let fork_height = state
            .chain
            .height_of(intersection)
            .ok_or_else(|| ChainError::UnknownAncestor(intersection.to_string()))?;
        let mut branch_txids: HashSet<TxId> = HashSet::new();

        let mut parent = intersection.to_string();
        let mut valid = Vec::with_capacity(branch.len());
        for block in branch {
            let connected = match repeated_txid(&state.chain, fork_height, &branch_txids, &block) {
                Some(txid) => Err(LedgerError::DuplicateTxId { txid }),
                None => self.connect_block(&mut snapshot, &block, &parent),
            };
            if let Err(e) = connected {
                warn!(
                    "[{}] branch cut at block {} (height {} past fork): {}",
                    self.id(),
                    block.hash,
                    valid.len() + 1,
                    e
                );
                break;
            }
            branch_txids.extend(block.transactions.iter().map(|tx| tx.txid.clone()));
            parent = block.hash.clone();
            valid.push(block);
        }

        Ok((valid, snapshot.into_delta()))
    }

    /// Check one block and apply its transactions. On failure the snapshot is
    /// left as it was before the block.
    fn connect_block(
        &self,
        snapshot: &mut UtxoSnapshot<'_>,
        block: &Block,
        parent: &str,
    ) -> Result<(), LedgerError> {
        if block.parent_hash() != parent {
            return Err(LedgerError::WrongParent {
                block: block.hash.clone(),
                expected: parent.to_string(),
            });
        }
        block.verify_integrity()?;
        if block.transactions.len() > self.settings.block_size {
            return Err(LedgerError::BlockTooLarge {
                block: block.hash.clone(),
                count: block.transactions.len(),
                max: self.settings.block_size,
            });
        }

        let mut applied: Vec<(usize, Vec<Utxo>)> = Vec::new();
        for (i, tx) in block.transactions.iter().enumerate() {
            let result = if self.validator.is_valid(tx, &*snapshot) {
                snapshot.apply_transaction(tx)
            } else {
                Err(LedgerError::InvalidTransaction {
                    txid: tx.txid.clone(),
                })
            };
            match result {
                Ok(consumed) => applied.push((i, consumed)),
                Err(e) => {
                    for (j, consumed) in applied.iter().rev() {
                        snapshot.unapply_transaction(&block.transactions[*j], consumed)?;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn commit(
        &self,
        state: &mut NodeState,
        intersection: &str,
        valid: Vec<Block>,
        delta: UtxoDelta,
    ) -> Result<Reorg, ResolveError> {
        let new_tip = valid
            .last()
            .map(|b| b.hash.clone())
            .unwrap_or_else(|| intersection.to_string());
        let added = valid.len();

        let removed = state.chain.replace_suffix(intersection, valid)?;
        state.utxo.apply_delta(delta);

        let pool = std::mem::take(&mut state.mempool);
        state.mempool = reconcile(pool, &state.utxo);
        let readmitted = state.mempool.readmit(
            removed
                .iter()
                .rev()
                .flat_map(|b| b.transactions.iter().cloned()),
            &state.utxo,
            self.validator.as_ref(),
        );

        Ok(Reorg {
            intersection: intersection.to_string(),
            new_tip,
            removed: removed.len(),
            added,
            readmitted,
        })
    }
}

/// First txid of `block` that already appears at or below `fork_height` on
/// `chain`, in `seen`, or earlier in the block itself.
fn repeated_txid(
    chain: &ChainStore,
    fork_height: u64,
    seen: &HashSet<TxId>,
    block: &Block,
) -> Option<TxId> {
    let mut in_block = HashSet::new();
    block
        .transactions
        .iter()
        .map(|tx| &tx.txid)
        .find(|txid| {
            !in_block.insert(txid.as_str())
                || seen.contains(txid.as_str())
                || chain.tx_height(txid).is_some_and(|h| h <= fork_height)
        })
        .cloned()
}
