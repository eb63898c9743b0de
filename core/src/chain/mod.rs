use crate::block::{Block, BlockHash};
use crate::error::ChainError;
use crate::transaction::TxId;
use crate::utxo::{OutPoint, Utxo};
use std::collections::HashMap;

struct StoredBlock {
    block: Block,
    height: u64,
}

/// The node's accepted chain, genesis to tip.
///
/// Blocks live in an arena keyed by hash and link to their parent through
/// `header.previous_hash`; `order` holds the hashes by height. Only blocks of
/// the current chain are kept: a splice drops the abandoned suffix.
pub struct ChainStore {
    entries: HashMap<BlockHash, StoredBlock>,
    order: Vec<BlockHash>,
    /// txid -> hash of the current-chain block that includes it
    tx_index: HashMap<TxId, BlockHash>,
}

impl ChainStore {
    pub fn new(genesis: Block) -> Result<Self, ChainError> {
        if !genesis.is_genesis() {
            return Err(ChainError::BadGenesis(genesis.hash));
        }
        let mut store = ChainStore {
            entries: HashMap::new(),
            order: Vec::new(),
            tx_index: HashMap::new(),
        };
        store.push_unchecked(genesis);
        Ok(store)
    }

    fn push_unchecked(&mut self, block: Block) {
        let height = self.order.len() as u64;
        for tx in &block.transactions {
            self.tx_index.insert(tx.txid.clone(), block.hash.clone());
        }
        self.order.push(block.hash.clone());
        self.entries
            .insert(block.hash.clone(), StoredBlock { block, height });
    }

    pub fn genesis_hash(&self) -> &str {
        &self.order[0]
    }

    pub fn tip_hash(&self) -> &str {
        &self.order[self.order.len() - 1]
    }

    pub fn tip_height(&self) -> u64 {
        (self.order.len() - 1) as u64
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Always false: a chain holds at least its genesis block.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn block(&self, hash: &str) -> Option<&Block> {
        self.entries.get(hash).map(|e| &e.block)
    }

    pub fn height_of(&self, hash: &str) -> Option<u64> {
        self.entries.get(hash).map(|e| e.height)
    }

    pub fn block_at(&self, height: u64) -> Option<&Block> {
        self.order
            .get(height as usize)
            .and_then(|hash| self.block(hash))
    }

    /// Blocks from genesis to tip.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.order.iter().filter_map(|hash| self.block(hash))
    }

    /// Walk from `hash` back to genesis. Empty if `hash` is not on the chain.
    pub fn ancestors_from<'a>(&'a self, hash: &'a str) -> Ancestors<'a> {
        Ancestors {
            store: self,
            next: Some(hash),
        }
    }

    /// Blocks strictly after `ancestor` up to the tip, in chain order.
    pub fn suffix_after(&self, ancestor: &str) -> Result<Vec<&Block>, ChainError> {
        let height = self
            .height_of(ancestor)
            .ok_or_else(|| ChainError::UnknownAncestor(ancestor.to_string()))?;
        Ok(self.order[height as usize + 1..]
            .iter()
            .filter_map(|hash| self.block(hash))
            .collect())
    }

    /// Height of the current-chain block that includes `txid`.
    pub fn tx_height(&self, txid: &str) -> Option<u64> {
        self.height_of(self.tx_index.get(txid)?)
    }

    /// Output `outpoint` as created on the current chain, whether or not it is spent.
    pub fn find_output(&self, outpoint: &OutPoint) -> Option<Utxo> {
        let block = self.block(self.tx_index.get(&outpoint.txid)?)?;
        let tx = block
            .transactions
            .iter()
            .find(|tx| tx.txid == outpoint.txid)?;
        let out = tx.outputs.get(outpoint.vout as usize)?;
        Some(Utxo::new(
            tx.txid.clone(),
            outpoint.vout,
            out.to.clone(),
            out.amount,
        ))
    }

    /// Drop every block after `ancestor` and append `new_blocks`, which must
    /// link to `ancestor` and to each other. Returns the dropped blocks,
    /// tip first. All checks run before the first mutation.
    pub fn replace_suffix(
        &mut self,
        ancestor: &str,
        new_blocks: Vec<Block>,
    ) -> Result<Vec<Block>, ChainError> {
        let height = self
            .height_of(ancestor)
            .ok_or_else(|| ChainError::UnknownAncestor(ancestor.to_string()))?;

        let mut expected = ancestor;
        for block in &new_blocks {
            if block.header.previous_hash != expected {
                return Err(ChainError::Disconnected {
                    block: block.hash.clone(),
                    expected: expected.to_string(),
                });
            }
            expected = block.hash.as_str();
        }

        let dropped_hashes = self.order.split_off(height as usize + 1);
        let mut dropped = Vec::with_capacity(dropped_hashes.len());
        for hash in dropped_hashes.into_iter().rev() {
            if let Some(entry) = self.entries.remove(&hash) {
                for tx in &entry.block.transactions {
                    self.tx_index.remove(&tx.txid);
                }
                dropped.push(entry.block);
            }
        }

        for block in new_blocks {
            self.push_unchecked(block);
        }
        Ok(dropped)
    }
}

/// Lazy backward traversal produced by [`ChainStore::ancestors_from`].
pub struct Ancestors<'a> {
    store: &'a ChainStore,
    next: Option<&'a str>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a Block;

    fn next(&mut self) -> Option<&'a Block> {
        let hash = self.next.take()?;
        let entry = self.store.entries.get(hash)?;
        if !entry.block.is_genesis() {
            self.next = Some(entry.block.parent_hash());
        }
        Some(&entry.block)
    }
}

/// Weight of a chain segment; the resolver only adopts strictly heavier branches.
pub trait ChainWeight: Send + Sync {
    fn block_weight(&self, block: &Block) -> u64;
}

pub fn segment_weight<'a>(
    weight: &dyn ChainWeight,
    blocks: impl IntoIterator<Item = &'a Block>,
) -> u64 {
    blocks
        .into_iter()
        .fold(0u64, |acc, b| acc.saturating_add(weight.block_weight(b)))
}

/// Every block weighs one: the longest chain wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockCount;

impl ChainWeight for BlockCount {
    fn block_weight(&self, _block: &Block) -> u64 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;

    fn extend(parent: &str, tag: u64) -> Block {
        let cb = Transaction::coinbase_at("miner", 1, tag as i64, tag).unwrap();
        Block::new(parent, vec![cb]).unwrap()
    }

    fn chain_of(len: usize) -> (ChainStore, Vec<Block>) {
        let genesis = Block::genesis("founder", 10).unwrap();
        let mut blocks = vec![genesis.clone()];
        let mut store = ChainStore::new(genesis).unwrap();
        for i in 1..len {
            let b = extend(&blocks[i - 1].hash, i as u64);
            store
                .replace_suffix(&blocks[i - 1].hash, vec![b.clone()])
                .unwrap();
            blocks.push(b);
        }
        (store, blocks)
    }

    #[test]
    fn ancestors_walk_to_genesis() {
        let (store, blocks) = chain_of(4);
        let walked: Vec<&str> = store
            .ancestors_from(store.tip_hash())
            .map(|b| b.hash.as_str())
            .collect();
        let expected: Vec<&str> = blocks.iter().rev().map(|b| b.hash.as_str()).collect();
        assert_eq!(walked, expected);
        assert_eq!(store.ancestors_from("unknown").count(), 0);
    }

    #[test]
    fn heights_follow_order() {
        let (store, blocks) = chain_of(3);
        assert_eq!(store.tip_height(), 2);
        assert_eq!(store.height_of(&blocks[1].hash), Some(1));
        assert_eq!(store.block_at(2).map(|b| &b.hash), Some(&blocks[2].hash));
        assert_eq!(store.height_of("nope"), None);
        assert_eq!(store.genesis_hash(), blocks[0].hash);
    }

    #[test]
    fn replace_suffix_swaps_branch() {
        let (mut store, blocks) = chain_of(3);
        let fork1 = extend(&blocks[0].hash, 100);
        let fork2 = extend(&fork1.hash, 101);
        let fork3 = extend(&fork2.hash, 102);

        let dropped = store
            .replace_suffix(&blocks[0].hash, vec![fork1.clone(), fork2, fork3.clone()])
            .unwrap();
        assert_eq!(dropped, vec![blocks[2].clone(), blocks[1].clone()]);
        assert_eq!(store.tip_hash(), fork3.hash);
        assert_eq!(store.len(), 4);
        assert!(!store.contains(&blocks[1].hash));

        let old_cb = OutPoint::new(blocks[1].transactions[0].txid.clone(), 0);
        assert!(store.find_output(&old_cb).is_none());
        let new_cb = OutPoint::new(fork1.transactions[0].txid.clone(), 0);
        assert_eq!(store.find_output(&new_cb).map(|u| u.amount), Some(1));

        assert_eq!(store.tx_height(&fork1.transactions[0].txid), Some(1));
        assert_eq!(store.tx_height(&blocks[2].transactions[0].txid), None);
        assert_eq!(store.tx_height(&blocks[0].transactions[0].txid), Some(0));
    }

    #[test]
    fn replace_suffix_rejects_bad_input_without_mutation() {
        let (mut store, blocks) = chain_of(2);
        let tip = store.tip_hash().to_string();

        let stray = extend("ff".repeat(32).as_str(), 7);
        assert!(matches!(
            store.replace_suffix(&stray.hash, vec![]),
            Err(ChainError::UnknownAncestor(_))
        ));

        let a = extend(&blocks[0].hash, 8);
        let unlinked = extend(&blocks[0].hash, 9);
        assert!(matches!(
            store.replace_suffix(&blocks[0].hash, vec![a, unlinked]),
            Err(ChainError::Disconnected { .. })
        ));
        assert_eq!(store.tip_hash(), tip);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn suffix_after_and_weight() {
        let (store, blocks) = chain_of(4);
        let suffix = store.suffix_after(&blocks[1].hash).unwrap();
        assert_eq!(suffix.len(), 2);
        assert_eq!(segment_weight(&BlockCount, suffix), 2);
        assert!(store.suffix_after("missing").is_err());
    }
}
