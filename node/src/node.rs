use crate::error::NodeError;
use crate::gossip::{GossipDispatcher, GossipMessage};
use crate::peer::{LocalPeer, Peer};
use crate::{NodeSettings, NodeState, PeerId};
use log::{debug, info};
use meridian_core::config::BLOCK_REWARD;
use meridian_core::{
    Block, BlockCount, BlockHash, ChainStore, ChainWeight, LedgerError, Mempool, MempoolError,
    SignatureValidator, Transaction, TransactionInput, TransactionOutput, TxValidator,
    UtxoSet, UtxoSnapshot, WalletKeypair,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// A participant in the network: chain, ledger and mempool behind one lock,
/// plus the peer table used for gossip.
pub struct Node {
    id: PeerId,
    keypair: WalletKeypair,
    pub(crate) settings: NodeSettings,
    pub(crate) state: Mutex<NodeState>,
    /// Serializes block notifications so they are handled one at a time, in arrival order.
    pub(crate) resolving: tokio::sync::Mutex<()>,
    pub(crate) gossip: GossipDispatcher,
    pub(crate) validator: Arc<dyn TxValidator>,
    pub(crate) weight: Arc<dyn ChainWeight>,
}

impl Node {
    /// Node with the default rules: signature validation, longest chain wins.
    pub fn new(
        id: impl Into<PeerId>,
        genesis: Block,
        settings: NodeSettings,
    ) -> Result<Arc<Self>, NodeError> {
        Self::with_rules(
            id,
            genesis,
            settings,
            Arc::new(SignatureValidator),
            Arc::new(BlockCount),
        )
    }

    pub fn with_rules(
        id: impl Into<PeerId>,
        genesis: Block,
        settings: NodeSettings,
        validator: Arc<dyn TxValidator>,
        weight: Arc<dyn ChainWeight>,
    ) -> Result<Arc<Self>, NodeError> {
        let id = id.into();
        let utxo = UtxoSet::replay([&genesis])?;
        let chain = ChainStore::new(genesis)?;

        Ok(Arc::new(Self {
            gossip: GossipDispatcher::new(id.clone()),
            id,
            keypair: WalletKeypair::new(),
            settings,
            state: Mutex::new(NodeState {
                chain,
                utxo,
                mempool: Mempool::new(),
            }),
            resolving: tokio::sync::Mutex::new(()),
            validator,
            weight,
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn keypair(&self) -> &WalletKeypair {
        &self.keypair
    }

    pub fn address(&self) -> String {
        self.keypair.address()
    }

    // ---- peers ----

    /// Link two nodes in both directions and let each pull the other's tip.
    pub fn connect(self: &Arc<Self>, other: &Arc<Node>) -> Result<(), NodeError> {
        if Arc::ptr_eq(self, other) || self.id == other.id {
            return Err(NodeError::SelfConnection);
        }
        self.add_peer(Arc::new(LocalPeer::new(other)));
        other.add_peer(Arc::new(LocalPeer::new(self)));

        self.gossip
            .announce_to(other.id(), GossipMessage::NewTip(self.get_latest_hash()));
        other
            .gossip
            .announce_to(self.id(), GossipMessage::NewTip(other.get_latest_hash()));
        info!("[{}] connected to {}", self.id, other.id);
        Ok(())
    }

    pub fn disconnect_from(&self, other: &Node) {
        let a = self.gossip.remove_peer(other.id());
        let b = other.gossip.remove_peer(self.id());
        if a || b {
            info!("[{}] disconnected from {}", self.id, other.id);
        }
    }

    pub fn add_peer(&self, peer: Arc<dyn Peer>) {
        self.gossip.add_peer(peer);
    }

    pub fn remove_peer(&self, id: &str) -> bool {
        self.gossip.remove_peer(id)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.gossip.peer_ids()
    }

    /// Outgoing gossip not yet delivered.
    pub fn gossip_in_flight(&self) -> usize {
        self.gossip.in_flight()
    }

    // ---- queries ----

    pub fn get_latest_hash(&self) -> BlockHash {
        self.state.lock().chain.tip_hash().to_string()
    }

    pub fn height(&self) -> u64 {
        self.state.lock().chain.tip_height()
    }

    pub fn get_block(&self, hash: &str) -> Option<Block> {
        self.state.lock().chain.block(hash).cloned()
    }

    /// Chain from genesis to tip.
    pub fn get_blockchain(&self) -> Vec<Block> {
        self.state.lock().chain.blocks().cloned().collect()
    }

    pub fn get_mempool(&self) -> Vec<Transaction> {
        self.state.lock().mempool.transactions().to_vec()
    }

    pub fn get_utxo(&self) -> UtxoSet {
        self.state.lock().utxo.clone()
    }

    pub fn get_balance(&self, address: &str) -> u64 {
        self.state.lock().utxo.balance_of(address)
    }

    pub fn clear_mempool(&self) {
        self.state.lock().mempool.clear();
    }

    pub(crate) fn knows_block(&self, hash: &str) -> bool {
        self.state.lock().chain.contains(hash)
    }

    // ---- transactions ----

    /// Admit a locally created transaction and relay it to every peer.
    pub fn add_transaction_to_mempool(&self, tx: Transaction) -> Result<(), MempoolError> {
        self.admit(tx, None)
    }

    /// Admit a transaction relayed by `sender` and pass it on to the other peers.
    pub fn receive_transaction(&self, sender: &str, tx: Transaction) -> Result<(), MempoolError> {
        self.admit(tx, Some(sender))
    }

    fn admit(&self, tx: Transaction, from: Option<&str>) -> Result<(), MempoolError> {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state
                .mempool
                .try_insert(tx.clone(), &state.utxo, self.validator.as_ref())?;
        }
        debug!("[{}] admitted transaction {}", self.id, tx.txid);
        self.gossip.relay_transaction(tx, from);
        Ok(())
    }

    /// Build, sign and submit a payment from this node's wallet. Outputs
    /// already spent by pending transactions are not reused.
    pub fn create_transaction(&self, target: &str, amount: u64) -> Result<Transaction, MempoolError> {
        let address = self.address();
        let tx = {
            let state = self.state.lock();
            let mut candidates: Vec<_> = state
                .utxo
                .owned_by(&address)
                .filter(|u| !state.mempool.is_spent(&u.outpoint()))
                .collect();
            candidates.sort_by_key(|u| u.outpoint());

            let mut inputs = Vec::new();
            let mut gathered = 0u64;
            for utxo in candidates {
                if gathered >= amount {
                    break;
                }
                gathered = gathered.saturating_add(utxo.amount);
                inputs.push(TransactionInput::new(utxo.outpoint()));
            }
            if gathered < amount || inputs.is_empty() {
                return Err(MempoolError::InsufficientFunds {
                    needed: amount,
                    available: gathered,
                });
            }

            let mut outputs = vec![TransactionOutput::new(target, amount)];
            if gathered > amount {
                outputs.push(TransactionOutput::new(address.clone(), gathered - amount));
            }
            let mut tx = Transaction::new(inputs, outputs).map_err(LedgerError::from)?;
            tx.sign(&self.keypair).map_err(LedgerError::from)?;
            tx
        };

        self.add_transaction_to_mempool(tx.clone())?;
        Ok(tx)
    }

    // ---- mining ----

    /// Extend the local chain with a block holding a coinbase to this node
    /// and up to `block_size - 1` pending transactions, then announce it.
    pub fn mine_block(&self) -> Result<BlockHash, NodeError> {
        let block = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let coinbase =
                Transaction::coinbase(&self.address(), BLOCK_REWARD).map_err(LedgerError::from)?;
            let picked = self.settings.block_size.saturating_sub(1);
            let mut txs = vec![coinbase];
            txs.extend(state.mempool.transactions().iter().take(picked).cloned());
            let included = txs.len() - 1;

            let tip = state.chain.tip_hash().to_string();
            let block = Block::new(&tip, txs)?;

            let mut snapshot = UtxoSnapshot::new(&state.utxo);
            for tx in &block.transactions {
                snapshot.apply_transaction(tx)?;
            }
            let delta = snapshot.into_delta();

            state.chain.replace_suffix(&tip, vec![block.clone()])?;
            state.utxo.apply_delta(delta);
            state.mempool.take(included);
            block
        };

        info!(
            "[{}] mined block {} with {} transactions",
            self.id,
            block.hash,
            block.transactions.len()
        );
        self.gossip.propagate(&block.hash, None);
        Ok(block.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> NodeSettings {
        NodeSettings {
            block_size: 3,
            fetch_timeout: Duration::from_millis(500),
            ..NodeSettings::default()
        }
    }

    fn genesis() -> Block {
        Block::genesis("nobody", 0).unwrap()
    }

    #[tokio::test]
    async fn connecting_to_itself_is_refused() {
        let node = Node::new("a", genesis(), settings()).unwrap();
        assert!(matches!(node.connect(&node), Err(NodeError::SelfConnection)));
        assert!(node.peers().is_empty());
    }

    #[tokio::test]
    async fn connect_and_disconnect_are_mutual() {
        let a = Node::new("a", genesis(), settings()).unwrap();
        let b = Node::new("b", genesis(), settings()).unwrap();
        a.connect(&b).unwrap();
        assert_eq!(a.peers(), vec!["b".to_string()]);
        assert_eq!(b.peers(), vec!["a".to_string()]);

        a.disconnect_from(&b);
        assert!(a.peers().is_empty());
        assert!(b.peers().is_empty());
    }

    #[tokio::test]
    async fn mining_pays_coinbase_and_drains_mempool_in_order() {
        let node = Node::new("a", genesis(), settings()).unwrap();
        for _ in 0..3 {
            node.mine_block().unwrap();
        }
        assert_eq!(node.height(), 3);
        assert_eq!(node.get_balance(&node.address()), 3);

        let t1 = node.create_transaction("bob", 1).unwrap();
        let t2 = node.create_transaction("carol", 1).unwrap();
        let t3 = node.create_transaction("dave", 1).unwrap();
        assert_eq!(node.get_mempool().len(), 3);

        let hash = node.mine_block().unwrap();
        let block = node.get_block(&hash).unwrap();
        let ids: Vec<_> = block.transactions[1..].iter().map(|t| t.txid.clone()).collect();
        assert_eq!(ids, vec![t1.txid, t2.txid]);
        assert_eq!(node.get_mempool(), vec![t3]);
        assert_eq!(node.get_balance("bob"), 1);
        assert_eq!(
            node.get_utxo(),
            UtxoSet::replay(node.get_blockchain().iter()).unwrap()
        );
    }

    #[tokio::test]
    async fn pending_outputs_are_not_spent_twice() {
        let node = Node::new("a", genesis(), settings()).unwrap();
        node.mine_block().unwrap();

        let tx = node.create_transaction("bob", 1).unwrap();
        assert!(matches!(
            node.create_transaction("carol", 1),
            Err(MempoolError::InsufficientFunds { needed: 1, available: 0 })
        ));
        assert!(matches!(
            node.add_transaction_to_mempool(tx),
            Err(MempoolError::AlreadyKnown(_))
        ));

        node.clear_mempool();
        assert!(node.get_mempool().is_empty());
        node.create_transaction("carol", 1).unwrap();
    }

    #[tokio::test]
    async fn paid_outputs_leave_the_wallet() {
        let node = Node::new("a", genesis(), settings()).unwrap();
        node.mine_block().unwrap();
        node.mine_block().unwrap();

        let tx = node.create_transaction("bob", 1).unwrap();
        assert!(tx.verify_signatures().unwrap());
        node.mine_block().unwrap();
        node.mine_block().unwrap();

        assert_eq!(node.get_balance("bob"), 1);
        // two rewards before, two after, one paid away
        assert_eq!(node.get_balance(&node.address()), 3);
    }
}
