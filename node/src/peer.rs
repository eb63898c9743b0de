use crate::PeerId;
use crate::error::PeerError;
use crate::node::Node;
use async_trait::async_trait;
use log::debug;
use meridian_core::{Block, BlockHash, Transaction};
use std::sync::{Arc, Weak};

/// Remote view of another node. Every call may fail transiently.
#[async_trait]
pub trait Peer: Send + Sync {
    fn id(&self) -> &str;

    /// `Ok(None)` when the peer does not hold `hash`.
    async fn get_block(&self, hash: &str) -> Result<Option<Block>, PeerError>;

    async fn get_last_block_hash(&self) -> Result<BlockHash, PeerError>;

    /// Tell the peer that `sender` has a new tip. Returns once the peer has
    /// finished handling it; the outcome on the remote side is not reported.
    async fn notify_of_block(&self, sender: &str, hash: &str) -> Result<(), PeerError>;

    async fn submit_transaction(&self, sender: &str, tx: Transaction) -> Result<(), PeerError>;
}

/// In-process peer backed by another [`Node`].
///
/// Holds a weak reference so two connected nodes do not keep each other alive.
pub struct LocalPeer {
    id: PeerId,
    node: Weak<Node>,
}

impl LocalPeer {
    pub fn new(node: &Arc<Node>) -> Self {
        Self {
            id: node.id().to_string(),
            node: Arc::downgrade(node),
        }
    }

    fn node(&self) -> Result<Arc<Node>, PeerError> {
        self.node
            .upgrade()
            .ok_or_else(|| PeerError::Disconnected(self.id.clone()))
    }
}

#[async_trait]
impl Peer for LocalPeer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get_block(&self, hash: &str) -> Result<Option<Block>, PeerError> {
        Ok(self.node()?.get_block(hash))
    }

    async fn get_last_block_hash(&self) -> Result<BlockHash, PeerError> {
        Ok(self.node()?.get_latest_hash())
    }

    async fn notify_of_block(&self, sender: &str, hash: &str) -> Result<(), PeerError> {
        let node = self.node()?;
        if let Err(e) = node.notify_of_block(sender, hash).await {
            debug!("[{}] notification {} from {} dropped: {}", self.id, hash, sender, e);
        }
        Ok(())
    }

    async fn submit_transaction(&self, sender: &str, tx: Transaction) -> Result<(), PeerError> {
        let node = self.node()?;
        if let Err(e) = node.receive_transaction(sender, tx) {
            debug!("[{}] transaction from {} not admitted: {}", self.id, sender, e);
        }
        Ok(())
    }
}
