pub mod error;
pub mod gossip;
pub mod network;
pub mod node;
pub mod peer;
pub mod resolver;

pub use error::{NodeError, PeerError, ResolveError};
pub use gossip::{GossipDispatcher, GossipMessage};
pub use network::LocalNetwork;
pub use node::Node;
pub use peer::{LocalPeer, Peer};
pub use resolver::{Reorg, ResolveOutcome};

use meridian_config::Config;
use meridian_core::{ChainStore, Mempool, UtxoSet};
use std::time::Duration;

pub type PeerId = String;

/// Everything a reorg must change together. Guarded by a single lock on the node.
pub struct NodeState {
    pub chain: ChainStore,
    pub utxo: UtxoSet,
    pub mempool: Mempool,
}

/// Node tunables, normally derived from [`Config`].
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub block_size: usize,
    pub max_branch_len: usize,
    pub max_resolve_attempts: usize,
    pub fetch_timeout: Duration,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for NodeSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            block_size: cfg.block_size.max(1),
            max_branch_len: cfg.max_branch_len.max(1),
            max_resolve_attempts: cfg.max_resolve_attempts.max(1),
            fetch_timeout: Duration::from_millis(cfg.fetch_timeout_ms),
        }
    }
}
