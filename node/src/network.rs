use crate::error::NodeError;
use crate::node::Node;
use crate::NodeSettings;
use log::debug;
use meridian_core::Block;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// A set of nodes sharing one genesis, wired together in-process.
pub struct LocalNetwork {
    nodes: Vec<Arc<Node>>,
}

impl LocalNetwork {
    /// `count` unconnected nodes named `node-0`, `node-1`, ...
    pub fn new(count: usize, genesis: &Block, settings: &NodeSettings) -> Result<Self, NodeError> {
        let nodes = (0..count)
            .map(|i| Node::new(format!("node-{}", i), genesis.clone(), settings.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&Arc<Node>> {
        self.nodes.get(index)
    }

    /// node-0 - node-1 - ... - node-n
    pub fn connect_line(&self) -> Result<(), NodeError> {
        for pair in self.nodes.windows(2) {
            pair[0].connect(&pair[1])?;
        }
        Ok(())
    }

    pub fn connect_all(&self) -> Result<(), NodeError> {
        for (i, a) in self.nodes.iter().enumerate() {
            for b in &self.nodes[i + 1..] {
                a.connect(b)?;
            }
        }
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.nodes.iter().map(|n| n.gossip_in_flight()).sum()
    }

    /// Wait until no gossip is queued or being delivered anywhere.
    /// Returns false if that did not happen within `limit`.
    pub async fn settle(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        let mut quiet = 0;
        while Instant::now() < deadline {
            if self.in_flight() == 0 {
                quiet += 1;
                if quiet >= 3 {
                    return true;
                }
            } else {
                quiet = 0;
            }
            sleep(Duration::from_millis(10)).await;
        }
        debug!("network still busy after {:?}: {} in flight", limit, self.in_flight());
        false
    }

    /// Every node has the same tip.
    pub fn converged(&self) -> bool {
        let mut tips = self.nodes.iter().map(|n| n.get_latest_hash());
        match tips.next() {
            Some(first) => tips.all(|t| t == first),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::UtxoSet;

    const SETTLE: Duration = Duration::from_secs(10);

    fn settings() -> NodeSettings {
        NodeSettings {
            block_size: 5,
            fetch_timeout: Duration::from_secs(1),
            ..NodeSettings::default()
        }
    }

    fn network(count: usize) -> LocalNetwork {
        let genesis = Block::genesis("nobody", 0).unwrap();
        LocalNetwork::new(count, &genesis, &settings()).unwrap()
    }

    fn assert_consistent(net: &LocalNetwork) {
        for node in net.nodes() {
            let replayed = UtxoSet::replay(node.get_blockchain().iter()).unwrap();
            assert_eq!(node.get_utxo(), replayed, "{} ledger diverged from its chain", node.id());
        }
    }

    #[tokio::test]
    async fn longest_partition_wins_after_joining() {
        let net = network(4);
        for _ in 0..2 {
            net.node(0).unwrap().mine_block().unwrap();
        }
        for _ in 0..3 {
            net.node(2).unwrap().mine_block().unwrap();
        }
        let winner = net.node(2).unwrap().get_latest_hash();

        net.connect_line().unwrap();
        assert!(net.settle(SETTLE).await);

        assert!(net.converged());
        assert_eq!(net.node(0).unwrap().get_latest_hash(), winner);
        assert_eq!(net.node(3).unwrap().height(), 3);
        assert_consistent(&net);
    }

    #[tokio::test]
    async fn mined_block_reaches_every_node() {
        let net = network(5);
        net.connect_line().unwrap();
        assert!(net.settle(SETTLE).await);

        let hash = net.node(4).unwrap().mine_block().unwrap();
        assert!(net.settle(SETTLE).await);

        assert!(net.converged());
        assert!(net.nodes().iter().all(|n| n.get_block(&hash).is_some()));
    }

    #[tokio::test]
    async fn transactions_relay_and_confirm_everywhere() {
        let net = network(3);
        net.connect_all().unwrap();
        let payer = net.node(0).unwrap();
        payer.mine_block().unwrap();
        assert!(net.settle(SETTLE).await);

        let payee = net.node(2).unwrap().address();
        let tx = payer.create_transaction(&payee, 1).unwrap();
        assert!(net.settle(SETTLE).await);
        assert!(net.nodes().iter().all(|n| n.get_mempool() == vec![tx.clone()]));

        net.node(1).unwrap().mine_block().unwrap();
        assert!(net.settle(SETTLE).await);

        assert!(net.converged());
        for node in net.nodes() {
            assert!(node.get_mempool().is_empty());
            assert_eq!(node.get_balance(&payee), 1);
        }
        assert_consistent(&net);
    }

    #[tokio::test]
    async fn concurrent_mining_converges() {
        let net = network(4);
        net.connect_all().unwrap();
        assert!(net.settle(SETTLE).await);

        for round in 0..3 {
            for node in net.nodes() {
                if round % 2 == 0 || node.id() != "node-1" {
                    node.mine_block().unwrap();
                }
            }
            assert!(net.settle(SETTLE).await);
        }
        // equal-weight forks can persist; one more block breaks the tie
        net.node(3).unwrap().mine_block().unwrap();
        assert!(net.settle(SETTLE).await);

        assert!(net.converged());
        assert_consistent(&net);
    }

    #[tokio::test]
    async fn dropped_node_stops_receiving() {
        let net = network(2);
        let a = net.node(0).unwrap();
        let b = net.node(1).unwrap();
        a.connect(b).unwrap();
        assert!(net.settle(SETTLE).await);

        a.disconnect_from(b);
        a.mine_block().unwrap();
        assert!(net.settle(SETTLE).await);
        assert_eq!(b.height(), 0);
        assert!(!net.converged());
    }
}
