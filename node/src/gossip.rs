use crate::PeerId;
use crate::error::PeerError;
use crate::peer::Peer;
use log::{debug, warn};
use meridian_core::{BlockHash, Transaction};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone)]
pub enum GossipMessage {
    NewTip(BlockHash),
    NewTransaction(Transaction),
}

#[derive(Debug)]
enum Route {
    AllExcept(Option<PeerId>),
    Only(PeerId),
}

struct Outbound {
    message: GossipMessage,
    route: Route,
}

type Shared<T> = Arc<Mutex<T>>;

/// Owns the peer table of a node and delivers announcements in the background.
///
/// Enqueueing never blocks the caller. Each delivery runs as its own task, so
/// a slow or failing peer does not hold up the others.
pub struct GossipDispatcher {
    peers: Shared<HashMap<PeerId, Arc<dyn Peer>>>,
    outbox: UnboundedSender<Outbound>,
    in_flight: Arc<AtomicUsize>,
}

impl GossipDispatcher {
    /// Must be called inside a tokio runtime. The worker stops when the
    /// dispatcher is dropped.
    pub fn new(local_id: impl Into<PeerId>) -> Self {
        let peers: Shared<HashMap<PeerId, Arc<dyn Peer>>> = Arc::new(Mutex::new(HashMap::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let (outbox, rx) = mpsc::unbounded_channel();

        tokio::spawn(run(local_id.into(), peers.clone(), in_flight.clone(), rx));

        Self {
            peers,
            outbox,
            in_flight,
        }
    }

    pub fn add_peer(&self, peer: Arc<dyn Peer>) {
        let id = peer.id().to_string();
        if self.peers.lock().insert(id.clone(), peer).is_none() {
            debug!("Registered peer {}", id);
        }
    }

    pub fn remove_peer(&self, id: &str) -> bool {
        self.peers.lock().remove(id).is_some()
    }

    pub fn peer(&self, id: &str) -> Option<Arc<dyn Peer>> {
        self.peers.lock().get(id).cloned()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Announce a new tip to every peer except `exclude`.
    pub fn propagate(&self, new_tip: &str, exclude: Option<&str>) {
        self.enqueue(Outbound {
            message: GossipMessage::NewTip(new_tip.to_string()),
            route: Route::AllExcept(exclude.map(str::to_string)),
        });
    }

    pub fn relay_transaction(&self, tx: Transaction, exclude: Option<&str>) {
        self.enqueue(Outbound {
            message: GossipMessage::NewTransaction(tx),
            route: Route::AllExcept(exclude.map(str::to_string)),
        });
    }

    pub fn announce_to(&self, peer: &str, message: GossipMessage) {
        self.enqueue(Outbound {
            message,
            route: Route::Only(peer.to_string()),
        });
    }

    /// Messages queued or being delivered. Zero means the dispatcher is idle.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn enqueue(&self, outbound: Outbound) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.outbox.send(outbound).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            warn!("gossip worker stopped; message dropped");
        }
    }
}

fn targets(peers: &Shared<HashMap<PeerId, Arc<dyn Peer>>>, route: &Route) -> Vec<Arc<dyn Peer>> {
    let peers = peers.lock();
    match route {
        Route::AllExcept(exclude) => peers
            .iter()
            .filter(|(id, _)| exclude.as_deref() != Some(id.as_str()))
            .map(|(_, peer)| peer.clone())
            .collect(),
        Route::Only(id) => peers.get(id).cloned().into_iter().collect(),
    }
}

async fn run(
    local_id: PeerId,
    peers: Shared<HashMap<PeerId, Arc<dyn Peer>>>,
    in_flight: Arc<AtomicUsize>,
    mut rx: UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        let recipients = targets(&peers, &outbound.route);
        if recipients.is_empty() {
            debug!("[{}] no recipients for {:?}", local_id, outbound.route);
        }

        for peer in recipients {
            in_flight.fetch_add(1, Ordering::SeqCst);
            let local_id = local_id.clone();
            let message = outbound.message.clone();
            let in_flight = in_flight.clone();
            tokio::spawn(async move {
                if let Err(e) = deliver(&local_id, peer.as_ref(), message).await {
                    warn!("[{}] delivery to {} failed: {}", local_id, peer.id(), e);
                }
                in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        }
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("[{}] gossip worker finished", local_id);
}

async fn deliver(local_id: &str, peer: &dyn Peer, message: GossipMessage) -> Result<(), PeerError> {
    match message {
        GossipMessage::NewTip(hash) => peer.notify_of_block(local_id, &hash).await,
        GossipMessage::NewTransaction(tx) => peer.submit_transaction(local_id, tx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meridian_core::Block;
    use std::time::Duration;

    struct RecordingPeer {
        id: String,
        fail: bool,
        seen: Mutex<Vec<(String, String)>>,
    }

    impl RecordingPeer {
        fn new(id: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                fail,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Peer for RecordingPeer {
        fn id(&self) -> &str {
            &self.id
        }

        async fn get_block(&self, _hash: &str) -> Result<Option<Block>, PeerError> {
            Ok(None)
        }

        async fn get_last_block_hash(&self) -> Result<BlockHash, PeerError> {
            Err(PeerError::Disconnected(self.id.clone()))
        }

        async fn notify_of_block(&self, sender: &str, hash: &str) -> Result<(), PeerError> {
            if self.fail {
                return Err(PeerError::Disconnected(self.id.clone()));
            }
            self.seen.lock().push((sender.to_string(), hash.to_string()));
            Ok(())
        }

        async fn submit_transaction(&self, sender: &str, tx: Transaction) -> Result<(), PeerError> {
            self.seen.lock().push((sender.to_string(), tx.txid));
            Ok(())
        }
    }

    async fn idle(dispatcher: &GossipDispatcher) {
        for _ in 0..200 {
            if dispatcher.in_flight() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("dispatcher did not go idle");
    }

    #[tokio::test]
    async fn propagate_skips_excluded_peer() {
        let dispatcher = GossipDispatcher::new("me");
        let peers: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|id| RecordingPeer::new(id, false))
            .collect();
        for p in &peers {
            dispatcher.add_peer(p.clone());
        }

        dispatcher.propagate("tip", Some("b"));
        idle(&dispatcher).await;

        assert_eq!(*peers[0].seen.lock(), vec![("me".to_string(), "tip".to_string())]);
        assert!(peers[1].seen.lock().is_empty());
        assert_eq!(peers[2].seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn failing_peer_does_not_block_others() {
        let dispatcher = GossipDispatcher::new("me");
        let broken = RecordingPeer::new("broken", true);
        let healthy = RecordingPeer::new("healthy", false);
        dispatcher.add_peer(broken.clone());
        dispatcher.add_peer(healthy.clone());

        dispatcher.propagate("tip", None);
        idle(&dispatcher).await;

        assert!(broken.seen.lock().is_empty());
        assert_eq!(healthy.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn announce_to_reaches_only_target() {
        let dispatcher = GossipDispatcher::new("me");
        let a = RecordingPeer::new("a", false);
        let b = RecordingPeer::new("b", false);
        dispatcher.add_peer(a.clone());
        dispatcher.add_peer(b.clone());

        dispatcher.announce_to("b", GossipMessage::NewTip("x".to_string()));
        dispatcher.announce_to("gone", GossipMessage::NewTip("y".to_string()));
        idle(&dispatcher).await;

        assert!(a.seen.lock().is_empty());
        assert_eq!(*b.seen.lock(), vec![("me".to_string(), "x".to_string())]);
        assert_eq!(dispatcher.peer_ids(), vec!["a".to_string(), "b".to_string()]);
        assert!(dispatcher.remove_peer("a"));
        assert!(!dispatcher.remove_peer("a"));
    }
}
