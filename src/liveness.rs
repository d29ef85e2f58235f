//! Peer liveness tracking: a shared snapshot of which peers are currently
//! believed alive plus an event stream of up/down transitions. The tracker
//! itself is fed externally (by the embedding application or the test
//! harness); the proposer only consumes it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::types::NodeId;

use tokio::sync::broadcast;

/// Capacity of the liveness event channel.
const LIVENESS_CHAN_CAP: usize = 256;

/// A peer liveness transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    /// Peer became reachable.
    NodeUp(NodeId),

    /// Peer became unreachable.
    NodeDown(NodeId),
}

/// Shared peer liveness tracker. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Liveness {
    /// Currently live peers.
    live: Arc<Mutex<HashSet<NodeId>>>,

    /// Transition event channel.
    tx_event: broadcast::Sender<LivenessEvent>,
}

impl Liveness {
    /// Creates a tracker with the given initially live peers.
    pub fn new(initial: HashSet<NodeId>) -> Self {
        let (tx_event, _) = broadcast::channel(LIVENESS_CHAN_CAP);
        Liveness {
            live: Arc::new(Mutex::new(initial)),
            tx_event,
        }
    }

    /// Snapshot of the currently live peers.
    pub fn live_peers(&self) -> HashSet<NodeId> {
        self.live.lock().unwrap().clone()
    }

    /// Marks a peer up and publishes the transition.
    pub fn mark_up(&self, peer: NodeId) {
        if self.live.lock().unwrap().insert(peer) {
            let _ = self.tx_event.send(LivenessEvent::NodeUp(peer));
        }
    }

    /// Marks a peer down and publishes the transition.
    pub fn mark_down(&self, peer: NodeId) {
        if self.live.lock().unwrap().remove(&peer) {
            let _ = self.tx_event.send(LivenessEvent::NodeDown(peer));
        }
    }

    /// Subscribes to liveness transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<LivenessEvent> {
        self.tx_event.subscribe()
    }
}
