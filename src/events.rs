//! Per-node broadcast bus for cluster events: term announcements from the
//! server façade and metadata updates from the local agent. Machine
//! runtimes subscribe and filter for the kinds they care about.

use crate::types::{HistoryId, Seqno, Term};

use tokio::sync::broadcast;

/// Default capacity of the broadcast channel backing a bus.
const EVENT_CHAN_CAP: usize = 1024;

/// A cluster event visible on a node's bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A proposer established the given term and is accepting requests.
    TermStarted {
        history: HistoryId,
        term: Term,
        high_seqno: Seqno,
    },

    /// The given term's leadership ended.
    TermFinished { history: HistoryId, term: Term },

    /// The local agent's committed seqno advanced.
    MetadataUpdated {
        history: HistoryId,
        committed_seqno: Seqno,
    },
}

/// Handle to a node's event bus. Cheap to clone; every holder may publish
/// and subscribe.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx_event: broadcast::Sender<ClusterEvent>,
}

impl EventBus {
    /// Creates a new event bus.
    pub fn new() -> Self {
        let (tx_event, _) = broadcast::channel(EVENT_CHAN_CAP);
        EventBus { tx_event }
    }

    /// Publishes an event to all current subscribers. Publishing onto a bus
    /// with no subscribers is not an error.
    pub fn publish(&self, event: ClusterEvent) {
        let _ = self.tx_event.send(event);
    }

    /// Subscribes to events published from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx_event.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod events_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn publish_subscribe() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(ClusterEvent::TermStarted {
            history: "h0".into(),
            term: Term::new(1, 0),
            high_seqno: 0,
        });
        assert_eq!(
            sub.recv().await.unwrap(),
            ClusterEvent::TermStarted {
                history: "h0".into(),
                term: Term::new(1, 0),
                high_seqno: 0,
            }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn late_subscriber_misses_past() {
        let bus = EventBus::new();
        bus.publish(ClusterEvent::TermFinished {
            history: "h0".into(),
            term: Term::new(1, 0),
        });
        let mut sub = bus.subscribe();
        bus.publish(ClusterEvent::MetadataUpdated {
            history: "h0".into(),
            committed_seqno: 3,
        });
        assert_eq!(
            sub.recv().await.unwrap(),
            ClusterEvent::MetadataUpdated {
                history: "h0".into(),
                committed_seqno: 3,
            }
        );
    }
}
