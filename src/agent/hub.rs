//! Routing hub connecting a proposer to the agents of its peers (its own
//! node's agent included, addressed uniformly). Requests are fire-and-forget
//! with correlation opaques; replies and peer-down notifications arrive on a
//! single event channel. Every request captures the peer's current monitor
//! reference at send time, and replies carrying a stale reference are
//! silently dropped -- necessary because peer down/up may recycle channels.

use std::collections::HashMap;

use super::{
    AgentCall, AgentError, AgentReply, AgentRequest, LocalAgent, Opaque,
};
use crate::types::NodeId;
use crate::utils::ConclaveError;

use tokio::sync::mpsc;

/// Monitor reference: identifies one monitoring session of one peer.
pub type MonitorRef = u64;

/// Event delivered to the hub's owner.
#[derive(Debug)]
pub enum AgentEvent {
    /// Reply to an earlier request.
    Reply {
        peer: NodeId,
        opaque: Opaque,
        mref: MonitorRef,
        result: Result<AgentReply, AgentError>,
    },

    /// The monitored peer's agent is gone.
    Down { peer: NodeId, mref: MonitorRef },
}

/// Per-proposer routing hub over peer agents.
pub struct AgentHub {
    /// Owning node's ID.
    me: NodeId,

    /// Map from peer ID -> sender side of that agent's call channel.
    peers: HashMap<NodeId, mpsc::UnboundedSender<AgentCall>>,

    /// Map from peer ID -> current monitor reference.
    monitors: HashMap<NodeId, MonitorRef>,

    /// Next monitor reference to hand out.
    next_mref: MonitorRef,

    /// Sender side of the event channel, cloned into every request so the
    /// serving agent can push its reply back.
    tx_event: mpsc::UnboundedSender<AgentEvent>,

    /// Receiver side of the event channel.
    rx_event: mpsc::UnboundedReceiver<AgentEvent>,
}

impl AgentHub {
    /// Creates a hub over the given peer agents (the local one included).
    pub fn new(me: NodeId, peers: &HashMap<NodeId, LocalAgent>) -> Self {
        let (tx_event, rx_event) = mpsc::unbounded_channel();
        AgentHub {
            me,
            peers: peers
                .iter()
                .map(|(&peer, agent)| (peer, agent.call_sender()))
                .collect(),
            monitors: HashMap::new(),
            next_mref: 0,
            tx_event,
            rx_event,
        }
    }

    /// Starts (or restarts) monitoring a peer, returning the fresh monitor
    /// reference. Replies to requests sent under an older reference will be
    /// dropped from now on.
    pub fn monitor(&mut self, peer: NodeId) -> MonitorRef {
        self.next_mref += 1;
        self.monitors.insert(peer, self.next_mref);
        self.next_mref
    }

    /// Stops monitoring a peer.
    pub fn demonitor(&mut self, peer: NodeId) {
        self.monitors.remove(&peer);
    }

    /// Whether the peer is currently monitored.
    pub fn monitored(&self, peer: NodeId) -> bool {
        self.monitors.contains_key(&peer)
    }

    /// Sends a request to a peer's agent under its current monitor
    /// reference (monitoring it first if not yet monitored). A dead or
    /// unknown peer surfaces as a `Down` event rather than a send error.
    pub fn send(
        &mut self,
        peer: NodeId,
        opaque: Opaque,
        request: AgentRequest,
    ) {
        let mref = match self.monitors.get(&peer) {
            Some(&mref) => mref,
            None => self.monitor(peer),
        };

        let delivered = match self.peers.get(&peer) {
            Some(tx_call) => tx_call
                .send(AgentCall::Rpc {
                    opaque,
                    mref,
                    request,
                    reply_to: self.tx_event.clone(),
                })
                .is_ok(),
            None => false,
        };
        if !delivered {
            pf_debug!(self.me; "agent of peer {} unreachable", peer);
            let _ = self.tx_event.send(AgentEvent::Down { peer, mref });
        }
    }

    /// Receives the next event, dropping stale replies and duplicate down
    /// notifications along the way. A `Down` event removes the peer's
    /// monitor before delivery.
    pub async fn recv_event(&mut self) -> Result<AgentEvent, ConclaveError> {
        loop {
            let event = match self.rx_event.recv().await {
                Some(event) => event,
                None => {
                    return logged_err!(self.me; "event channel closed");
                }
            };
            match &event {
                AgentEvent::Reply { peer, mref, .. } => {
                    if self.monitors.get(peer) == Some(mref) {
                        return Ok(event);
                    }
                    pf_trace!(self.me; "dropped stale reply <- {}", peer);
                }
                AgentEvent::Down { peer, mref } => {
                    if self.monitors.get(peer) == Some(mref) {
                        self.monitors.remove(peer);
                        return Ok(event);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod hub_tests {
    use super::*;
    use crate::agent::{spawn_agent, AgentCore};
    use crate::events::EventBus;
    use crate::types::{Config, LogPosition, Term};

    async fn spawn_test_agent(me: NodeId) -> crate::agent::LocalAgent {
        let config = Config {
            voters: [0, 1].into_iter().collect(),
            machines: Default::default(),
        };
        let core = AgentCore::provision(
            me,
            "h0".into(),
            config,
            EventBus::new(),
            None,
        )
        .await
        .unwrap();
        spawn_agent(core)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn request_reply_roundtrip() -> Result<(), ConclaveError> {
        let peer_agent = spawn_test_agent(1).await;
        let mut hub =
            AgentHub::new(0, &HashMap::from([(1, peer_agent.clone())]));
        hub.monitor(1);
        hub.send(
            1,
            77,
            AgentRequest::EnsureTerm {
                history: "h0".into(),
                term: Term::ZERO,
            },
        );
        match hub.recv_event().await? {
            AgentEvent::Reply {
                peer,
                opaque,
                result,
                ..
            } => {
                assert_eq!(peer, 1);
                assert_eq!(opaque, 77);
                assert!(result.is_ok());
            }
            other => panic!("unexpected event {:?}", other),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_reply_dropped() -> Result<(), ConclaveError> {
        let peer_agent = spawn_test_agent(1).await;
        let mut hub =
            AgentHub::new(0, &HashMap::from([(1, peer_agent.clone())]));
        hub.monitor(1);
        hub.send(
            1,
            1,
            AgentRequest::EstablishTerm {
                history: "h0".into(),
                term: Term::new(1, 0),
                position: LogPosition {
                    term: Term::ZERO,
                    seqno: 0,
                },
            },
        );
        // re-monitoring invalidates the in-flight reply; the later probe's
        // reply is the first to be delivered
        hub.monitor(1);
        hub.send(
            1,
            2,
            AgentRequest::EnsureTerm {
                history: "h0".into(),
                term: Term::new(1, 0),
            },
        );
        match hub.recv_event().await? {
            AgentEvent::Reply { opaque, .. } => assert_eq!(opaque, 2),
            other => panic!("unexpected event {:?}", other),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_peer_surfaces_down() -> Result<(), ConclaveError> {
        let mut hub = AgentHub::new(0, &HashMap::new());
        let mref = hub.monitor(9);
        hub.send(
            9,
            5,
            AgentRequest::EnsureTerm {
                history: "h0".into(),
                term: Term::ZERO,
            },
        );
        match hub.recv_event().await? {
            AgentEvent::Down { peer, mref: got } => {
                assert_eq!(peer, 9);
                assert_eq!(got, mref);
                assert!(!hub.monitored(9));
            }
            other => panic!("unexpected event {:?}", other),
        }
        Ok(())
    }
}
