//! Proposer: the leader-side replication state machine. A proposer instance
//! is spawned per `(history, term)` by whatever election mechanism the
//! embedding application runs; it establishes the term against a quorum of
//! agents, then replicates log entries, advances the committed seqno, and
//! drives configuration transitions until it stops. Stopping is terminal;
//! there is no in-place recovery.

mod commit;
mod establish;
mod reconfig;
mod replicate;
mod status;
mod syncquorum;

use std::collections::{HashMap, HashSet, VecDeque};

use crate::agent::{
    AgentEvent, AgentHub, AgentRequest, LocalAgent, Opaque,
};
use crate::liveness::{Liveness, LivenessEvent};
use crate::quorum::Quorum;
use crate::server::ServerHandle;
use crate::types::{
    Branch, CommandRef, Config, HistoryId, LogPosition, MemberConfig, NodeId,
    Revision, Seqno, Term,
};
use crate::utils::{ConclaveError, Timer};
use status::{PendingEntries, StatusTable};
use syncquorum::SyncRequest;

use serde::Deserialize;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Duration, Interval, MissedTickBehavior};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ProposerConfig {
    /// Timeout of the term-establishment phase in millisecs.
    pub establish_term_timeout_ms: u64,

    /// Interval of the periodic peer re-probe tick in millisecs.
    pub check_peers_interval_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ProposerConfig {
    fn default() -> Self {
        ProposerConfig {
            establish_term_timeout_ms: 10_000,
            check_peers_interval_ms: 5_000,
        }
    }
}

/// Proposer lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Collecting a quorum of term promises.
    Establishing,

    /// Committing entries and accepting client requests.
    Proposing,
}

/// Reason a proposer stopped. Stopping is always terminal; a new proposer
/// is spawned by an external election on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposerExit {
    /// The local agent refused to establish the term.
    LocalEstablishFailed,

    /// Another leader exists at a higher term.
    ConflictingTerm(Term),

    /// A peer's log belongs to a different history.
    HistoryMismatch(HistoryId),

    /// The establish phase did not reach quorum in time.
    EstablishTimeout,

    /// The quorum became unreachable.
    NoQuorum,

    /// The local agent died; leadership is lost.
    AgentGone,

    /// An error outside the recoverable set.
    UnexpectedError(String),
}

/// One client command forwarded from a machine runtime.
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    /// Target machine name.
    pub machine: String,

    /// Leader-unique command reference.
    pub id: CommandRef,

    /// Opaque command payload.
    pub payload: Vec<u8>,
}

/// Reply from the proposer to a waiting client, delivered through the
/// server façade.
#[derive(Debug, PartialEq, Eq)]
pub enum ProposerReply {
    /// Configuration change succeeded at the given revision.
    ConfigOk(Revision),

    /// Compare-and-swap failed; carries the actual current revision.
    CasFailed(Revision),

    /// The request cannot reach a quorum.
    NoQuorum,

    /// Quorum sync succeeded.
    SyncOk,
}

/// Reply slot a proposer request carries along.
pub type ReplyTo = oneshot::Sender<ProposerReply>;

/// Request message into a proposer task.
#[derive(Debug)]
pub enum ProposerMsg {
    /// Batch of client commands to append.
    Commands(Vec<CommandEnvelope>),

    /// Compare-and-swap configuration change.
    CasConfig {
        expected: Revision,
        config: Config,
        from: ReplyTo,
    },

    /// Read-linearization quorum sync.
    SyncQuorum { from: ReplyTo },
}

/// Cloneable handle for submitting requests to a proposer task.
#[derive(Debug, Clone)]
pub struct ProposerClient {
    /// History the proposer serves.
    pub history: HistoryId,

    /// Term the proposer holds.
    pub term: Term,

    /// Sender side of the proposer's request channel.
    tx_msg: mpsc::UnboundedSender<ProposerMsg>,
}

impl ProposerClient {
    /// Sends a request message to the proposer task.
    pub fn send_msg(&self, msg: ProposerMsg) -> Result<(), ConclaveError> {
        self.tx_msg.send(msg).map_err(ConclaveError::msg)
    }
}

/// Kind bits of a request correlation opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpaqueKind {
    Establish = 0,
    Append = 1,
    Probe = 2,
    SyncQuorum = 3,
}

/// Composes a correlation opaque from kind bits and an optional tag.
#[inline]
pub(crate) fn make_opaque(kind: OpaqueKind, tag: u64) -> Opaque {
    (tag << 2) | (kind as u64)
}

/// Decomposes a correlation opaque into kind bits and tag.
#[inline]
pub(crate) fn split_opaque(opaque: Opaque) -> (OpaqueKind, u64) {
    let kind = match opaque & 0b11 {
        0 => OpaqueKind::Establish,
        1 => OpaqueKind::Append,
        2 => OpaqueKind::Probe,
        _ => OpaqueKind::SyncQuorum,
    };
    (kind, opaque >> 2)
}

/// The proposer state machine.
pub struct Proposer {
    /// My node ID.
    me: NodeId,

    /// History this proposer serves.
    history: HistoryId,

    /// Term this proposer holds.
    term: Term,

    /// Configuration parameters struct.
    config: ProposerConfig,

    /// Lifecycle phase.
    phase: Phase,

    /// Parent server façade handle; the proposer's only upward reference.
    server: ServerHandle,

    /// Local agent handle for synchronous calls (establish, backfill).
    local_agent: LocalAgent,

    /// Routing hub over peer agents.
    hub: AgentHub,

    /// Peer liveness tracker.
    liveness: Liveness,

    /// Liveness transition subscription.
    rx_liveness: broadcast::Receiver<LivenessEvent>,

    /// Receiver side of the request channel.
    rx_msg: mpsc::UnboundedReceiver<ProposerMsg>,

    /// Effective cluster configuration (possibly a joint transition).
    member_config: MemberConfig,

    /// Effective quorum derived from the config and/or pending branch.
    quorum: Quorum,

    /// Union of node sets in the effective quorum.
    quorum_peers: HashSet<NodeId>,

    /// Pending quorum-failover branch being resolved, if any.
    branch: Option<Branch>,

    /// Position of the local log at term establishment; sent with
    /// establish-term requests.
    local_position: LogPosition,

    /// Establish-phase promises received.
    votes: HashSet<NodeId>,

    /// Peers written off (dead at start, refused, or agent-down).
    failed_votes: HashSet<NodeId>,

    /// Highest committed seqno.
    committed_seqno: Seqno,

    /// Highest locally known replicated seqno; between `committed_seqno`
    /// and `pending_high_seqno` at all times.
    high_seqno: Seqno,

    /// Highest seqno handed out to a proposed entry.
    pending_high_seqno: Seqno,

    /// Proposed-but-uncommitted entries.
    pending: PendingEntries,

    /// Per-peer replication status.
    statuses: StatusTable,

    /// In-flight quorum sync requests, keyed by tag.
    sync_requests: HashMap<u64, SyncRequest>,

    /// Next quorum sync tag to hand out.
    next_sync_tag: u64,

    /// Client awaiting the outcome of the in-flight config change.
    config_change_from: Option<ReplyTo>,

    /// Config change requests postponed until the active config commits,
    /// in arrival order.
    postponed_configs: VecDeque<(Revision, Config, ReplyTo)>,

    /// Quorum sync requests that arrived before the term was established.
    postponed_syncs: Vec<ReplyTo>,

    /// Establish-phase state timeout.
    establish_timer: Timer,

    /// Periodic peer re-probe tick.
    check_interval: Interval,
}

impl Proposer {
    /// Creates a proposer for the given `(history, term)`. Returns the
    /// proposer (to be driven via `run()`) and the client handle the server
    /// routes requests through.
    #[allow(clippy::too_many_arguments)]
    pub fn new_and_setup(
        me: NodeId,
        history: HistoryId,
        term: Term,
        server: ServerHandle,
        local_agent: LocalAgent,
        hub: AgentHub,
        liveness: Liveness,
        config_str: Option<&str>,
    ) -> Result<(Self, ProposerClient), ConclaveError> {
        let config = parsed_config!(config_str => ProposerConfig;
                                    establish_term_timeout_ms,
                                    check_peers_interval_ms)?;
        if config.establish_term_timeout_ms == 0 {
            return logged_err!(me; "invalid config.establish_term_timeout_ms '{}'",
                                   config.establish_term_timeout_ms);
        }
        if config.check_peers_interval_ms == 0 {
            return logged_err!(me; "invalid config.check_peers_interval_ms '{}'",
                                   config.check_peers_interval_ms);
        }

        let (tx_msg, rx_msg) = mpsc::unbounded_channel();
        let client = ProposerClient {
            history: history.clone(),
            term,
            tx_msg,
        };

        let mut check_interval = time::interval(Duration::from_millis(
            config.check_peers_interval_ms,
        ));
        check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let rx_liveness = liveness.subscribe();
        let member_config = MemberConfig {
            value: crate::types::ConfigValue::Stable(Config::default()),
            revision: Revision::new(history.clone(), Term::ZERO, 0),
        };
        let quorum = Quorum::of_config(me, &member_config);

        Ok((
            Proposer {
                me,
                history,
                term,
                config,
                phase: Phase::Establishing,
                server,
                local_agent,
                hub,
                liveness,
                rx_liveness,
                rx_msg,
                member_config,
                quorum,
                quorum_peers: HashSet::new(),
                branch: None,
                local_position: LogPosition {
                    term: Term::ZERO,
                    seqno: 0,
                },
                votes: HashSet::new(),
                failed_votes: HashSet::new(),
                committed_seqno: 0,
                high_seqno: 0,
                pending_high_seqno: 0,
                pending: PendingEntries::new(),
                statuses: StatusTable::new(),
                sync_requests: HashMap::new(),
                next_sync_tag: 0,
                config_change_from: None,
                postponed_configs: VecDeque::new(),
                postponed_syncs: Vec::new(),
                establish_timer: Timer::new(),
                check_interval,
            },
            client,
        ))
    }

    /// Main event loop. Returns the reason this proposer stopped; internal
    /// channel failures surface as errors.
    pub async fn run(&mut self) -> Result<ProposerExit, ConclaveError> {
        if let Some(exit) = self.enter_establishing().await? {
            pf_info!(self.me; "proposer stopping: {:?}", exit);
            return Ok(exit);
        }

        loop {
            let exit = tokio::select! {
                // client request from the server façade
                msg = self.rx_msg.recv() => {
                    match msg {
                        Some(msg) => self.handle_msg(msg).await?,
                        None => {
                            return logged_err!(self.me; "request channel closed");
                        }
                    }
                },

                // agent reply or peer-down notification
                event = self.hub.recv_event() => {
                    self.handle_agent_event(event?).await?
                },

                // peer liveness transition
                event = self.rx_liveness.recv() => {
                    match event {
                        Ok(event) => self.handle_liveness_event(event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            pf_warn!(self.me; "lagged {} liveness events", n);
                            None
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return logged_err!(self.me; "liveness channel closed");
                        }
                    }
                },

                // establish-phase state timeout
                () = self.establish_timer.timeout() => {
                    if self.phase == Phase::Establishing {
                        Some(ProposerExit::EstablishTimeout)
                    } else {
                        None
                    }
                },

                // periodic peer re-probe
                _ = self.check_interval.tick(),
                    if self.phase == Phase::Proposing => {
                    self.handle_check_peers();
                    None
                },
            };

            if let Some(exit) = exit {
                pf_info!(self.me; "proposer stopping: {:?}", exit);
                return Ok(exit);
            }
        }
    }

    /// Handler of one client request message.
    async fn handle_msg(
        &mut self,
        msg: ProposerMsg,
    ) -> Result<Option<ProposerExit>, ConclaveError> {
        match msg {
            ProposerMsg::Commands(batch) => {
                self.handle_commands(batch).await?;
            }
            ProposerMsg::CasConfig {
                expected,
                config,
                from,
            } => {
                if self.phase == Phase::Establishing {
                    self.postponed_configs.push_back((expected, config, from));
                } else {
                    self.handle_cas_config(expected, config, from);
                    self.replicate().await?;
                }
            }
            ProposerMsg::SyncQuorum { from } => {
                if self.phase == Phase::Establishing {
                    self.postponed_syncs.push(from);
                } else {
                    self.handle_sync_quorum(from);
                }
            }
        }
        Ok(None)
    }

    /// Handler of one agent event, dispatching replies on their opaque's
    /// kind bits.
    async fn handle_agent_event(
        &mut self,
        event: AgentEvent,
    ) -> Result<Option<ProposerExit>, ConclaveError> {
        match event {
            AgentEvent::Reply {
                peer,
                opaque,
                result,
                ..
            } => match split_opaque(opaque).0 {
                OpaqueKind::Establish => {
                    self.handle_establish_reply(peer, result).await
                }
                OpaqueKind::Append => {
                    self.handle_append_reply(peer, result).await
                }
                OpaqueKind::Probe => {
                    self.handle_probe_reply(peer, result).await
                }
                OpaqueKind::SyncQuorum => {
                    let tag = split_opaque(opaque).1;
                    self.handle_sync_reply(tag, peer, result)
                }
            },
            AgentEvent::Down { peer, .. } => self.handle_peer_down(peer),
        }
    }

    /// Handler of a peer's agent going down.
    fn handle_peer_down(
        &mut self,
        peer: NodeId,
    ) -> Result<Option<ProposerExit>, ConclaveError> {
        pf_warn!(self.me; "agent of peer {} is down", peer);
        self.statuses.remove(peer);

        if peer == self.me {
            return Ok(Some(ProposerExit::AgentGone));
        }

        match self.phase {
            Phase::Establishing => {
                // a promise already given still counts toward election
                if !self.votes.contains(&peer) {
                    self.failed_votes.insert(peer);
                }
            }
            Phase::Proposing => {
                self.failed_votes.insert(peer);
            }
        }
        if !self.quorum.feasible(&self.quorum_peers, &self.failed_votes) {
            return Ok(Some(ProposerExit::NoQuorum));
        }

        self.sync_peer_down(peer);
        Ok(None)
    }

    /// Handler of a peer liveness transition.
    fn handle_liveness_event(
        &mut self,
        event: LivenessEvent,
    ) -> Option<ProposerExit> {
        match event {
            LivenessEvent::NodeUp(peer) => {
                // keep the initial peer accounting while establishing; once
                // proposing, probe the peer to seed/refresh its status
                if self.phase == Phase::Proposing
                    && self.quorum_peers.contains(&peer)
                {
                    pf_debug!(self.me; "peer {} up, probing", peer);
                    self.send_probe(peer);
                }
            }
            LivenessEvent::NodeDown(_) => {
                // no action; the agent monitor DOWN will follow
            }
        }
        None
    }

    /// Periodic tick: probe live quorum peers that lost (or never had)
    /// their monitor or status row.
    fn handle_check_peers(&mut self) {
        let live = self.liveness.live_peers();
        for peer in self.quorum_peers.clone() {
            if peer == self.me || !live.contains(&peer) {
                continue;
            }
            if !self.hub.monitored(peer) || !self.statuses.contains(peer) {
                pf_trace!(self.me; "re-probing peer {}", peer);
                self.send_probe(peer);
            }
        }
    }

    /// Sends an `ensure_term` position probe to a peer.
    fn send_probe(&mut self, peer: NodeId) {
        self.hub.send(
            peer,
            make_opaque(OpaqueKind::Probe, 0),
            AgentRequest::EnsureTerm {
                history: self.history.clone(),
                term: self.term,
            },
        );
    }

    /// Recomputes the effective quorum from the member config and pending
    /// branch.
    fn refresh_quorum(&mut self) {
        self.quorum = match &self.branch {
            Some(branch) => Quorum::of_branch(branch),
            None => Quorum::of_config(self.me, &self.member_config),
        };
        self.quorum_peers = self.quorum.peers();
    }
}
