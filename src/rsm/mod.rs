//! Machine runtime: the per-state-machine driver that consumes committed
//! log entries in order, applies them to the user's machine module, and
//! answers commands, queries, and revision syncs with linearizable
//! guarantees. One runtime task runs per registered machine name.

mod apply;
mod machine;
mod request;
mod syncrev;

pub use machine::{
    CommandDecision, KvCommand, KvMachine, KvQuery, KvResult, Machine,
};

use std::collections::HashMap;
use std::fmt;

use crate::agent::LocalAgent;
use crate::events::ClusterEvent;
use crate::server::ServerHandle;
use crate::types::{CommandRef, HistoryId, NodeId, Seqno, Term};
use crate::utils::ConclaveError;
use syncrev::SyncRevisionQueue;

use serde::Deserialize;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum number of entries one reader round fetches from the agent.
    pub max_apply_batch: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            max_apply_batch: 5000,
        }
    }
}

/// Client-visible error from a machine runtime.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RsmError {
    /// This node does not lead the cluster right now.
    NotLeader,

    /// The caller's revision belongs to a different history.
    HistoryMismatch,

    /// The sync-revision timer fired before the revision applied.
    Timeout,

    /// Leadership ended while the request was pending.
    LeaderGone,

    /// The quorum cannot be reached.
    NoQuorum,

    /// Runtime-internal failure.
    Internal(String),
}

impl fmt::Display for RsmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RsmError::NotLeader => write!(f, "not leader"),
            RsmError::HistoryMismatch => write!(f, "history mismatch"),
            RsmError::Timeout => write!(f, "timeout"),
            RsmError::LeaderGone => write!(f, "leader gone"),
            RsmError::NoQuorum => write!(f, "no quorum"),
            RsmError::Internal(reason) => write!(f, "internal: {}", reason),
        }
    }
}

/// Which applied revision the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    /// The leader's local applied revision; valid for leader-local reads.
    Leader,

    /// Additionally confirm leadership against a quorum first.
    Quorum,
}

/// Role of a machine runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Role {
    Follower,

    Leader {
        history: HistoryId,
        term: Term,
        /// High seqno at the moment the term started; guards the applied
        /// revision during the first moments of a term.
        term_seqno: Seqno,
    },
}

/// Message into a runtime task.
#[derive(Debug)]
pub enum RsmMsg {
    /// Client command submission.
    Command {
        payload: Vec<u8>,
        resp: oneshot::Sender<Result<Vec<u8>, RsmError>>,
    },

    /// Client read-only query.
    Query {
        payload: Vec<u8>,
        resp: oneshot::Sender<Vec<u8>>,
    },

    /// Block until `(history, seqno)` has been applied.
    SyncRevision {
        history: HistoryId,
        seqno: Seqno,
        timeout: Duration,
        resp: oneshot::Sender<Result<(), RsmError>>,
    },

    /// Fetch the applied revision (leader only).
    GetAppliedRevision {
        kind: ReadKind,
        resp: oneshot::Sender<Result<(HistoryId, Seqno), RsmError>>,
    },

    /// Reader round finished; entries to apply in order.
    Entries {
        high_seqno: Seqno,
        entries: Vec<crate::types::LogEntry>,
    },

    /// Reader round failed; fatal to the runtime.
    ReaderDied(String),

    /// A sync-revision request's timer fired.
    SyncTimeout { seqno: Seqno, tag: u64 },

    /// A forwarded quorum sync completed.
    SyncQuorumDone { tag: u64, ok: bool },
}

/// Cloneable client handle to a machine runtime.
#[derive(Debug, Clone)]
pub struct RsmHandle {
    /// Machine name this runtime serves.
    name: String,

    /// Sender side of the runtime's message channel.
    tx_msg: mpsc::UnboundedSender<RsmMsg>,
}

impl RsmHandle {
    /// Machine name this runtime serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, msg: RsmMsg) -> Result<(), RsmError> {
        self.tx_msg
            .send(msg)
            .map_err(|_| RsmError::Internal("runtime gone".into()))
    }

    /// Submits a command; resolves once the entry applied (or rejects).
    pub async fn command(
        &self,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RsmError> {
        let (resp, rx) = oneshot::channel();
        self.send(RsmMsg::Command { payload, resp })?;
        rx.await
            .map_err(|_| RsmError::Internal("runtime gone".into()))?
    }

    /// Runs a read-only query against the applied state.
    pub async fn query(&self, payload: Vec<u8>) -> Result<Vec<u8>, RsmError> {
        let (resp, rx) = oneshot::channel();
        self.send(RsmMsg::Query { payload, resp })?;
        rx.await
            .map_err(|_| RsmError::Internal("runtime gone".into()))
    }

    /// Blocks until the given revision has been applied locally.
    pub async fn sync_revision(
        &self,
        history: HistoryId,
        seqno: Seqno,
        timeout: Duration,
    ) -> Result<(), RsmError> {
        let (resp, rx) = oneshot::channel();
        self.send(RsmMsg::SyncRevision {
            history,
            seqno,
            timeout,
            resp,
        })?;
        rx.await
            .map_err(|_| RsmError::Internal("runtime gone".into()))?
    }

    /// Fetches the applied revision for read linearization.
    pub async fn applied_revision(
        &self,
        kind: ReadKind,
    ) -> Result<(HistoryId, Seqno), RsmError> {
        let (resp, rx) = oneshot::channel();
        self.send(RsmMsg::GetAppliedRevision { kind, resp })?;
        rx.await
            .map_err(|_| RsmError::Internal("runtime gone".into()))?
    }
}

/// The machine runtime driver.
pub struct RsmRuntime<M: Machine> {
    /// Machine name (key in the cluster config's machine map).
    name: String,

    /// My node ID.
    me: NodeId,

    /// Configuration parameters struct.
    config: RuntimeConfig,

    /// The user's machine module.
    machine: M,

    /// Current role.
    role: Role,

    /// Leadership incarnation token; bumped on every term start.
    incarnation: u64,

    /// Next command counter within the incarnation.
    next_counter: u64,

    /// Next sync tag (revision waits and quorum syncs).
    next_tag: u64,

    /// History of the entries applied so far.
    applied_history: HistoryId,

    /// Highest applied seqno.
    applied_seqno: Seqno,

    /// Highest committed seqno the agent has advertised.
    available_seqno: Seqno,

    /// Whether a reader round is outstanding (at most one).
    reader_busy: bool,

    /// Clients whose commands are in flight, keyed by command ref.
    pending_clients:
        HashMap<CommandRef, oneshot::Sender<Result<Vec<u8>, RsmError>>>,

    /// Clients blocked on a quorum-synced applied-revision read.
    sync_quorum_clients:
        HashMap<u64, oneshot::Sender<Result<(HistoryId, Seqno), RsmError>>>,

    /// Clients blocked until a revision applies.
    sync_revisions: SyncRevisionQueue,

    /// Parent server façade handle.
    server: ServerHandle,

    /// Local agent handle (reader source, startup metadata).
    agent: LocalAgent,

    /// Cluster event subscription.
    rx_event: broadcast::Receiver<ClusterEvent>,

    /// Receiver side of the message channel.
    rx_msg: mpsc::UnboundedReceiver<RsmMsg>,

    /// Sender side of the message channel, cloned into reader and timer
    /// tasks.
    tx_msg: mpsc::UnboundedSender<RsmMsg>,
}

impl<M: Machine> RsmRuntime<M> {
    /// Creates a runtime for the given machine, seeding the applied
    /// history from the local agent's metadata and asking the server to
    /// re-announce any active term.
    pub async fn new_and_setup(
        name: String,
        machine: M,
        server: ServerHandle,
        agent: LocalAgent,
        events: &crate::events::EventBus,
        config_str: Option<&str>,
    ) -> Result<(Self, RsmHandle), ConclaveError> {
        let config = parsed_config!(config_str => RuntimeConfig;
                                    max_apply_batch)?;
        if config.max_apply_batch == 0 {
            return logged_err!(&name; "invalid config.max_apply_batch '{}'",
                                      config.max_apply_batch);
        }

        // subscribe before reading the metadata snapshot so no update
        // between the two is missed
        let rx_event = events.subscribe();
        let meta = agent.get_metadata().await?;

        let (tx_msg, rx_msg) = mpsc::unbounded_channel();
        let handle = RsmHandle {
            name: name.clone(),
            tx_msg: tx_msg.clone(),
        };

        let mut machine = machine;
        machine.init()?;
        server.announce_term();

        Ok((
            RsmRuntime {
                me: agent.node_id(),
                name,
                config,
                machine,
                role: Role::Follower,
                incarnation: 0,
                next_counter: 0,
                next_tag: 0,
                applied_history: meta.history,
                applied_seqno: 0,
                available_seqno: meta.committed_seqno,
                reader_busy: false,
                pending_clients: HashMap::new(),
                sync_quorum_clients: HashMap::new(),
                sync_revisions: SyncRevisionQueue::new(),
                server,
                agent,
                rx_event,
                rx_msg,
                tx_msg,
            },
            handle,
        ))
    }

    /// Main event loop. Returns when the message channel closes (all
    /// handles dropped); errors are fatal to this machine's runtime.
    pub async fn run(&mut self) -> Result<(), ConclaveError> {
        self.maybe_start_reader();

        loop {
            tokio::select! {
                // client request or internal completion
                msg = self.rx_msg.recv() => {
                    match msg {
                        Some(msg) => self.handle_msg(msg)?,
                        None => break,
                    }
                },

                // term/metadata event from the node bus
                event = self.rx_event.recv() => {
                    match event {
                        Ok(event) => self.handle_event(event)?,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            pf_warn!(self.whoami(); "lagged {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                },
            }
        }

        self.machine.terminate();
        pf_info!(self.whoami(); "runtime stopped");
        Ok(())
    }

    /// Identity prefix for log lines.
    fn whoami(&self) -> String {
        format!("{}/{}", self.me, self.name)
    }

    /// Dispatcher of runtime messages.
    fn handle_msg(&mut self, msg: RsmMsg) -> Result<(), ConclaveError> {
        match msg {
            RsmMsg::Command { payload, resp } => {
                self.handle_command(payload, resp)
            }
            RsmMsg::Query { payload, resp } => {
                let _ = resp.send(self.machine.handle_query(&payload));
                Ok(())
            }
            RsmMsg::SyncRevision {
                history,
                seqno,
                timeout,
                resp,
            } => self.handle_sync_revision(history, seqno, timeout, resp),
            RsmMsg::GetAppliedRevision { kind, resp } => {
                self.handle_applied_revision(kind, resp)
            }
            RsmMsg::Entries {
                high_seqno,
                entries,
            } => self.handle_entries(high_seqno, entries),
            RsmMsg::ReaderDied(reason) => {
                logged_err!(self.whoami(); "reader died: {}", reason)
            }
            RsmMsg::SyncTimeout { seqno, tag } => {
                self.handle_sync_timeout(seqno, tag)
            }
            RsmMsg::SyncQuorumDone { tag, ok } => {
                self.handle_sync_quorum_done(tag, ok)
            }
        }
    }

    /// Handler of cluster events: term transitions and commit advances.
    fn handle_event(
        &mut self,
        event: ClusterEvent,
    ) -> Result<(), ConclaveError> {
        match event {
            ClusterEvent::TermStarted {
                history,
                term,
                high_seqno,
            } => match &self.role {
                Role::Follower => {
                    pf_info!(self.whoami(); "leading term {:?} from seqno {}",
                                            term, high_seqno);
                    self.role = Role::Leader {
                        history,
                        term,
                        term_seqno: high_seqno,
                    };
                    self.incarnation += 1;
                    Ok(())
                }
                Role::Leader {
                    history: h,
                    term: t,
                    ..
                } if *h == history && *t == term => {
                    // re-announcement of the term we already lead
                    Ok(())
                }
                Role::Leader { term: t, .. } => {
                    logged_err!(self.whoami();
                                "term {:?} started while leading {:?}",
                                term, t)
                }
            },
            ClusterEvent::TermFinished { history, term } => {
                let matches = matches!(
                    &self.role,
                    Role::Leader { history: h, term: t, .. }
                        if *h == history && *t == term
                );
                if matches {
                    pf_info!(self.whoami(); "term {:?} finished", term);
                    self.role = Role::Follower;
                    self.flush_leader_clients();
                }
                Ok(())
            }
            ClusterEvent::MetadataUpdated {
                committed_seqno, ..
            } => {
                if committed_seqno > self.available_seqno {
                    self.available_seqno = committed_seqno;
                    self.maybe_start_reader();
                }
                Ok(())
            }
        }
    }

    /// Flushes every client blocked on this leadership with `LeaderGone`.
    fn flush_leader_clients(&mut self) {
        for (_, resp) in self.pending_clients.drain() {
            let _ = resp.send(Err(RsmError::LeaderGone));
        }
        for (_, resp) in self.sync_quorum_clients.drain() {
            let _ = resp.send(Err(RsmError::LeaderGone));
        }
    }
}
