//! Per-node agent: the owner of the persistent log and metadata. The agent
//! answers term establishment, appends, and position probes from proposers,
//! and serves log reads to machine runtimes. It is the only component that
//! mutates durable state.

mod hub;
mod wal;

pub use hub::{AgentEvent, AgentHub, MonitorRef};

use std::path::Path;

use crate::events::{ClusterEvent, EventBus};
use crate::types::{
    Branch, Config, ConfigValue, EntryValue, HistoryId, LogEntry, LogPosition,
    MemberConfig, Metadata, NodeId, Revision, Seqno, Term,
};
use crate::utils::ConclaveError;
use wal::WriteAheadLog;

use serde::{Deserialize, Serialize};

use tokio::sync::{mpsc, oneshot};

/// Correlation token attached to proposer-issued requests and echoed in
/// replies.
pub type Opaque = u64;

/// Request issued by a proposer to a (possibly remote) agent.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum AgentRequest {
    /// Ask the agent to promise the given term. Carries the candidate's log
    /// position so the agent can refuse candidates that would lose entries.
    EstablishTerm {
        history: HistoryId,
        term: Term,
        position: LogPosition,
    },

    /// Replicate entries and/or advance the committed seqno.
    Append {
        history: HistoryId,
        term: Term,
        committed_seqno: Seqno,
        entries: Vec<LogEntry>,
    },

    /// Probe that the agent still honors the given term; the reply carries
    /// the agent's current metadata as a position report.
    EnsureTerm { history: HistoryId, term: Term },
}

/// Successful reply from an agent.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum AgentReply {
    /// Promise granted; carries the agent's metadata.
    Establish { metadata: Box<Metadata> },

    /// Entries durably appended and/or commit recorded.
    Append {
        high_seqno: Seqno,
        committed_seqno: Seqno,
    },

    /// Term still honored; carries the agent's metadata.
    Ensure { metadata: Box<Metadata> },
}

/// Error reply from an agent.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum AgentError {
    /// The agent has seen (or voted in) a term at least as high.
    ConflictingTerm(Term),

    /// The agent's log belongs to a different history.
    HistoryMismatch(HistoryId),

    /// The candidate's log position is behind the agent's.
    Behind(LogPosition),

    /// The append does not abut the agent's log tail; carries metadata so
    /// the proposer can reset its bookkeeping and backfill.
    MissingEntries(Box<Metadata>),

    /// Channel/transport-level failure.
    Transport(String),
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AgentError::ConflictingTerm(term) => {
                write!(f, "conflicting term {:?}", term)
            }
            AgentError::HistoryMismatch(history) => {
                write!(f, "history mismatch '{}'", history)
            }
            AgentError::Behind(position) => {
                write!(f, "behind position {:?}", position)
            }
            AgentError::MissingEntries(metadata) => {
                write!(f, "missing entries below {}", metadata.high_seqno)
            }
            AgentError::Transport(reason) => {
                write!(f, "transport failure: {}", reason)
            }
        }
    }
}

/// Record kinds persisted to the agent's WAL.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum WalRecord {
    /// Fresh provisioning snapshot; invalidates everything before it.
    Provision { metadata: Box<Metadata> },

    /// One appended log entry.
    Entry(LogEntry),

    /// The log tail above this seqno was overwritten.
    Truncate { high_seqno: Seqno },

    /// Mutable metadata fields at a point in time.
    Meta {
        history: HistoryId,
        term: Term,
        term_voted: Term,
        committed_seqno: Seqno,
        pending_branch: Option<Branch>,
    },
}

/// The agent's in-memory image of its durable state.
pub struct AgentCore {
    /// My node ID.
    me: NodeId,

    /// Durable metadata.
    metadata: Metadata,

    /// Provisioned configuration, the fallback when no config entry remains
    /// in the log.
    base_config: MemberConfig,

    /// Full log image; `log[i].seqno == i + 1`.
    log: Vec<LogEntry>,

    /// Durability backend, if configured.
    wal: Option<WriteAheadLog<WalRecord>>,

    /// Local event bus for metadata update notifications.
    events: EventBus,
}

impl AgentCore {
    /// Provisions a fresh agent with the given history and initial stable
    /// configuration. If a WAL path is given, the file is wiped and the
    /// provisioning snapshot becomes its first record.
    pub async fn provision(
        me: NodeId,
        history: HistoryId,
        config: Config,
        events: EventBus,
        wal_path: Option<&Path>,
    ) -> Result<Self, ConclaveError> {
        let base_config = MemberConfig {
            value: ConfigValue::Stable(config),
            revision: Revision::new(history.clone(), Term::ZERO, 0),
        };
        let metadata = Metadata {
            history,
            term: Term::ZERO,
            term_voted: Term::ZERO,
            high_term: Term::ZERO,
            high_seqno: 0,
            committed_seqno: 0,
            member_config: base_config.clone(),
            pending_branch: None,
        };

        let wal = match wal_path {
            Some(path) => {
                let mut wal = WriteAheadLog::open(path).await?;
                wal.reset().await?;
                wal.append(
                    &WalRecord::Provision {
                        metadata: Box::new(metadata.clone()),
                    },
                    true,
                )
                .await?;
                Some(wal)
            }
            None => None,
        };

        Ok(AgentCore {
            me,
            metadata,
            base_config,
            log: Vec::new(),
            wal,
            events,
        })
    }

    /// Rebuilds an agent from its WAL.
    pub async fn recover(
        me: NodeId,
        events: EventBus,
        wal_path: &Path,
    ) -> Result<Self, ConclaveError> {
        let mut wal = WriteAheadLog::open(wal_path).await?;
        let records = wal.load_all().await?;

        let mut metadata = None;
        let mut base_config = None;
        let mut log: Vec<LogEntry> = Vec::new();
        for record in records {
            match record {
                WalRecord::Provision { metadata: meta } => {
                    base_config = Some(meta.member_config.clone());
                    metadata = Some(*meta);
                    log.clear();
                }
                WalRecord::Entry(entry) => {
                    debug_assert_eq!(entry.seqno, log.len() as Seqno + 1);
                    log.push(entry);
                }
                WalRecord::Truncate { high_seqno } => {
                    log.truncate(high_seqno as usize);
                }
                WalRecord::Meta {
                    history,
                    term,
                    term_voted,
                    committed_seqno,
                    pending_branch,
                } => {
                    if let Some(meta) = metadata.as_mut() {
                        meta.history = history;
                        meta.term = term;
                        meta.term_voted = term_voted;
                        meta.committed_seqno = committed_seqno;
                        meta.pending_branch = pending_branch;
                    }
                }
            }
        }
        let (metadata, base_config) = match (metadata, base_config) {
            (Some(m), Some(b)) => (m, b),
            _ => {
                return logged_err!(me; "wal has no provisioning record");
            }
        };

        let mut core = AgentCore {
            me,
            metadata,
            base_config,
            log,
            wal: Some(wal),
            events,
        };
        core.metadata.high_seqno = core.log.len() as Seqno;
        core.metadata.high_term =
            core.log.last().map_or(Term::ZERO, |e| e.term);
        core.refresh_member_config();
        pf_info!(core.me; "recovered agent at high {} committed {}",
                          core.metadata.high_seqno,
                          core.metadata.committed_seqno);
        Ok(core)
    }

    /// Current metadata snapshot.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Checks the request history against ours. Returns true when the
    /// request legitimately switches us onto a pending branch's history.
    fn check_history(
        &self,
        history: &HistoryId,
    ) -> Result<bool, AgentError> {
        if *history == self.metadata.history {
            Ok(false)
        } else if self
            .metadata
            .pending_branch
            .as_ref()
            .is_some_and(|b| b.history == *history)
        {
            Ok(true)
        } else {
            Err(AgentError::HistoryMismatch(self.metadata.history.clone()))
        }
    }

    /// Checks that the given term is at least as high as everything we have
    /// promised or seen. Equal terms are accepted (idempotent re-requests
    /// from the same leader).
    fn check_term(&self, term: Term) -> Result<(), AgentError> {
        let floor = self.metadata.term.max(self.metadata.term_voted);
        if term < floor {
            Err(AgentError::ConflictingTerm(floor))
        } else {
            Ok(())
        }
    }

    /// Candidate-side term establishment on the local agent.
    pub async fn establish_local_term(
        &mut self,
        history: HistoryId,
        term: Term,
    ) -> Result<Metadata, AgentError> {
        let switching = self.check_history(&history)?;
        self.check_term(term)?;

        if switching {
            self.metadata.history = history;
        }
        self.metadata.term = term;
        self.metadata.term_voted = term;
        self.persist_meta().await;
        pf_debug!(self.me; "established local term {:?}", term);
        Ok(self.metadata.clone())
    }

    /// Follower-side promise for a remote candidate.
    pub async fn establish_term(
        &mut self,
        history: HistoryId,
        term: Term,
        position: LogPosition,
    ) -> Result<Metadata, AgentError> {
        let switching = self.check_history(&history)?;
        self.check_term(term)?;
        if self.metadata.log_position() > position {
            return Err(AgentError::Behind(self.metadata.log_position()));
        }

        if switching {
            self.metadata.history = history;
        }
        self.metadata.term = term;
        self.metadata.term_voted = term;
        self.persist_meta().await;
        pf_debug!(self.me; "promised term {:?} at position {:?}",
                           term, self.metadata.log_position());
        Ok(self.metadata.clone())
    }

    /// Term position probe.
    pub fn ensure_term(
        &self,
        history: HistoryId,
        term: Term,
    ) -> Result<Metadata, AgentError> {
        self.check_history(&history)?;
        self.check_term(term)?;
        Ok(self.metadata.clone())
    }

    /// Append entries and/or record a commit advance from the leader of
    /// `term`. Divergent uncommitted tail entries are overwritten; entries
    /// at or below our committed seqno are never touched.
    pub async fn append(
        &mut self,
        history: HistoryId,
        term: Term,
        committed_seqno: Seqno,
        entries: Vec<LogEntry>,
    ) -> Result<(Seqno, Seqno), AgentError> {
        let switching = self.check_history(&history)?;
        self.check_term(term)?;

        if switching {
            self.metadata.history = history;
        }
        self.metadata.term = term;
        self.metadata.term_voted = self.metadata.term_voted.max(term);

        if let Some(first) = entries.first() {
            if first.seqno > self.metadata.high_seqno + 1 {
                return Err(AgentError::MissingEntries(Box::new(
                    self.metadata.clone(),
                )));
            }

            // start past anything we already have committed
            let start = first.seqno.max(self.metadata.committed_seqno + 1);
            let last_seqno = entries.last().unwrap().seqno;
            if start <= last_seqno {
                if self.metadata.high_seqno >= start {
                    // overwrite a divergent uncommitted tail
                    self.log.truncate((start - 1) as usize);
                    if let Some(wal) = self.wal.as_mut() {
                        let _ = wal
                            .append(
                                &WalRecord::Truncate {
                                    high_seqno: start - 1,
                                },
                                false,
                            )
                            .await;
                    }
                }
                for entry in entries {
                    if entry.seqno < start {
                        continue;
                    }
                    debug_assert_eq!(
                        entry.seqno,
                        self.log.len() as Seqno + 1
                    );
                    if let Some(wal) = self.wal.as_mut() {
                        let _ = wal
                            .append(&WalRecord::Entry(entry.clone()), false)
                            .await;
                    }
                    self.log.push(entry);
                }
                self.metadata.high_seqno = self.log.len() as Seqno;
                self.metadata.high_term =
                    self.log.last().map_or(Term::ZERO, |e| e.term);
                self.refresh_member_config();
            }
        }

        // commits never run ahead of the local log
        let new_committed = committed_seqno.min(self.metadata.high_seqno);
        let commit_advanced = new_committed > self.metadata.committed_seqno;
        if commit_advanced {
            self.metadata.committed_seqno = new_committed;
            self.maybe_resolve_branch();
        }
        self.persist_meta().await;

        if commit_advanced {
            self.events.publish(ClusterEvent::MetadataUpdated {
                history: self.metadata.history.clone(),
                committed_seqno: self.metadata.committed_seqno,
            });
        }
        Ok((self.metadata.high_seqno, self.metadata.committed_seqno))
    }

    /// Synchronous log read over the inclusive seqno range.
    pub fn get_log(
        &self,
        from: Seqno,
        to: Seqno,
    ) -> Result<Vec<LogEntry>, ConclaveError> {
        if from == 0 || to > self.metadata.high_seqno {
            return logged_err!(self.me; "log range [{}, {}] out of bound {}",
                                        from, to, self.metadata.high_seqno);
        }
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self.log[(from - 1) as usize..to as usize].to_vec())
    }

    /// Installs or clears the externally supplied pending branch.
    pub async fn set_pending_branch(&mut self, branch: Option<Branch>) {
        self.metadata.pending_branch = branch;
        self.persist_meta().await;
    }

    /// Re-derives the effective configuration from the log tail, falling
    /// back to the provisioned configuration.
    fn refresh_member_config(&mut self) {
        for entry in self.log.iter().rev() {
            match &entry.value {
                EntryValue::Config(config) => {
                    self.metadata.member_config = MemberConfig {
                        value: ConfigValue::Stable(config.clone()),
                        revision: entry.revision(),
                    };
                    return;
                }
                EntryValue::Transition { current, future } => {
                    self.metadata.member_config = MemberConfig {
                        value: ConfigValue::Transition {
                            current: current.clone(),
                            future: future.clone(),
                        },
                        revision: entry.revision(),
                    };
                    return;
                }
                EntryValue::Command { .. } => {}
            }
        }
        self.metadata.member_config = self.base_config.clone();
    }

    /// Clears the pending branch once a stable configuration of the
    /// branch's history has committed.
    fn maybe_resolve_branch(&mut self) {
        let resolved = match self.metadata.pending_branch.as_ref() {
            Some(branch) => {
                self.metadata.history == branch.history
                    && !self.metadata.member_config.is_transition()
                    && self.metadata.member_config.revision.history
                        == branch.history
                    && self.metadata.member_config.revision.seqno
                        <= self.metadata.committed_seqno
            }
            None => false,
        };
        if resolved {
            pf_info!(self.me; "pending branch resolved");
            self.metadata.pending_branch = None;
        }
    }

    /// Persists the mutable metadata fields.
    async fn persist_meta(&mut self) {
        if let Some(wal) = self.wal.as_mut() {
            let _ = wal
                .append(
                    &WalRecord::Meta {
                        history: self.metadata.history.clone(),
                        term: self.metadata.term,
                        term_voted: self.metadata.term_voted,
                        committed_seqno: self.metadata.committed_seqno,
                        pending_branch: self.metadata.pending_branch.clone(),
                    },
                    true,
                )
                .await;
        }
    }
}

/// Calls servable by an agent task.
pub(crate) enum AgentCall {
    /// Candidate-side local term establishment.
    EstablishLocalTerm {
        history: HistoryId,
        term: Term,
        resp: oneshot::Sender<Result<Metadata, AgentError>>,
    },

    /// Metadata snapshot read.
    GetMetadata {
        resp: oneshot::Sender<Metadata>,
    },

    /// Synchronous log range read.
    GetLog {
        from: Seqno,
        to: Seqno,
        resp: oneshot::Sender<Result<Vec<LogEntry>, ConclaveError>>,
    },

    /// Install/clear a pending quorum-failover branch.
    SetPendingBranch {
        branch: Option<Branch>,
        resp: oneshot::Sender<()>,
    },

    /// Fire-and-forget proposer request; the reply flows back through the
    /// issuing hub's event channel.
    Rpc {
        opaque: Opaque,
        mref: MonitorRef,
        request: AgentRequest,
        reply_to: mpsc::UnboundedSender<AgentEvent>,
    },
}

/// Cloneable handle to a node's local agent task.
#[derive(Clone)]
pub struct LocalAgent {
    /// The agent's node ID.
    me: NodeId,

    /// Sender side of the agent's call channel.
    tx_call: mpsc::UnboundedSender<AgentCall>,
}

impl LocalAgent {
    /// The agent's node ID.
    pub fn node_id(&self) -> NodeId {
        self.me
    }

    /// Sender usable by an `AgentHub` to route requests to this agent.
    pub(crate) fn call_sender(&self) -> mpsc::UnboundedSender<AgentCall> {
        self.tx_call.clone()
    }

    pub async fn establish_local_term(
        &self,
        history: HistoryId,
        term: Term,
    ) -> Result<Metadata, AgentError> {
        let (resp, rx) = oneshot::channel();
        self.tx_call
            .send(AgentCall::EstablishLocalTerm {
                history,
                term,
                resp,
            })
            .map_err(|e| AgentError::Transport(e.to_string()))?;
        rx.await
            .map_err(|e| AgentError::Transport(e.to_string()))?
    }

    pub async fn get_metadata(&self) -> Result<Metadata, ConclaveError> {
        let (resp, rx) = oneshot::channel();
        self.tx_call
            .send(AgentCall::GetMetadata { resp })
            .map_err(ConclaveError::msg)?;
        Ok(rx.await?)
    }

    pub async fn get_log(
        &self,
        from: Seqno,
        to: Seqno,
    ) -> Result<Vec<LogEntry>, ConclaveError> {
        let (resp, rx) = oneshot::channel();
        self.tx_call
            .send(AgentCall::GetLog { from, to, resp })
            .map_err(ConclaveError::msg)?;
        rx.await?
    }

    pub async fn set_pending_branch(
        &self,
        branch: Option<Branch>,
    ) -> Result<(), ConclaveError> {
        let (resp, rx) = oneshot::channel();
        self.tx_call
            .send(AgentCall::SetPendingBranch { branch, resp })
            .map_err(ConclaveError::msg)?;
        Ok(rx.await?)
    }
}

/// Spawns the agent task serving the given core; returns the local handle.
pub fn spawn_agent(mut core: AgentCore) -> LocalAgent {
    let me = core.me;
    let (tx_call, mut rx_call) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        pf_debug!(me; "agent task spawned");
        while let Some(call) = rx_call.recv().await {
            match call {
                AgentCall::EstablishLocalTerm {
                    history,
                    term,
                    resp,
                } => {
                    let result =
                        core.establish_local_term(history, term).await;
                    let _ = resp.send(result);
                }
                AgentCall::GetMetadata { resp } => {
                    let _ = resp.send(core.metadata().clone());
                }
                AgentCall::GetLog { from, to, resp } => {
                    let _ = resp.send(core.get_log(from, to));
                }
                AgentCall::SetPendingBranch { branch, resp } => {
                    core.set_pending_branch(branch).await;
                    let _ = resp.send(());
                }
                AgentCall::Rpc {
                    opaque,
                    mref,
                    request,
                    reply_to,
                } => {
                    let result = match request {
                        AgentRequest::EstablishTerm {
                            history,
                            term,
                            position,
                        } => core
                            .establish_term(history, term, position)
                            .await
                            .map(|metadata| AgentReply::Establish {
                                metadata: Box::new(metadata),
                            }),
                        AgentRequest::Append {
                            history,
                            term,
                            committed_seqno,
                            entries,
                        } => core
                            .append(history, term, committed_seqno, entries)
                            .await
                            .map(|(high_seqno, committed_seqno)| {
                                AgentReply::Append {
                                    high_seqno,
                                    committed_seqno,
                                }
                            }),
                        AgentRequest::EnsureTerm { history, term } => core
                            .ensure_term(history, term)
                            .map(|metadata| AgentReply::Ensure {
                                metadata: Box::new(metadata),
                            }),
                    };
                    let _ = reply_to.send(AgentEvent::Reply {
                        peer: me,
                        opaque,
                        mref,
                        result,
                    });
                }
            }
        }
        pf_debug!(me; "agent task exited");
    });

    LocalAgent { me, tx_call }
}
