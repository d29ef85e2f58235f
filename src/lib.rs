//! Public interface to the Conclave core library: the consensus engine of
//! a cluster-membership and metadata replication system.

#[macro_use]
mod utils;

mod agent;
mod events;
mod liveness;
mod proposer;
mod quorum;
mod rsm;
mod server;
mod types;

pub use utils::ConclaveError;

pub use types::{
    Branch, BranchStatus, CommandRef, Config, ConfigValue, EntryValue,
    HistoryId, LogEntry, LogPosition, MachineSpec, MemberConfig, Metadata,
    NodeId, Revision, Seqno, Term,
};

pub use quorum::Quorum;

pub use events::{ClusterEvent, EventBus};
pub use liveness::{Liveness, LivenessEvent};

pub use agent::{
    spawn_agent, AgentCore, AgentError, AgentEvent, AgentHub, AgentReply,
    AgentRequest, LocalAgent, MonitorRef, Opaque,
};

pub use proposer::{
    CommandEnvelope, Proposer, ProposerClient, ProposerConfig, ProposerExit,
    ProposerMsg, ProposerReply, ReplyTo,
};

pub use rsm::{
    CommandDecision, KvCommand, KvMachine, KvQuery, KvResult, Machine,
    ReadKind, RsmError, RsmHandle, RsmMsg, RsmRuntime, RuntimeConfig,
};

pub use server::{spawn_server, ServerHandle, ServerMsg};
