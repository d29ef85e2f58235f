//! Core data model: histories, terms, revisions, log entries, cluster
//! configurations, per-node metadata, and recovery branches.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Node ID type.
pub type NodeId = u8;

/// Log sequence number type. Seqnos start at 1; 0 means "nothing yet".
pub type Seqno = u64;

/// History ID type: an opaque name for an epoch of log continuity. Two logs
/// carrying the same history ID are prefix-compatible; differing history IDs
/// indicate a branch.
pub type HistoryId = String;

/// Leadership term: a strictly monotone `(number, leader)` pair. Terms
/// totally order candidate leaderships across a history.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Default,
    Serialize, Deserialize,
)]
pub struct Term {
    /// Term number.
    pub number: u64,

    /// ID of the candidate/leader that owns this term.
    pub leader: NodeId,
}

impl Term {
    /// The null term smaller than every real term.
    pub const ZERO: Term = Term {
        number: 0,
        leader: 0,
    };

    pub fn new(number: u64, leader: NodeId) -> Self {
        Term { number, leader }
    }
}

/// Externally visible version of a log entry.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Revision {
    /// History the entry belongs to.
    pub history: HistoryId,

    /// Term under which the entry was proposed.
    pub term: Term,

    /// Sequence number of the entry.
    pub seqno: Seqno,
}

impl Revision {
    pub fn new(history: HistoryId, term: Term, seqno: Seqno) -> Self {
        Revision {
            history,
            term,
            seqno,
        }
    }
}

/// Position of the tail of a log: the term of the highest entry plus its
/// seqno. Ordered lexicographically; used by the establish-term "who is
/// behind" comparison.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Serialize, Deserialize,
)]
pub struct LogPosition {
    /// Term of the highest log entry.
    pub term: Term,

    /// Seqno of the highest log entry.
    pub seqno: Seqno,
}

/// Leader-unique reference attached to a submitted command. The incarnation
/// token is bumped on every leadership acquisition of the issuing machine
/// runtime, which keeps refs from colliding across restarts.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash, Serialize,
    Deserialize,
)]
pub struct CommandRef {
    /// Leadership incarnation token of the issuing runtime.
    pub incarnation: u64,

    /// Monotone counter within the incarnation.
    pub counter: u64,
}

/// Per-machine configuration inside a cluster `Config`: names the machine
/// module implementing the replicated state machine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MachineSpec {
    /// Name of the machine module.
    pub module: String,
}

/// A stable cluster configuration.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Voting members.
    pub voters: HashSet<NodeId>,

    /// Registered state machines, keyed by machine name.
    pub machines: HashMap<String, MachineSpec>,
}

/// The value payload of a log entry.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum EntryValue {
    /// A state-machine mutation.
    Command {
        /// Leader-unique command reference.
        id: CommandRef,

        /// Name of the target state machine.
        machine: String,

        /// Opaque command payload, interpreted only by the machine module.
        payload: Vec<u8>,
    },

    /// A stable configuration.
    Config(Config),

    /// A joint (in-progress) configuration.
    Transition {
        /// Configuration being left.
        current: Config,

        /// Configuration being adopted.
        future: Config,
    },
}

/// A replicated log entry.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// History the entry belongs to.
    pub history: HistoryId,

    /// Term under which the entry was proposed.
    pub term: Term,

    /// Sequence number of the entry.
    pub seqno: Seqno,

    /// Entry payload.
    pub value: EntryValue,
}

impl LogEntry {
    /// The revision triple of this entry.
    pub fn revision(&self) -> Revision {
        Revision::new(self.history.clone(), self.term, self.seqno)
    }
}

/// The shape of the currently effective configuration.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ConfigValue {
    /// A stable configuration.
    Stable(Config),

    /// A joint configuration mid-transition.
    Transition {
        /// Configuration being left.
        current: Config,

        /// Configuration being adopted.
        future: Config,
    },
}

/// The effective configuration together with the revision of the log entry
/// (or provisioning record) that installed it.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    /// Stable or joint configuration value.
    pub value: ConfigValue,

    /// Revision at which this configuration was installed.
    pub revision: Revision,
}

impl MemberConfig {
    /// The "current" side of the configuration: the stable config itself,
    /// or the outgoing config of a joint transition.
    pub fn current(&self) -> &Config {
        match &self.value {
            ConfigValue::Stable(config) => config,
            ConfigValue::Transition { current, .. } => current,
        }
    }

    /// Registered machines of the current side.
    pub fn machines(&self) -> &HashMap<String, MachineSpec> {
        &self.current().machines
    }

    /// Whether this configuration is a joint transition.
    pub fn is_transition(&self) -> bool {
        matches!(self.value, ConfigValue::Transition { .. })
    }
}

/// Status of a quorum-failover branch.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum BranchStatus {
    /// Created but not yet resolved by a proposer.
    Pending,

    /// The forced configuration has been committed by the survivors.
    Resolved,
}

/// A quorum-failover branch: a recovery artifact instructing the next
/// proposer to continue with the given surviving peer set under a fresh
/// history. Creation requires unanimity among the survivors (external
/// protocol); resolution truncates only entries above the unanimous
/// committed seqno.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Branch {
    /// The new history the branch opens.
    pub history: HistoryId,

    /// Node coordinating the failover.
    pub coordinator: NodeId,

    /// Surviving peer set that continues the cluster.
    pub peers: HashSet<NodeId>,

    /// Branch lifecycle status.
    pub status: BranchStatus,

    /// Opaque payload carried for the failover tooling.
    pub opaque: Vec<u8>,
}

/// Per-node durable metadata owned by the agent.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// History this node's log belongs to.
    pub history: HistoryId,

    /// Highest term seen through appends.
    pub term: Term,

    /// Highest term this node has promised (voted for).
    pub term_voted: Term,

    /// Term of the highest log entry.
    pub high_term: Term,

    /// Seqno of the highest log entry.
    pub high_seqno: Seqno,

    /// Highest committed seqno known to this node.
    pub committed_seqno: Seqno,

    /// Effective configuration as recorded in the log (possibly not yet
    /// committed).
    pub member_config: MemberConfig,

    /// Externally supplied quorum-failover branch, if any.
    pub pending_branch: Option<Branch>,
}

impl Metadata {
    /// Position of this node's log tail.
    pub fn log_position(&self) -> LogPosition {
        LogPosition {
            term: self.high_term,
            seqno: self.high_seqno,
        }
    }
}

#[cfg(test)]
mod types_tests {
    use super::*;

    #[test]
    fn term_ordering() {
        assert!(Term::new(2, 0) > Term::new(1, 3));
        assert!(Term::new(2, 1) > Term::new(2, 0));
        assert!(Term::ZERO < Term::new(1, 0));
    }

    #[test]
    fn log_position_ordering() {
        let lo = LogPosition {
            term: Term::new(1, 0),
            seqno: 9,
        };
        let hi = LogPosition {
            term: Term::new(2, 1),
            seqno: 3,
        };
        assert!(hi > lo); // term dominates seqno
        assert!(
            LogPosition {
                term: Term::new(1, 0),
                seqno: 10,
            } > lo
        );
    }

    #[test]
    fn entry_codec_roundtrip() -> Result<(), crate::utils::ConclaveError> {
        let entry = LogEntry {
            history: "h0".into(),
            term: Term::new(1, 0),
            seqno: 7,
            value: EntryValue::Command {
                id: CommandRef {
                    incarnation: 3,
                    counter: 42,
                },
                machine: "kv".into(),
                payload: vec![1, 2, 3, 4],
            },
        };
        let bytes = rmp_serde::encode::to_vec(&entry)?;
        let back: LogEntry = rmp_serde::decode::from_slice(&bytes)?;
        assert_eq!(back, entry);
        Ok(())
    }

    #[test]
    fn member_config_current_side() {
        let mut cur = Config::default();
        cur.voters.insert(0);
        let mut fut = Config::default();
        fut.voters.insert(1);
        let mc = MemberConfig {
            value: ConfigValue::Transition {
                current: cur.clone(),
                future: fut,
            },
            revision: Revision::new("h0".into(), Term::new(1, 0), 4),
        };
        assert!(mc.is_transition());
        assert_eq!(mc.current(), &cur);
    }
}
