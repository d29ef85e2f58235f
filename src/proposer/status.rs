//! Proposer-private replication bookkeeping: the per-peer status table and
//! the in-memory queue of proposed-but-uncommitted entries. Both live on
//! the proposer's single task; no locking anywhere.

use std::collections::{HashMap, VecDeque};

use crate::types::{LogEntry, Metadata, NodeId, Seqno, Term};

/// Per-follower replication status (the proposer's own node included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PeerStatus {
    /// The peer holds uncommitted entries from a different term and must
    /// receive an append even if nothing new is pending, so that its
    /// divergent tail gets overwritten.
    pub needs_sync: bool,

    /// Highest entry seqno sent to the peer.
    pub sent_seqno: Seqno,

    /// Highest committed seqno sent to the peer.
    pub sent_commit_seqno: Seqno,

    /// Highest entry seqno the peer has acknowledged.
    pub acked_seqno: Seqno,

    /// Highest committed seqno the peer has acknowledged.
    pub acked_commit_seqno: Seqno,
}

impl PeerStatus {
    /// Initializes a status row from a peer's promise (or probe) metadata.
    ///
    /// A peer that has already voted in our term cannot hold entries from
    /// a conflicting leader of this term, so its full log is trusted.
    /// Otherwise only its committed prefix is trusted: replication restarts
    /// from the peer's committed seqno and, if the peer reports uncommitted
    /// entries above it, they must be overwritten by the next append.
    pub fn from_promise(our_term: Term, meta: &Metadata) -> Self {
        if meta.term_voted == our_term {
            PeerStatus {
                needs_sync: false,
                sent_seqno: meta.high_seqno,
                sent_commit_seqno: meta.committed_seqno,
                acked_seqno: meta.high_seqno,
                acked_commit_seqno: meta.committed_seqno,
            }
        } else {
            PeerStatus {
                needs_sync: meta.high_seqno > meta.committed_seqno,
                sent_seqno: meta.committed_seqno,
                sent_commit_seqno: meta.committed_seqno,
                acked_seqno: meta.committed_seqno,
                acked_commit_seqno: meta.committed_seqno,
            }
        }
    }

    /// Records an append acknowledgement, clamping so that acked values
    /// never exceed sent values.
    pub fn record_ack(&mut self, high_seqno: Seqno, committed_seqno: Seqno) {
        self.acked_seqno =
            self.acked_seqno.max(high_seqno.min(self.sent_seqno));
        self.acked_commit_seqno = self
            .acked_commit_seqno
            .max(committed_seqno.min(self.sent_commit_seqno));
    }
}

/// Map from peer ID -> replication status.
#[derive(Debug, Default)]
pub(crate) struct StatusTable {
    rows: HashMap<NodeId, PeerStatus>,
}

impl StatusTable {
    pub fn new() -> Self {
        StatusTable {
            rows: HashMap::new(),
        }
    }

    /// (Re)initializes a peer's row from promise metadata.
    pub fn seed(&mut self, peer: NodeId, our_term: Term, meta: &Metadata) {
        self.rows
            .insert(peer, PeerStatus::from_promise(our_term, meta));
    }

    pub fn remove(&mut self, peer: NodeId) {
        self.rows.remove(&peer);
    }

    pub fn contains(&self, peer: NodeId) -> bool {
        self.rows.contains_key(&peer)
    }

    pub fn get(&self, peer: NodeId) -> Option<&PeerStatus> {
        self.rows.get(&peer)
    }

    pub fn get_mut(&mut self, peer: NodeId) -> Option<&mut PeerStatus> {
        self.rows.get_mut(&peer)
    }

    /// IDs of all peers currently tracked.
    pub fn peers(&self) -> Vec<NodeId> {
        self.rows.keys().copied().collect()
    }

    /// `(peer, acked_seqno)` pairs for commit deduction.
    pub fn acked_seqnos(&self) -> Vec<(NodeId, Seqno)> {
        self.rows
            .iter()
            .map(|(&peer, row)| (peer, row.acked_seqno))
            .collect()
    }

    /// Clamps every row back to the given seqno and forces a sync append;
    /// used when branch resolution discards the uncommitted log tail.
    pub fn clamp_to(&mut self, seqno: Seqno) {
        for row in self.rows.values_mut() {
            row.sent_seqno = row.sent_seqno.min(seqno);
            row.sent_commit_seqno = row.sent_commit_seqno.min(seqno);
            row.acked_seqno = row.acked_seqno.min(seqno);
            row.acked_commit_seqno = row.acked_commit_seqno.min(seqno);
            row.needs_sync = true;
        }
    }
}

/// FIFO of proposed entries not yet committed; all seqnos are above the
/// proposer's committed seqno and contiguous up to its pending high seqno.
#[derive(Debug, Default)]
pub(crate) struct PendingEntries {
    entries: VecDeque<LogEntry>,
}

impl PendingEntries {
    pub fn new() -> Self {
        PendingEntries {
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        debug_assert!(self
            .entries
            .back()
            .map_or(true, |last| last.seqno + 1 == entry.seqno));
        self.entries.push_back(entry);
    }

    /// Drops the committed prefix (entries with `seqno <= through`).
    pub fn drop_through(&mut self, through: Seqno) {
        while self
            .entries
            .front()
            .is_some_and(|entry| entry.seqno <= through)
        {
            self.entries.pop_front();
        }
    }

    /// Clones out all entries with `seqno > after`, in order.
    pub fn tail_from(&self, after: Seqno) -> Vec<LogEntry> {
        self.entries
            .iter()
            .skip_while(|entry| entry.seqno <= after)
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
