//! Proposer -- command intake and the append/replication path.

use super::*;

use crate::agent::{AgentError, AgentReply};
use crate::types::{EntryValue, LogEntry};

impl Proposer {
    /// Handler of a client command batch. Commands naming an unregistered
    /// machine are dropped with a warning; this is a best-effort path and
    /// such clients receive no reply.
    pub(super) async fn handle_commands(
        &mut self,
        batch: Vec<CommandEnvelope>,
    ) -> Result<(), ConclaveError> {
        if self.phase != Phase::Proposing {
            pf_warn!(self.me; "dropping {} commands while establishing",
                              batch.len());
            return Ok(());
        }

        for cmd in batch {
            if !self.member_config.machines().contains_key(&cmd.machine) {
                pf_warn!(self.me; "dropping command for unknown machine '{}'",
                                  cmd.machine);
                continue;
            }
            self.propose_entry(EntryValue::Command {
                id: cmd.id,
                machine: cmd.machine,
                payload: cmd.payload,
            });
        }
        self.replicate().await
    }

    /// Wraps a value into a log entry at the next pending seqno and queues
    /// it for replication. Returns the entry's revision.
    pub(super) fn propose_entry(&mut self, value: EntryValue) -> Revision {
        let seqno = self.pending_high_seqno + 1;
        let entry = LogEntry {
            history: self.history.clone(),
            term: self.term,
            seqno,
            value,
        };
        let revision = entry.revision();
        pf_trace!(self.me; "proposed entry at seqno {}", seqno);
        self.pending.push(entry);
        self.pending_high_seqno = seqno;
        revision
    }

    /// Sends an append to every live tracked peer that is missing entries,
    /// lags on the commit index, or carries the needs-sync flag. Sent
    /// bookkeeping is bumped immediately; error paths reset it.
    pub(super) async fn replicate(&mut self) -> Result<(), ConclaveError> {
        let live = self.liveness.live_peers();
        for peer in self.statuses.peers() {
            if peer != self.me && !live.contains(&peer) {
                continue;
            }
            let (needs_sync, sent_seqno, sent_commit_seqno) =
                match self.statuses.get(peer) {
                    Some(row) => {
                        (row.needs_sync, row.sent_seqno, row.sent_commit_seqno)
                    }
                    None => continue,
                };
            if !needs_sync
                && self.pending_high_seqno <= sent_seqno
                && self.committed_seqno <= sent_commit_seqno
            {
                continue;
            }

            let entries = self.entries_after(sent_seqno).await?;
            pf_trace!(self.me; "append -> {} with {} entries committed {}",
                               peer, entries.len(), self.committed_seqno);
            self.hub.send(
                peer,
                make_opaque(OpaqueKind::Append, 0),
                AgentRequest::Append {
                    history: self.history.clone(),
                    term: self.term,
                    committed_seqno: self.committed_seqno,
                    entries,
                },
            );
            if let Some(row) = self.statuses.get_mut(peer) {
                row.sent_seqno = self.pending_high_seqno;
                row.sent_commit_seqno = self.committed_seqno;
                row.needs_sync = false;
            }
        }
        Ok(())
    }

    /// Collects the entries in `(after, pending_high_seqno]`: the committed
    /// part is backfilled synchronously from the local agent, the rest comes
    /// from the in-memory pending queue. The local agent always holds the
    /// committed prefix because the effective quorum requires the local
    /// node's acknowledgement.
    async fn entries_after(
        &mut self,
        after: Seqno,
    ) -> Result<Vec<LogEntry>, ConclaveError> {
        let backfill_to = self.committed_seqno.min(self.pending_high_seqno);
        let mut entries = if after < backfill_to {
            self.local_agent.get_log(after + 1, backfill_to).await?
        } else {
            Vec::new()
        };
        entries.extend(self.pending.tail_from(after.max(backfill_to)));
        Ok(entries)
    }

    /// Probes live quorum peers that have no status row yet (e.g. peers
    /// introduced by a config change); their probe replies seed status.
    pub(super) fn probe_missing_peers(&mut self) {
        let live = self.liveness.live_peers();
        for peer in self.quorum_peers.clone() {
            if peer == self.me
                || self.statuses.contains(peer)
                || !live.contains(&peer)
            {
                continue;
            }
            self.send_probe(peer);
        }
    }

    /// Handler of an `ensure_term` position probe reply (also used for late
    /// establish replies). A successful probe seeds the peer's status row
    /// and triggers catch-up replication.
    pub(super) async fn handle_probe_reply(
        &mut self,
        peer: NodeId,
        result: Result<AgentReply, AgentError>,
    ) -> Result<Option<ProposerExit>, ConclaveError> {
        match result {
            Ok(AgentReply::Ensure { metadata })
            | Ok(AgentReply::Establish { metadata }) => {
                self.failed_votes.remove(&peer);
                if !self.statuses.contains(peer) {
                    pf_debug!(self.me; "probe seeded status of peer {}", peer);
                    self.statuses.seed(peer, self.term, &metadata);
                    self.replicate().await?;
                }
                Ok(None)
            }
            Ok(reply) => {
                logged_err!(self.me; "unexpected probe reply {:?}", reply)
            }
            Err(AgentError::ConflictingTerm(term)) => {
                Ok(Some(ProposerExit::ConflictingTerm(term)))
            }
            Err(AgentError::HistoryMismatch(history)) => {
                Ok(Some(ProposerExit::HistoryMismatch(history)))
            }
            Err(e) => {
                // probe failures are not fatal; a monitor DOWN follows if
                // the peer is truly gone
                pf_warn!(self.me; "probe reply error from {}: {}", peer, e);
                Ok(None)
            }
        }
    }
}
