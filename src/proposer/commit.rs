//! Proposer -- append acknowledgements and commit advancement.

use super::*;

use crate::agent::{AgentError, AgentReply};

impl Proposer {
    /// Handler of an append reply from a peer's agent.
    pub(super) async fn handle_append_reply(
        &mut self,
        peer: NodeId,
        result: Result<AgentReply, AgentError>,
    ) -> Result<Option<ProposerExit>, ConclaveError> {
        match result {
            Ok(AgentReply::Append {
                high_seqno,
                committed_seqno,
            }) => {
                pf_trace!(self.me; "append ok <- {} high {} committed {}",
                                   peer, high_seqno, committed_seqno);
                if let Some(row) = self.statuses.get_mut(peer) {
                    row.record_ack(high_seqno, committed_seqno);
                }
                self.failed_votes.remove(&peer);

                if let Some(deduced) = self.deduce_commit() {
                    // peers going down may deduce a lower value; commits
                    // never regress
                    if deduced > self.committed_seqno {
                        self.advance_commit(deduced).await?;
                    }
                }
                Ok(None)
            }
            Ok(reply) => {
                logged_err!(self.me; "unexpected append reply {:?}", reply)
            }
            Err(AgentError::MissingEntries(metadata)) => {
                // reset the peer's bookkeeping; the next append backfills
                pf_warn!(self.me; "peer {} is missing entries below {}",
                                  peer, metadata.high_seqno);
                self.statuses.seed(peer, self.term, &metadata);
                self.replicate().await?;
                Ok(None)
            }
            Err(AgentError::ConflictingTerm(term)) => {
                Ok(Some(ProposerExit::ConflictingTerm(term)))
            }
            Err(AgentError::HistoryMismatch(history)) => {
                Ok(Some(ProposerExit::HistoryMismatch(history)))
            }
            Err(e) => Ok(Some(ProposerExit::UnexpectedError(format!(
                "append reply from {}: {}",
                peer, e
            )))),
        }
    }

    /// Deduces the committed seqno from the acked seqnos of all tracked
    /// peers: walk peers in descending acked order, growing the vote set
    /// until the effective quorum is satisfied; the seqno at that point is
    /// acked by every member of the satisfying set.
    pub(super) fn deduce_commit(&self) -> Option<Seqno> {
        let mut acked = self.statuses.acked_seqnos();
        acked.sort_by(|a, b| b.1.cmp(&a.1));

        let mut voteset = HashSet::new();
        for (peer, seqno) in acked {
            voteset.insert(peer);
            if self.quorum.have_quorum(&voteset) {
                return Some(seqno);
            }
        }
        None
    }

    /// Advances the committed seqno, retires the committed prefix of the
    /// pending queue, performs post-commit housekeeping, and re-replicates
    /// so followers learn the new commit index.
    async fn advance_commit(
        &mut self,
        committed: Seqno,
    ) -> Result<(), ConclaveError> {
        debug_assert!(committed > self.committed_seqno);
        debug_assert!(committed <= self.pending_high_seqno);
        pf_debug!(self.me; "commit advanced {} -> {}",
                           self.committed_seqno, committed);

        self.committed_seqno = committed;
        if self.high_seqno < committed {
            self.high_seqno = committed;
        }
        self.pending.drop_through(committed);

        self.postcommit_housekeeping();
        self.replicate().await
    }

    /// Post-commit housekeeping: finish branch resolution, advance a joint
    /// transition to its future config, acknowledge a completed config
    /// change, and replay postponed config requests.
    fn postcommit_housekeeping(&mut self) {
        self.maybe_clear_branch();
        self.maybe_complete_transition();
        self.maybe_finish_config_change();
        self.reevaluate_sync_requests();
    }
}
