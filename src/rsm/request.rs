//! Runtime -- client request entrance: commands, revision syncs, and
//! applied-revision reads.

use super::*;

use crate::proposer::ProposerReply;
use crate::types::CommandRef;

use tokio::time;

impl<M: Machine> RsmRuntime<M> {
    /// Handler of a client command. Only the leader admits commands; the
    /// machine module decides between submitting to the log and rejecting
    /// immediately.
    pub(super) fn handle_command(
        &mut self,
        payload: Vec<u8>,
        resp: oneshot::Sender<Result<Vec<u8>, RsmError>>,
    ) -> Result<(), ConclaveError> {
        let (history, term) = match &self.role {
            Role::Leader { history, term, .. } => (history.clone(), *term),
            Role::Follower => {
                let _ = resp.send(Err(RsmError::NotLeader));
                return Ok(());
            }
        };

        match self.machine.handle_command(&payload) {
            CommandDecision::Reject(reply) => {
                // deterministic rejection consumes no log slot
                let _ = resp.send(Ok(reply));
            }
            CommandDecision::Apply => {
                let id = CommandRef {
                    incarnation: self.incarnation,
                    counter: self.next_counter,
                };
                self.next_counter += 1;
                self.pending_clients.insert(id, resp);
                self.server.rsm_command(
                    history,
                    term,
                    self.name.clone(),
                    id,
                    payload,
                );
                pf_trace!(self.whoami(); "submitted command {:?}", id);
            }
        }
        Ok(())
    }

    /// Handler of a sync-revision request: reply immediately when already
    /// applied, otherwise enqueue with a timeout timer.
    pub(super) fn handle_sync_revision(
        &mut self,
        history: HistoryId,
        seqno: Seqno,
        timeout: Duration,
        resp: oneshot::Sender<Result<(), RsmError>>,
    ) -> Result<(), ConclaveError> {
        if history != self.applied_history {
            let _ = resp.send(Err(RsmError::HistoryMismatch));
            return Ok(());
        }
        if seqno <= self.applied_seqno {
            let _ = resp.send(Ok(()));
            return Ok(());
        }

        let tag = self.next_tag;
        self.next_tag += 1;
        self.sync_revisions.insert(seqno, tag, history, resp);

        // expiry is delivered as a message so it is serialized with the
        // apply loop; a waiter satisfied first makes the firing a no-op
        let tx_msg = self.tx_msg.clone();
        tokio::spawn(async move {
            time::sleep(timeout).await;
            let _ = tx_msg.send(RsmMsg::SyncTimeout { seqno, tag });
        });
        Ok(())
    }

    /// Handler of a sync-revision timer expiry.
    pub(super) fn handle_sync_timeout(
        &mut self,
        seqno: Seqno,
        tag: u64,
    ) -> Result<(), ConclaveError> {
        if let Some(waiter) = self.sync_revisions.remove(seqno, tag) {
            pf_debug!(self.whoami(); "sync revision {} timed out", seqno);
            let _ = waiter.resp.send(Err(RsmError::Timeout));
        }
        Ok(())
    }

    /// Handler of an applied-revision read (leader only). The reported
    /// seqno never falls below the term-start seqno, which guards the
    /// first moments of a new term before catch-up entries have applied.
    pub(super) fn handle_applied_revision(
        &mut self,
        kind: ReadKind,
        resp: oneshot::Sender<Result<(HistoryId, Seqno), RsmError>>,
    ) -> Result<(), ConclaveError> {
        let (history, term) = match &self.role {
            Role::Leader { history, term, .. } => (history.clone(), *term),
            Role::Follower => {
                let _ = resp.send(Err(RsmError::NotLeader));
                return Ok(());
            }
        };

        match kind {
            ReadKind::Leader => {
                let _ = resp.send(Ok(self.leader_revision()));
            }
            ReadKind::Quorum => {
                let tag = self.next_tag;
                self.next_tag += 1;
                self.sync_quorum_clients.insert(tag, resp);

                // relay the proposer's verdict back into our own mailbox
                let (from, rx) = oneshot::channel();
                self.server.sync_quorum(history, term, from);
                let tx_msg = self.tx_msg.clone();
                tokio::spawn(async move {
                    let ok =
                        matches!(rx.await, Ok(ProposerReply::SyncOk));
                    let _ = tx_msg.send(RsmMsg::SyncQuorumDone { tag, ok });
                });
            }
        }
        Ok(())
    }

    /// Handler of a completed quorum sync for an applied-revision read.
    pub(super) fn handle_sync_quorum_done(
        &mut self,
        tag: u64,
        ok: bool,
    ) -> Result<(), ConclaveError> {
        let resp = match self.sync_quorum_clients.remove(&tag) {
            Some(resp) => resp,
            None => return Ok(()), // already flushed by a term end
        };
        if !ok {
            let _ = resp.send(Err(RsmError::NoQuorum));
        } else if matches!(self.role, Role::Leader { .. }) {
            let _ = resp.send(Ok(self.leader_revision()));
        } else {
            let _ = resp.send(Err(RsmError::LeaderGone));
        }
        Ok(())
    }

    /// The applied revision reported to leader-read callers.
    fn leader_revision(&self) -> (HistoryId, Seqno) {
        match &self.role {
            Role::Leader {
                history,
                term_seqno,
                ..
            } => (history.clone(), (*term_seqno).max(self.applied_seqno)),
            Role::Follower => unreachable!("leader_revision on follower"),
        }
    }
}
