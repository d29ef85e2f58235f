//! Proposer -- term establishment phase.

use super::*;

use crate::agent::{AgentError, AgentReply};
use crate::types::Metadata;

impl Proposer {
    /// Enters the establish phase: grab the term on the local agent, seed
    /// state from its metadata, self-vote, and broadcast establish-term to
    /// the remaining live quorum peers. May immediately enter the proposing
    /// phase when the local vote alone satisfies the quorum.
    pub(super) async fn enter_establishing(
        &mut self,
    ) -> Result<Option<ProposerExit>, ConclaveError> {
        pf_info!(self.me; "establishing term {:?} of history '{}'",
                          self.term, self.history);

        let meta = match self
            .local_agent
            .establish_local_term(self.history.clone(), self.term)
            .await
        {
            Ok(meta) => meta,
            Err(e) => {
                pf_warn!(self.me; "local establish term failed: {}", e);
                return Ok(Some(ProposerExit::LocalEstablishFailed));
            }
        };

        self.committed_seqno = meta.committed_seqno;
        self.high_seqno = meta.high_seqno;
        self.pending_high_seqno = meta.high_seqno;
        self.local_position = meta.log_position();
        self.member_config = meta.member_config.clone();
        self.branch = meta.pending_branch.clone();
        self.refresh_quorum();

        // write off quorum peers that are not live right now
        let live = self.liveness.live_peers();
        self.failed_votes = self
            .quorum_peers
            .iter()
            .copied()
            .filter(|&peer| peer != self.me && !live.contains(&peer))
            .collect();
        if !self.quorum.feasible(&self.quorum_peers, &self.failed_votes) {
            return Ok(Some(ProposerExit::NoQuorum));
        }

        // the local establishment above is our own vote
        self.hub.monitor(self.me);
        self.statuses.seed(self.me, self.term, &meta);
        self.votes.insert(self.me);
        if self.quorum.have_quorum(&self.votes) {
            return self.enter_proposing().await;
        }

        for peer in self.quorum_peers.clone() {
            if peer == self.me || !live.contains(&peer) {
                continue;
            }
            self.hub.monitor(peer);
            self.hub.send(
                peer,
                make_opaque(OpaqueKind::Establish, 0),
                AgentRequest::EstablishTerm {
                    history: self.history.clone(),
                    term: self.term,
                    position: self.local_position,
                },
            );
        }

        self.establish_timer.kickoff(Duration::from_millis(
            self.config.establish_term_timeout_ms,
        ))?;
        Ok(None)
    }

    /// Handler of an establish-term reply. Late replies arriving after the
    /// proposing phase began are treated as position probes.
    pub(super) async fn handle_establish_reply(
        &mut self,
        peer: NodeId,
        result: Result<AgentReply, AgentError>,
    ) -> Result<Option<ProposerExit>, ConclaveError> {
        if self.phase == Phase::Proposing {
            return self.handle_probe_reply(peer, result).await;
        }

        match result {
            Ok(AgentReply::Establish { metadata }) => {
                self.record_promise(peer, &metadata);
                if self.quorum.have_quorum(&self.votes) {
                    return self.enter_proposing().await;
                }
                Ok(None)
            }
            Ok(reply) => {
                logged_err!(self.me; "unexpected establish reply {:?}", reply)
            }
            Err(AgentError::Behind(position)) => {
                // we may still win with the remaining peers
                pf_warn!(self.me; "peer {} is ahead at {:?}", peer, position);
                self.failed_votes.insert(peer);
                if !self
                    .quorum
                    .feasible(&self.quorum_peers, &self.failed_votes)
                {
                    Ok(Some(ProposerExit::NoQuorum))
                } else {
                    Ok(None)
                }
            }
            Err(AgentError::ConflictingTerm(term)) => {
                Ok(Some(ProposerExit::ConflictingTerm(term)))
            }
            Err(AgentError::HistoryMismatch(history)) => {
                Ok(Some(ProposerExit::HistoryMismatch(history)))
            }
            Err(e) => Ok(Some(ProposerExit::UnexpectedError(format!(
                "establish reply from {}: {}",
                peer, e
            )))),
        }
    }

    /// Records a promise: seed the peer's status row, count its vote, and
    /// learn any commit the peer knows about (sound because the promise
    /// carries the highest entry known to a quorum).
    fn record_promise(&mut self, peer: NodeId, meta: &Metadata) {
        pf_debug!(self.me; "promise <- {} high {} committed {}",
                           peer, meta.high_seqno, meta.committed_seqno);

        if meta.committed_seqno > self.committed_seqno {
            self.committed_seqno = meta.committed_seqno;
            if self.high_seqno < self.committed_seqno {
                self.high_seqno = self.committed_seqno;
            }
            if self.pending_high_seqno < self.high_seqno {
                self.pending_high_seqno = self.high_seqno;
            }
        }

        self.statuses.seed(peer, self.term, meta);
        self.failed_votes.remove(&peer);
        self.votes.insert(peer);
    }

    /// Enters the proposing phase: announce readiness, resolve a pending
    /// branch or complete an in-flight transition, then replicate.
    pub(super) async fn enter_proposing(
        &mut self,
    ) -> Result<Option<ProposerExit>, ConclaveError> {
        debug_assert_eq!(self.phase, Phase::Establishing);
        self.phase = Phase::Proposing;
        self.establish_timer.cancel()?;
        pf_info!(self.me; "proposing in term {:?} at high {}",
                          self.term, self.high_seqno);

        self.server.proposer_ready(
            self.history.clone(),
            self.term,
            self.high_seqno,
        );

        if self.branch.is_some() {
            self.resolve_branch();
        } else {
            self.maybe_complete_transition();
        }
        self.maybe_finish_config_change();
        self.replicate().await?;
        self.probe_missing_peers();

        // serve quorum syncs that queued up while establishing
        for from in std::mem::take(&mut self.postponed_syncs) {
            self.handle_sync_quorum(from);
        }
        Ok(None)
    }
}
