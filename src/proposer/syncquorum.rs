//! Proposer -- quorum sync for read linearization. A sync request succeeds
//! once a quorum of peers confirms (via `ensure_term`) that this proposer's
//! term still stands, proving no newer leader could have committed writes
//! the caller would miss.

use super::*;

use crate::agent::{AgentError, AgentReply};

/// One in-flight quorum sync request.
pub(super) struct SyncRequest {
    /// Reply slot of the waiting client.
    pub from: ReplyTo,

    /// Peers that have confirmed the term.
    pub votes: HashSet<NodeId>,

    /// Peers written off for this request.
    pub failed_votes: HashSet<NodeId>,
}

impl Proposer {
    /// Handler of a quorum sync request: register it with dead peers
    /// pre-counted as failed, then probe all live quorum peers.
    pub(super) fn handle_sync_quorum(&mut self, from: ReplyTo) {
        let live = self.liveness.live_peers();
        let failed_votes: HashSet<NodeId> = self
            .quorum_peers
            .iter()
            .copied()
            .filter(|&peer| peer != self.me && !live.contains(&peer))
            .collect();

        if !self.quorum.feasible(&self.quorum_peers, &failed_votes) {
            self.server
                .reply_requests(vec![(from, ProposerReply::NoQuorum)]);
            return;
        }

        let tag = self.next_sync_tag;
        self.next_sync_tag += 1;
        pf_debug!(self.me; "quorum sync {} started", tag);

        for peer in self.quorum_peers.clone() {
            if peer != self.me && !live.contains(&peer) {
                continue;
            }
            self.hub.send(
                peer,
                make_opaque(OpaqueKind::SyncQuorum, tag),
                AgentRequest::EnsureTerm {
                    history: self.history.clone(),
                    term: self.term,
                },
            );
        }
        self.sync_requests.insert(
            tag,
            SyncRequest {
                from,
                votes: HashSet::new(),
                failed_votes,
            },
        );
    }

    /// Handler of an `ensure_term` reply tagged with a sync request.
    pub(super) fn handle_sync_reply(
        &mut self,
        tag: u64,
        peer: NodeId,
        result: Result<AgentReply, AgentError>,
    ) -> Result<Option<ProposerExit>, ConclaveError> {
        match result {
            Ok(AgentReply::Ensure { metadata }) => {
                self.failed_votes.remove(&peer);
                if !self.statuses.contains(peer) {
                    self.statuses.seed(peer, self.term, &metadata);
                }
                if let Some(request) = self.sync_requests.get_mut(&tag) {
                    request.votes.insert(peer);
                    if self.quorum.have_quorum(&request.votes) {
                        let request = self.sync_requests.remove(&tag).unwrap();
                        pf_debug!(self.me; "quorum sync {} ok", tag);
                        self.server.reply_requests(vec![(
                            request.from,
                            ProposerReply::SyncOk,
                        )]);
                    }
                }
                Ok(None)
            }
            Ok(reply) => {
                logged_err!(self.me; "unexpected sync reply {:?}", reply)
            }
            Err(AgentError::ConflictingTerm(term)) => {
                Ok(Some(ProposerExit::ConflictingTerm(term)))
            }
            Err(AgentError::HistoryMismatch(history)) => {
                Ok(Some(ProposerExit::HistoryMismatch(history)))
            }
            Err(e) => {
                pf_warn!(self.me; "sync reply error from {}: {}", peer, e);
                self.fail_sync_vote(tag, peer);
                Ok(None)
            }
        }
    }

    /// Counts a failed vote against one sync request; replies no-quorum if
    /// that makes the request infeasible.
    fn fail_sync_vote(&mut self, tag: u64, peer: NodeId) {
        let infeasible = match self.sync_requests.get_mut(&tag) {
            Some(request) => {
                if request.votes.contains(&peer) {
                    return;
                }
                request.failed_votes.insert(peer);
                !self
                    .quorum
                    .feasible(&self.quorum_peers, &request.failed_votes)
            }
            None => return,
        };
        if infeasible {
            let request = self.sync_requests.remove(&tag).unwrap();
            pf_debug!(self.me; "quorum sync {} infeasible", tag);
            self.server
                .reply_requests(vec![(request.from, ProposerReply::NoQuorum)]);
        }
    }

    /// Counts a peer-down against every outstanding sync request (a vote
    /// already received stands).
    pub(super) fn sync_peer_down(&mut self, peer: NodeId) {
        for tag in self.sync_requests.keys().copied().collect::<Vec<_>>() {
            self.fail_sync_vote(tag, peer);
        }
    }

    /// Re-evaluates outstanding sync requests after the effective quorum
    /// changed: some may now be satisfied or infeasible, and peers newly in
    /// the quorum must be probed.
    pub(super) fn reevaluate_sync_requests(&mut self) {
        let tags: Vec<u64> = self.sync_requests.keys().copied().collect();
        let live = self.liveness.live_peers();
        for tag in tags {
            let (satisfied, infeasible, votes) =
                match self.sync_requests.get(&tag) {
                    Some(request) => (
                        self.quorum.have_quorum(&request.votes),
                        !self.quorum.feasible(
                            &self.quorum_peers,
                            &request.failed_votes,
                        ),
                        request.votes.clone(),
                    ),
                    None => continue,
                };
            if satisfied || infeasible {
                let request = self.sync_requests.remove(&tag).unwrap();
                let reply = if satisfied {
                    ProposerReply::SyncOk
                } else {
                    ProposerReply::NoQuorum
                };
                self.server.reply_requests(vec![(request.from, reply)]);
                continue;
            }
            // probe quorum peers this request has not heard from yet
            for peer in self.quorum_peers.clone() {
                if votes.contains(&peer)
                    || (peer != self.me && !live.contains(&peer))
                {
                    continue;
                }
                self.hub.send(
                    peer,
                    make_opaque(OpaqueKind::SyncQuorum, tag),
                    AgentRequest::EnsureTerm {
                        history: self.history.clone(),
                        term: self.term,
                    },
                );
            }
        }
    }
}
