//! Proposer -- configuration changes: compare-and-swap config requests,
//! joint transitions, and quorum-failover branch resolution.

use super::*;

use crate::types::{ConfigValue, EntryValue};

impl Proposer {
    /// Handler of a compare-and-swap config request. While the active
    /// config is not yet committed, requests are postponed and re-delivered
    /// in arrival order once it commits, so clients observe deterministic
    /// conflicts.
    pub(super) fn handle_cas_config(
        &mut self,
        expected: Revision,
        new_config: Config,
        from: ReplyTo,
    ) {
        if self.member_config.is_transition()
            || self.member_config.revision.seqno > self.committed_seqno
        {
            pf_debug!(self.me; "postponing config change (active config uncommitted)");
            self.postponed_configs.push_back((expected, new_config, from));
            return;
        }

        if expected != self.member_config.revision {
            pf_debug!(self.me; "cas config failed at revision seqno {}",
                               self.member_config.revision.seqno);
            self.server.reply_requests(vec![(
                from,
                ProposerReply::CasFailed(self.member_config.revision.clone()),
            )]);
            return;
        }

        let current = self.member_config.current().clone();
        pf_info!(self.me; "starting config transition at seqno {}",
                          self.pending_high_seqno + 1);
        let revision = self.propose_entry(EntryValue::Transition {
            current: current.clone(),
            future: new_config.clone(),
        });
        self.config_change_from = Some(from);
        self.member_config = MemberConfig {
            value: ConfigValue::Transition {
                current,
                future: new_config,
            },
            revision,
        };
        self.config_changed();
    }

    /// If the active config is a joint transition whose entry has
    /// committed, propose its future config as a stable entry (preserving
    /// the originating client).
    pub(super) fn maybe_complete_transition(&mut self) {
        if self.member_config.revision.seqno > self.committed_seqno {
            return;
        }
        if let ConfigValue::Transition { future, .. } =
            &self.member_config.value
        {
            let future = future.clone();
            pf_info!(self.me; "transition committed, proposing stable config");
            self.propose_config(future);
        }
    }

    /// If the active config is stable and committed, acknowledge the
    /// originating config-change client and replay postponed requests.
    pub(super) fn maybe_finish_config_change(&mut self) {
        if self.member_config.is_transition()
            || self.member_config.revision.seqno > self.committed_seqno
        {
            return;
        }

        if let Some(from) = self.config_change_from.take() {
            self.server.reply_requests(vec![(
                from,
                ProposerReply::ConfigOk(self.member_config.revision.clone()),
            )]);
        }

        // re-deliver postponed requests in arrival order; a request that
        // starts a new transition sends the rest back to the queue
        for (expected, config, from) in
            std::mem::take(&mut self.postponed_configs)
        {
            self.handle_cas_config(expected, config, from);
        }
    }

    /// Resolves a pending quorum-failover branch on becoming leader:
    /// truncate everything above the committed seqno and force-propose the
    /// current config restricted to the surviving peers. The unanimity
    /// required at branch creation guarantees the truncated entries were
    /// never committed.
    pub(super) fn resolve_branch(&mut self) {
        let branch = match &self.branch {
            Some(branch) => branch.clone(),
            None => return,
        };
        debug_assert_eq!(branch.history, self.history);
        pf_info!(self.me; "resolving branch onto peers {:?} at committed {}",
                          branch.peers, self.committed_seqno);

        self.high_seqno = self.committed_seqno;
        self.pending_high_seqno = self.committed_seqno;
        self.pending.clear();
        // promise-time bookkeeping may reference the discarded tail
        self.statuses.clamp_to(self.committed_seqno);

        let mut forced = self.member_config.current().clone();
        forced.voters = branch.peers.clone();
        self.propose_config(forced);
    }

    /// Once the forced config of a branch commits, drop the branch and let
    /// the config's own quorum take over.
    pub(super) fn maybe_clear_branch(&mut self) {
        let resolved = match &self.branch {
            Some(branch) => {
                !self.member_config.is_transition()
                    && self.member_config.revision.history == branch.history
                    && self.member_config.revision.seqno
                        <= self.committed_seqno
            }
            None => false,
        };
        if resolved {
            pf_info!(self.me; "branch resolved");
            self.branch = None;
            self.config_changed();
        }
    }

    /// Proposes a stable config entry and adopts it as the active config.
    /// Used by transition completion and branch resolution; the normal
    /// "prior config must be committed" precondition is the caller's
    /// concern.
    pub(super) fn propose_config(&mut self, config: Config) {
        let revision =
            self.propose_entry(EntryValue::Config(config.clone()));
        self.member_config = MemberConfig {
            value: ConfigValue::Stable(config),
            revision,
        };
        self.config_changed();
    }

    /// Common follow-up after the effective config (or branch state)
    /// changed: recompute the quorum, probe peers that joined it, and
    /// re-evaluate outstanding sync requests against the new quorum.
    fn config_changed(&mut self) {
        self.refresh_quorum();
        self.probe_missing_peers();
        self.reevaluate_sync_requests();
    }
}
