//! Runtime -- the apply loop: a single outstanding reader task pulls
//! committed entries from the local agent, and the runtime applies them in
//! seqno order, settling blocked clients along the way.

use super::*;

use crate::types::{EntryValue, LogEntry};

impl<M: Machine> RsmRuntime<M> {
    /// Starts a reader round if committed entries are waiting and no round
    /// is outstanding.
    pub(super) fn maybe_start_reader(&mut self) {
        if self.reader_busy || self.available_seqno <= self.applied_seqno {
            return;
        }
        self.reader_busy = true;

        let from = self.applied_seqno + 1;
        let to = self
            .available_seqno
            .min(self.applied_seqno + self.config.max_apply_batch as Seqno);
        let agent = self.agent.clone();
        let tx_msg = self.tx_msg.clone();
        pf_trace!(self.whoami(); "reader fetching [{}, {}]", from, to);

        tokio::spawn(async move {
            match agent.get_log(from, to).await {
                Ok(entries) => {
                    let _ = tx_msg.send(RsmMsg::Entries {
                        high_seqno: to,
                        entries,
                    });
                }
                Err(e) => {
                    let _ = tx_msg.send(RsmMsg::ReaderDied(e.0));
                }
            }
        });
    }

    /// Handler of a finished reader round: apply the batch in order, then
    /// settle revision waiters and pending command clients.
    pub(super) fn handle_entries(
        &mut self,
        high_seqno: Seqno,
        entries: Vec<LogEntry>,
    ) -> Result<(), ConclaveError> {
        self.reader_busy = false;

        let mut replies: Vec<(CommandRef, Term, Vec<u8>)> = Vec::new();
        let mut history_changed = false;
        for entry in entries {
            debug_assert!(entry.seqno > self.applied_seqno);
            match &entry.value {
                EntryValue::Command {
                    id,
                    machine,
                    payload,
                } if *machine == self.name => {
                    let reply = self.machine.apply_command(
                        payload,
                        (entry.history.clone(), entry.seqno),
                    );
                    replies.push((*id, entry.term, reply));
                }
                EntryValue::Config(_) => {
                    // configs are the only entries that may open a new
                    // history; the machine module never sees them
                    if entry.history != self.applied_history {
                        pf_info!(self.whoami(); "adopting history '{}'",
                                                entry.history);
                        self.applied_history = entry.history.clone();
                        history_changed = true;
                    }
                }
                // transitions and other machines' commands are invisible
                // to this machine
                EntryValue::Command { .. }
                | EntryValue::Transition { .. } => {}
            }
        }
        self.applied_seqno = high_seqno;

        if history_changed {
            for waiter in self
                .sync_revisions
                .drain_mismatched(&self.applied_history)
            {
                let _ = waiter.resp.send(Err(RsmError::HistoryMismatch));
            }
        }
        for waiter in self.sync_revisions.pop_ready(self.applied_seqno) {
            let _ = waiter.resp.send(Ok(()));
        }

        // deliver command replies, guarding against refs from an earlier
        // leadership of the same runtime
        if let Role::Leader { term, .. } = &self.role {
            let term = *term;
            for (id, entry_term, reply) in replies {
                if entry_term != term {
                    continue;
                }
                if let Some(resp) = self.pending_clients.remove(&id) {
                    let _ = resp.send(Ok(reply));
                }
            }
        }

        self.maybe_start_reader();
        Ok(())
    }
}
