//! Runtime -- ordered wait-queue of clients blocked until a revision has
//! been applied. Waiters are keyed by `(seqno, tag)` so satisfying them on
//! apply is a prefix scan.

use std::collections::BTreeMap;

use super::RsmError;
use crate::types::{HistoryId, Seqno};

use tokio::sync::oneshot;

/// One blocked sync-revision client.
#[derive(Debug)]
pub(super) struct RevisionWaiter {
    /// History the caller's revision refers to.
    pub history: HistoryId,

    /// Reply slot.
    pub resp: oneshot::Sender<Result<(), RsmError>>,
}

/// Ordered set of blocked sync-revision clients.
#[derive(Debug, Default)]
pub(super) struct SyncRevisionQueue {
    waiters: BTreeMap<(Seqno, u64), RevisionWaiter>,
}

impl SyncRevisionQueue {
    pub fn new() -> Self {
        SyncRevisionQueue {
            waiters: BTreeMap::new(),
        }
    }

    /// Enqueues a waiter for the given seqno under a unique tag.
    pub fn insert(
        &mut self,
        seqno: Seqno,
        tag: u64,
        history: HistoryId,
        resp: oneshot::Sender<Result<(), RsmError>>,
    ) {
        self.waiters
            .insert((seqno, tag), RevisionWaiter { history, resp });
    }

    /// Removes one waiter (timeout path). `None` if it was already
    /// satisfied; timer expiry is idempotent.
    pub fn remove(
        &mut self,
        seqno: Seqno,
        tag: u64,
    ) -> Option<RevisionWaiter> {
        self.waiters.remove(&(seqno, tag))
    }

    /// Pops every waiter whose seqno is at or below the applied seqno, in
    /// seqno order.
    pub fn pop_ready(&mut self, applied: Seqno) -> Vec<RevisionWaiter> {
        let mut ready = Vec::new();
        while let Some((&(seqno, tag), _)) = self.waiters.first_key_value() {
            if seqno > applied {
                break;
            }
            ready.push(self.waiters.remove(&(seqno, tag)).unwrap());
        }
        ready
    }

    /// Drains every waiter whose history differs from the newly adopted
    /// one (branch crossed beneath the caller).
    pub fn drain_mismatched(
        &mut self,
        history: &HistoryId,
    ) -> Vec<RevisionWaiter> {
        let stale: Vec<(Seqno, u64)> = self
            .waiters
            .iter()
            .filter(|(_, waiter)| waiter.history != *history)
            .map(|(&key, _)| key)
            .collect();
        stale
            .into_iter()
            .map(|key| self.waiters.remove(&key).unwrap())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod syncrev_tests {
    use super::*;

    fn waiter(
        queue: &mut SyncRevisionQueue,
        seqno: Seqno,
        tag: u64,
        history: &str,
    ) -> oneshot::Receiver<Result<(), RsmError>> {
        let (resp, rx) = oneshot::channel();
        queue.insert(seqno, tag, history.into(), resp);
        rx
    }

    #[test]
    fn pop_ready_is_prefix() {
        let mut queue = SyncRevisionQueue::new();
        let _rx9 = waiter(&mut queue, 9, 0, "h0");
        let _rx5 = waiter(&mut queue, 5, 1, "h0");
        let _rx7 = waiter(&mut queue, 7, 2, "h0");

        let ready = queue.pop_ready(7);
        assert_eq!(ready.len(), 2);
        assert_eq!(queue.len(), 1);
        // the remaining waiter is the one above the applied seqno
        assert!(queue.remove(9, 0).is_some());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut queue = SyncRevisionQueue::new();
        let _rx = waiter(&mut queue, 3, 7, "h0");
        assert!(queue.remove(3, 7).is_some());
        assert!(queue.remove(3, 7).is_none());
    }

    #[test]
    fn drain_mismatched_histories() {
        let mut queue = SyncRevisionQueue::new();
        let _rx0 = waiter(&mut queue, 4, 0, "h0");
        let _rx1 = waiter(&mut queue, 6, 1, "h1");
        let drained = queue.drain_mismatched(&"h1".into());
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].history, "h0");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn same_seqno_distinct_tags() {
        let mut queue = SyncRevisionQueue::new();
        let _rx0 = waiter(&mut queue, 4, 0, "h0");
        let _rx1 = waiter(&mut queue, 4, 1, "h0");
        assert_eq!(queue.pop_ready(4).len(), 2);
    }
}
