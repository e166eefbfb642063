use crate::pipeline::WriteError;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

/// Replies a learner owes local callers once the leader answers. The leader
/// echoes each request's own key back, so resolution is a lookup; multiple
/// requests under one key resolve oldest first.
pub struct PendingReplies {
    revalidations: HashMap<u64, VecDeque<oneshot::Sender<Result<bool, WriteError>>>>,
    syncs: HashMap<(u64, u32), VecDeque<oneshot::Sender<Result<(), WriteError>>>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        PendingReplies {
            revalidations: HashMap::new(),
            syncs: HashMap::new(),
        }
    }

    pub fn expect_revalidation(&mut self, session_id: u64, done: oneshot::Sender<Result<bool, WriteError>>) {
        self.revalidations.entry(session_id).or_default().push_back(done);
    }

    /// Resolves the oldest waiter for this session. False if nobody was
    /// waiting (a reply we never asked for).
    pub fn resolve_revalidation(&mut self, session_id: u64, valid: bool) -> bool {
        match self.revalidations.get_mut(&session_id).and_then(|queue| queue.pop_front()) {
            Some(done) => {
                let _ = done.send(Ok(valid));
                true
            }
            None => false,
        }
    }

    pub fn expect_sync(&mut self, session_id: u64, cxid: u32, done: oneshot::Sender<Result<(), WriteError>>) {
        self.syncs.entry((session_id, cxid)).or_default().push_back(done);
    }

    pub fn resolve_sync(&mut self, session_id: u64, cxid: u32) -> bool {
        match self.syncs.get_mut(&(session_id, cxid)).and_then(|queue| queue.pop_front()) {
            Some(done) => {
                let _ = done.send(Ok(()));
                true
            }
            None => false,
        }
    }

    /// Fails every waiter; used when the leader link is lost and outcomes
    /// will never arrive.
    pub fn fail_all(&mut self, error: WriteError) {
        for (_, queue) in self.revalidations.drain() {
            for done in queue {
                let _ = done.send(Err(error.clone()));
            }
        }
        for (_, queue) in self.syncs.drain() {
            for done in queue {
                let _ = done.send(Err(error.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiters_under_one_key_resolve_oldest_first() {
        let mut replies = PendingReplies::new();
        let (first_tx, mut first_rx) = oneshot::channel();
        let (second_tx, mut second_rx) = oneshot::channel();
        replies.expect_revalidation(0x70, first_tx);
        replies.expect_revalidation(0x70, second_tx);

        assert!(replies.resolve_revalidation(0x70, true));
        assert_eq!(first_rx.try_recv().unwrap(), Ok(true));
        assert!(second_rx.try_recv().is_err());

        assert!(replies.resolve_revalidation(0x70, false));
        assert_eq!(second_rx.try_recv().unwrap(), Ok(false));
    }

    #[test]
    fn unsolicited_replies_are_reported() {
        let mut replies = PendingReplies::new();
        assert!(!replies.resolve_revalidation(0x70, true));
        assert!(!replies.resolve_sync(0x70, 4));
    }

    #[test]
    fn fail_all_reaches_every_waiter() {
        let mut replies = PendingReplies::new();
        let (reval_tx, mut reval_rx) = oneshot::channel();
        let (sync_tx, mut sync_rx) = oneshot::channel();
        replies.expect_revalidation(0x70, reval_tx);
        replies.expect_sync(0x70, 9, sync_tx);

        replies.fail_all(WriteError::ConnectionLoss);
        assert_eq!(reval_rx.try_recv().unwrap(), Err(WriteError::ConnectionLoss));
        assert_eq!(sync_rx.try_recv().unwrap(), Err(WriteError::ConnectionLoss));
    }
}
