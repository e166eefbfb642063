use crate::api::{CommitStreamPublisher, ZabCommitEvent, ZabCommittedTxn};
use crate::peer::{Zxid, ZxidCell};
use crate::pipeline::request::{TxnEnvelope, WriteError};
use bytes::Bytes;
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};

/// A locally submitted write waiting for its commit. Queued by the active
/// role right before it proposes (leader) or forwards (learner) the request,
/// so queue order always equals proposal order.
pub struct PendingWrite {
    pub session_id: u64,
    pub cxid: u32,
    pub done: oneshot::Sender<Result<Zxid, WriteError>>,
}

/// Ordered commit feed from whichever role is currently active.
pub enum CommitInput {
    Txn(TxnEnvelope),

    /// State was replaced wholesale during catch-up. Anything in flight
    /// before this point has an unknowable outcome.
    Snapshot { last_zxid: Zxid, data: Bytes },

    /// The active role fell (lost leadership or lost its leader). In-flight
    /// local writes must fail rather than hang.
    Reset,
}

/// A committed transaction that is neither a duplicate nor the direct
/// successor of the last applied one. Applying it would fork this peer from
/// the ensemble's history, so the matcher refuses and stops instead.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CommitOrderViolation {
    pub last_delivered: Zxid,
    pub offered: Zxid,
}

/// Final stage of the request pipeline. Applies the committed stream to the
/// application (via the commit stream) and matches each commit against the
/// head of the local pending-write queue so submitters learn their fate.
///
/// Only the head is ever matched: commits arrive in proposal order, and local
/// writes are queued in proposal order, so a commit for a local write is
/// always for the oldest one still pending.
pub struct CommitMatcher {
    logger: slog::Logger,
    publisher: CommitStreamPublisher,
    last_committed: ZxidCell,
    pending: VecDeque<PendingWrite>,
    last_delivered: Zxid,
}

impl CommitMatcher {
    pub fn new(logger: slog::Logger, publisher: CommitStreamPublisher, last_committed: ZxidCell) -> Self {
        CommitMatcher {
            logger,
            publisher,
            last_committed,
            pending: VecDeque::new(),
            last_delivered: Zxid::ZERO,
        }
    }

    pub async fn run(
        mut self,
        mut local_rx: mpsc::UnboundedReceiver<PendingWrite>,
        mut committed_rx: mpsc::UnboundedReceiver<CommitInput>,
    ) {
        loop {
            // Local writes are queued before their request is proposed or
            // forwarded, so when both channels are ready the local queue must
            // drain first for a write to be pending when its commit lands.
            tokio::select! {
                biased;
                local = local_rx.recv() => match local {
                    Some(pending) => self.handle_local(pending),
                    None => break,
                },
                committed = committed_rx.recv() => match committed {
                    Some(input) => {
                        if let Err(violation) = self.handle_commit(input) {
                            slog::error!(
                                self.logger,
                                "Stopping the commit feed: {} does not follow {}.",
                                violation.offered,
                                violation.last_delivered
                            );
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        self.fail_all_pending(WriteError::PeerShutdown);
        slog::debug!(self.logger, "Commit matcher exited.");
    }

    pub fn handle_local(&mut self, pending: PendingWrite) {
        self.pending.push_back(pending);
    }

    pub fn handle_commit(&mut self, input: CommitInput) -> Result<(), CommitOrderViolation> {
        match input {
            CommitInput::Txn(txn) => self.deliver_txn(txn),
            CommitInput::Snapshot { last_zxid, data } => {
                self.fail_all_pending(WriteError::ConnectionLoss);
                self.last_delivered = last_zxid;
                self.last_committed.store(last_zxid);
                self.publisher
                    .notify(&self.logger, ZabCommitEvent::SnapshotInstalled { last_zxid, data });
                Ok(())
            }
            CommitInput::Reset => {
                self.fail_all_pending(WriteError::ConnectionLoss);
                Ok(())
            }
        }
    }

    fn deliver_txn(&mut self, txn: TxnEnvelope) -> Result<(), CommitOrderViolation> {
        if txn.zxid <= self.last_delivered {
            slog::error!(
                self.logger,
                "Dropping non-monotonic commit {} (already delivered up to {}).",
                txn.zxid,
                self.last_delivered
            );
            return Ok(());
        }
        if self.last_delivered != Zxid::ZERO && !txn.zxid.is_successor_of(self.last_delivered) {
            return Err(CommitOrderViolation {
                last_delivered: self.last_delivered,
                offered: txn.zxid,
            });
        }

        // Advance the cursor before resolving the submitter, so a resolved
        // write is always covered by `last_committed`.
        self.last_delivered = txn.zxid;
        self.last_committed.store(txn.zxid);

        if let Some(head) = self.pending.front() {
            if head.session_id == txn.session_id && head.cxid == txn.cxid {
                // Matched our oldest in-flight write.
                let write = self.pending.pop_front().unwrap();
                if write.done.send(Ok(txn.zxid)).is_err() {
                    slog::debug!(self.logger, "Submitter of {} went away before commit.", txn.zxid);
                }
            }
        }
        self.publisher.notify(
            &self.logger,
            ZabCommitEvent::Committed(ZabCommittedTxn {
                zxid: txn.zxid,
                session_id: txn.session_id,
                op: txn.op,
                data: txn.payload,
            }),
        );
        Ok(())
    }

    fn fail_all_pending(&mut self, error: WriteError) {
        if !self.pending.is_empty() {
            slog::info!(
                self.logger,
                "Failing {} in-flight local writes: {}",
                self.pending.len(),
                error
            );
        }
        for write in self.pending.drain(..) {
            let _ = write.done.send(Err(error.clone()));
        }
    }
}
