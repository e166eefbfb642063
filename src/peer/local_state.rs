use crate::peer::zxid::Epoch;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Failed to persist peer state: {0}")]
    Io(#[from] std::io::Error),
}

/// Epoch state that must survive a process restart. A peer that forgets
/// either value can accept a stale leader and fork its history.
pub trait PersistentPeerState: Send + 'static {
    /// Highest epoch this peer has promised to join. Stored while
    /// registering with a prospective leader, before the epoch is acked.
    fn accepted_epoch(&self) -> Epoch;

    /// Store must complete (durably, for real implementations) before the
    /// corresponding ACKEPOCH is sent.
    fn store_accepted_epoch(&mut self, epoch: Epoch) -> Result<(), PersistenceError>;

    /// Epoch of the last leader this peer finished syncing with.
    fn current_epoch(&self) -> Epoch;

    /// Store must complete before the NEWLEADER ack is sent.
    fn store_current_epoch(&mut self, epoch: Epoch) -> Result<(), PersistenceError>;
}

/// Non-durable impl for tests and single-process setups.
pub struct InMemoryPeerState {
    accepted: Epoch,
    current: Epoch,
}

impl InMemoryPeerState {
    pub fn new() -> Self {
        InMemoryPeerState {
            accepted: Epoch::ZERO,
            current: Epoch::ZERO,
        }
    }
}

impl PersistentPeerState for InMemoryPeerState {
    fn accepted_epoch(&self) -> Epoch {
        self.accepted
    }

    fn store_accepted_epoch(&mut self, epoch: Epoch) -> Result<(), PersistenceError> {
        self.accepted = epoch;
        Ok(())
    }

    fn current_epoch(&self) -> Epoch {
        self.current
    }

    fn store_current_epoch(&mut self, epoch: Epoch) -> Result<(), PersistenceError> {
        self.current = epoch;
        Ok(())
    }
}
