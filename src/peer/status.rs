use crate::cluster::ServerId;
use crate::peer::zxid::{Epoch, Zxid};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// The role a peer is currently playing in the ensemble.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PeerState {
    /// Searching for a leader to follow (or to become).
    Looking,
    Leading,
    Following,
    Observing,
}

/// Point-in-time view of a peer's role. Published on every role transition
/// and whenever the leader or epoch changes.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleSnapshot {
    pub state: PeerState,
    pub leader_id: Option<ServerId>,
    pub epoch: Epoch,
}

impl RoleSnapshot {
    pub fn looking(epoch: Epoch) -> Self {
        RoleSnapshot {
            state: PeerState::Looking,
            leader_id: None,
            epoch,
        }
    }
}

pub fn role_channel(logger: slog::Logger) -> (RoleNotifier, RoleListener) {
    let (sender, receiver) = watch::channel(RoleSnapshot::looking(Epoch::ZERO));
    (RoleNotifier { sender, logger }, RoleListener { receiver })
}

pub struct RoleNotifier {
    sender: watch::Sender<RoleSnapshot>,
    logger: slog::Logger,
}

impl RoleNotifier {
    pub fn update(&self, snapshot: RoleSnapshot) {
        slog::info!(self.logger, "Role transition: {:?}", snapshot);
        if self.sender.send(snapshot).is_err() {
            slog::debug!(self.logger, "No role listeners are connected.");
        }
    }
}

/// Watch-style listener. If several transitions happen between two calls to
/// `next()`, intermediate snapshots are clobbered and only the most recent
/// one is observed.
#[derive(Clone)]
pub struct RoleListener {
    receiver: watch::Receiver<RoleSnapshot>,
}

impl RoleListener {
    pub fn current(&self) -> RoleSnapshot {
        self.receiver.borrow().clone()
    }

    /// Next role snapshot, or None once the peer has exited.
    pub async fn next(&mut self) -> Option<RoleSnapshot> {
        self.receiver.changed().await.ok()?;
        let snapshot = self.receiver.borrow().clone();
        Some(snapshot)
    }
}

/// Shared cell holding the last committed zxid this peer has applied. Written
/// by the commit pipeline, read by anyone holding a clone.
#[derive(Clone)]
pub struct ZxidCell {
    cell: Arc<AtomicU64>,
}

impl ZxidCell {
    pub fn new() -> Self {
        ZxidCell {
            cell: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn store(&self, zxid: Zxid) {
        self.cell.store(zxid.as_u64(), Ordering::SeqCst);
    }

    pub fn load(&self) -> Zxid {
        Zxid::from_u64(self.cell.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn listener_observes_role_transitions() {
        let (notifier, mut listener) = role_channel(test_logger());
        assert_eq!(listener.current().state, PeerState::Looking);

        notifier.update(RoleSnapshot {
            state: PeerState::Leading,
            leader_id: Some(ServerId::new(1)),
            epoch: Epoch::new(1),
        });

        let snapshot = listener.next().await.unwrap();
        assert_eq!(snapshot.state, PeerState::Leading);
        assert_eq!(snapshot.leader_id, Some(ServerId::new(1)));
    }

    #[tokio::test]
    async fn rapid_transitions_clobber_to_latest() {
        let (notifier, mut listener) = role_channel(test_logger());

        notifier.update(RoleSnapshot {
            state: PeerState::Following,
            leader_id: Some(ServerId::new(2)),
            epoch: Epoch::new(1),
        });
        notifier.update(RoleSnapshot::looking(Epoch::new(1)));

        let snapshot = listener.next().await.unwrap();
        assert_eq!(snapshot.state, PeerState::Looking);
    }

    #[tokio::test]
    async fn listener_ends_when_notifier_drops() {
        let (notifier, mut listener) = role_channel(test_logger());
        drop(notifier);
        assert_eq!(listener.next().await, None);
    }

    #[test]
    fn zxid_cell_roundtrip() {
        let cell = ZxidCell::new();
        assert_eq!(cell.load(), Zxid::ZERO);
        let zxid = Zxid::new(Epoch::new(2), 7);
        cell.store(zxid);
        assert_eq!(cell.load(), zxid);
        assert_eq!(cell.clone().load(), zxid);
    }
}
