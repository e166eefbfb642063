use crate::peer::{PeerState, RoleListener, RoleSnapshot, Zxid, ZxidCell};

/// An event observed at the local peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ZabEvent {
    /// A role transition. Consuming this is subtle: intermediate transitions
    /// are not queued, so if several happen between two awaits only the most
    /// recent one is observed.
    Role(ZabRoleEvent),
}

/// The peer's role after a transition. `leader_id` is set while following or
/// observing, and names the peer itself while leading.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ZabRoleEvent {
    pub state: ZabPeerState,
    pub leader_id: Option<u64>,
    pub epoch: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ZabPeerState {
    Looking,
    Leading,
    Following,
    Observing,
}

pub struct ZabEventListener {
    role_listener: RoleListener,
    last_committed: ZxidCell,
}

impl ZabEventListener {
    pub(crate) fn new(role_listener: RoleListener, last_committed: ZxidCell) -> Self {
        ZabEventListener {
            role_listener,
            last_committed,
        }
    }

    /// The role the peer is in right now, without waiting for a transition.
    pub fn current_role(&self) -> ZabRoleEvent {
        ZabRoleEvent::from(self.role_listener.current())
    }

    /// The highest zxid this peer has applied to its commit stream so far.
    pub fn last_committed_zxid(&self) -> Zxid {
        self.last_committed.load()
    }

    /// `next_event()` returns the next event this peer observes, or None once
    /// the peer has exited.
    pub async fn next_event(&mut self) -> Option<ZabEvent> {
        self.role_listener
            .next()
            .await
            .map(|snapshot| ZabEvent::Role(ZabRoleEvent::from(snapshot)))
    }
}

// ------- Conversions --------

impl From<RoleSnapshot> for ZabRoleEvent {
    fn from(snapshot: RoleSnapshot) -> Self {
        ZabRoleEvent {
            state: ZabPeerState::from(snapshot.state),
            leader_id: snapshot.leader_id.map(|id| id.as_u64()),
            epoch: snapshot.epoch.as_u32(),
        }
    }
}

impl From<PeerState> for ZabPeerState {
    fn from(state: PeerState) -> Self {
        match state {
            PeerState::Looking => ZabPeerState::Looking,
            PeerState::Leading => ZabPeerState::Leading,
            PeerState::Following => ZabPeerState::Following,
            PeerState::Observing => ZabPeerState::Observing,
        }
    }
}
