use crate::cluster::ServerId;
use crate::peer::{Epoch, PeerState, Zxid};

/// A peer's claim about who should lead. Votes are totally ordered by
/// (epoch, zxid, leader id): a candidate with more history wins, and ids
/// break exact ties so every election converges.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Vote {
    pub leader: ServerId,
    pub zxid: Zxid,
    pub epoch: Epoch,
}

impl Vote {
    pub fn for_self(my_id: ServerId, last_zxid: Zxid, epoch: Epoch) -> Self {
        Vote {
            leader: my_id,
            zxid: last_zxid,
            epoch,
        }
    }

    /// Starting vote of a peer that must not lead (an observer). Loses to
    /// any participant's vote.
    pub fn unelectable() -> Self {
        Vote {
            leader: ServerId::new(0),
            zxid: Zxid::ZERO,
            epoch: Epoch::ZERO,
        }
    }

    /// True if this vote beats `other` and should replace it.
    pub fn supersedes(&self, other: &Vote) -> bool {
        (self.epoch, self.zxid, self.leader) > (other.epoch, other.zxid, other.leader)
    }
}

/// One election notification as exchanged between peers: the sender's current
/// vote plus enough context to weigh it.
#[derive(Debug, Clone, PartialEq)]
pub struct Ballot {
    pub vote: Vote,
    pub from: ServerId,
    /// Election round of the sender (its logical clock). Only ballots from
    /// the same round are tallied together.
    pub round: u64,
    pub sender_state: PeerState,
}
