use crate::cluster::{MajorityQuorumVerifier, QuorumVerifier, ServerId};
use crate::election::vote::Vote;
use crate::peer::PeerState;
use std::collections::{HashMap, HashSet};

/// Latest vote per peer within the current election round. Only ballots from
/// LOOKING senders land here; the round driver clears it whenever the round
/// moves.
pub struct LookingTally {
    votes: HashMap<ServerId, Vote>,
}

impl LookingTally {
    pub fn new() -> Self {
        LookingTally { votes: HashMap::new() }
    }

    pub fn record(&mut self, from: ServerId, vote: Vote) {
        self.votes.insert(from, vote);
    }

    pub fn clear(&mut self) {
        self.votes.clear();
    }

    pub fn supporters_of(&self, vote: &Vote) -> HashSet<ServerId> {
        self.votes
            .iter()
            .filter(|(_, recorded)| *recorded == vote)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn has_quorum_for(&self, vote: &Vote, verifier: &MajorityQuorumVerifier) -> bool {
        verifier.contains_quorum(&self.supporters_of(vote))
    }
}

/// Reports from peers that are already LEADING or FOLLOWING. Lets a late
/// starter join an ensemble that settled without it.
pub struct SettledTally {
    /// Leader each settled sender reports following.
    reported_leader: HashMap<ServerId, ServerId>,
    /// Senders heard claiming leadership themselves.
    leading_claims: HashSet<ServerId>,
}

impl SettledTally {
    pub fn new() -> Self {
        SettledTally {
            reported_leader: HashMap::new(),
            leading_claims: HashSet::new(),
        }
    }

    pub fn record(&mut self, from: ServerId, vote: Vote, sender_state: PeerState) {
        if sender_state == PeerState::Leading {
            self.leading_claims.insert(from);
        }
        self.reported_leader.insert(from, vote.leader);
    }

    /// A settled leader is adoptable once a quorum reports following it and
    /// the leader itself has been heard claiming leadership. Without the
    /// claim, a quorum of stale followers could point at a dead leader.
    pub fn confirms(&self, leader: ServerId, verifier: &MajorityQuorumVerifier) -> bool {
        if !self.leading_claims.contains(&leader) {
            return false;
        }
        let supporters: HashSet<ServerId> = self
            .reported_leader
            .iter()
            .filter(|(_, reported)| **reported == leader)
            .map(|(id, _)| *id)
            .collect();
        verifier.contains_quorum(&supporters)
    }
}
