use crate::cluster::membership::ServerId;
use std::collections::HashSet;

/// Decides whether a set of servers is sufficient to commit a proposal or to
/// elect a leader. Implementations must ignore servers that are not voting
/// participants.
pub trait QuorumVerifier: Send + Sync {
    fn contains_quorum(&self, ack_set: &HashSet<ServerId>) -> bool;
}

/// Strict majority over the fixed participant set. Observers never count.
#[derive(Debug, Clone)]
pub struct MajorityQuorumVerifier {
    participants: HashSet<ServerId>,
}

impl MajorityQuorumVerifier {
    pub fn new(participants: HashSet<ServerId>) -> Self {
        MajorityQuorumVerifier { participants }
    }

    pub fn num_participants(&self) -> usize {
        self.participants.len()
    }

    /// Smallest ack set size that forms a quorum.
    pub fn required(&self) -> usize {
        self.participants.len() / 2 + 1
    }
}

impl QuorumVerifier for MajorityQuorumVerifier {
    fn contains_quorum(&self, ack_set: &HashSet<ServerId>) -> bool {
        let votes = ack_set.iter().filter(|id| self.participants.contains(id)).count();
        votes > self.participants.len() / 2
    }
}
