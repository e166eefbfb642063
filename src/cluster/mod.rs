mod membership;
mod verifier;

pub use membership::ClusterMembership;
pub use membership::QuorumServer;
pub use membership::ServerId;
pub use membership::ServerRole;
pub use verifier::MajorityQuorumVerifier;
pub use verifier::QuorumVerifier;
