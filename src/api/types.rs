use crate::cluster;
use std::net::Ipv4Addr;

/// Static description of one ensemble member, as supplied by the application.
/// Every peer must be configured with the same member list.
#[derive(Clone)]
pub struct ZabMemberInfo {
    pub server_id: u64,
    pub role: ZabMemberRole,
    pub ip_addr: Ipv4Addr,
    /// Port the leader listens on for learner connections.
    pub quorum_port: u16,
    /// Port this member listens on for election ballots.
    pub election_port: u16,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ZabMemberRole {
    /// Votes in elections and acks proposals. Quorum is counted over
    /// participants only.
    Participant,
    /// Learns committed transactions without affecting quorum.
    Observer,
}

// ------- Conversions --------

impl From<ZabMemberInfo> for cluster::QuorumServer {
    fn from(member_info: ZabMemberInfo) -> Self {
        cluster::QuorumServer {
            id: cluster::ServerId::new(member_info.server_id),
            role: cluster::ServerRole::from(member_info.role),
            ip_addr: member_info.ip_addr,
            quorum_port: member_info.quorum_port,
            election_port: member_info.election_port,
        }
    }
}

impl From<ZabMemberRole> for cluster::ServerRole {
    fn from(role: ZabMemberRole) -> Self {
        match role {
            ZabMemberRole::Participant => cluster::ServerRole::Participant,
            ZabMemberRole::Observer => cluster::ServerRole::Observer,
        }
    }
}
