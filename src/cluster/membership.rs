use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Stable numeric id of a server in the ensemble. Ids double as the final
/// tie-breaker in leader election, so they must be unique.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ServerId(u64);

impl ServerId {
    pub fn new(id: u64) -> Self {
        ServerId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerId({})", self.0)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a server takes part in replication. Participants vote and ack,
/// observers only learn committed transactions.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ServerRole {
    Participant,
    Observer,
}

/// Static description of one server: identity plus where to reach it.
#[derive(Debug, Clone)]
pub struct QuorumServer {
    pub id: ServerId,
    pub role: ServerRole,
    pub ip_addr: Ipv4Addr,
    pub quorum_port: u16,
    pub election_port: u16,
}

impl QuorumServer {
    pub fn quorum_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip_addr, self.quorum_port))
    }

    pub fn election_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip_addr, self.election_port))
    }

    pub fn is_participant(&self) -> bool {
        self.role == ServerRole::Participant
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("Duplicate server id {0} in cluster config")]
    DuplicateServerId(u64),
    #[error("Local server id {0} is not listed in the cluster config")]
    LocalServerNotListed(u64),
    #[error("Cluster config has no participants")]
    NoParticipants,
}

/// Validated view of the whole ensemble, keyed by server id. Membership is
/// fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct ClusterMembership {
    my_id: ServerId,
    servers: HashMap<ServerId, QuorumServer>,
}

impl ClusterMembership {
    pub fn new(my_id: ServerId, servers: Vec<QuorumServer>) -> Result<Self, MembershipError> {
        let mut by_id = HashMap::with_capacity(servers.len());
        for server in servers {
            let id = server.id;
            if by_id.insert(id, server).is_some() {
                return Err(MembershipError::DuplicateServerId(id.as_u64()));
            }
        }
        if !by_id.contains_key(&my_id) {
            return Err(MembershipError::LocalServerNotListed(my_id.as_u64()));
        }
        if !by_id.values().any(|s| s.is_participant()) {
            return Err(MembershipError::NoParticipants);
        }

        Ok(ClusterMembership { my_id, servers: by_id })
    }

    pub fn my_id(&self) -> ServerId {
        self.my_id
    }

    pub fn me(&self) -> &QuorumServer {
        // Validated at construction.
        &self.servers[&self.my_id]
    }

    pub fn i_am_participant(&self) -> bool {
        self.me().is_participant()
    }

    pub fn get(&self, id: ServerId) -> Option<&QuorumServer> {
        self.servers.get(&id)
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.servers.contains_key(&id)
    }

    pub fn is_participant(&self, id: ServerId) -> bool {
        self.servers.get(&id).map(|s| s.is_participant()).unwrap_or(false)
    }

    /// All servers other than this one.
    pub fn peers(&self) -> impl Iterator<Item = &QuorumServer> {
        let my_id = self.my_id;
        self.servers.values().filter(move |s| s.id != my_id)
    }

    pub fn participant_ids(&self) -> HashSet<ServerId> {
        self.servers
            .values()
            .filter(|s| s.is_participant())
            .map(|s| s.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: u64, role: ServerRole) -> QuorumServer {
        QuorumServer {
            id: ServerId::new(id),
            role,
            ip_addr: Ipv4Addr::LOCALHOST,
            quorum_port: 2888,
            election_port: 3888,
        }
    }

    #[test]
    fn valid_membership() {
        let membership = ClusterMembership::new(
            ServerId::new(1),
            vec![
                server(1, ServerRole::Participant),
                server(2, ServerRole::Participant),
                server(3, ServerRole::Observer),
            ],
        )
        .unwrap();

        assert_eq!(membership.my_id(), ServerId::new(1));
        assert!(membership.i_am_participant());
        assert_eq!(membership.peers().count(), 2);
        assert_eq!(membership.participant_ids().len(), 2);
        assert!(!membership.is_participant(ServerId::new(3)));
        assert!(!membership.is_participant(ServerId::new(99)));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let result = ClusterMembership::new(
            ServerId::new(1),
            vec![server(1, ServerRole::Participant), server(1, ServerRole::Participant)],
        );
        assert!(matches!(result, Err(MembershipError::DuplicateServerId(1))));
    }

    #[test]
    fn rejects_unlisted_local_id() {
        let result = ClusterMembership::new(ServerId::new(9), vec![server(1, ServerRole::Participant)]);
        assert!(matches!(result, Err(MembershipError::LocalServerNotListed(9))));
    }

    #[test]
    fn rejects_observer_only_cluster() {
        let result = ClusterMembership::new(ServerId::new(1), vec![server(1, ServerRole::Observer)]);
        assert!(matches!(result, Err(MembershipError::NoParticipants)));
    }
}
