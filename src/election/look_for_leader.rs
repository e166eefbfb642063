use crate::cluster::{ClusterMembership, MajorityQuorumVerifier, ServerId};
use crate::election::messenger::ElectionMessenger;
use crate::election::tally::{LookingTally, SettledTally};
use crate::election::vote::{Ballot, Vote};
use crate::peer::{Epoch, PeerState, ShutdownSignal, Zxid};
use std::cmp;
use tokio::time::{timeout, Duration, Instant};

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Grace period after reaching quorum, letting a better late ballot
    /// upset the outcome before it is committed to.
    pub finalize_wait: Duration,
    /// Cap for the re-broadcast interval, which starts at `finalize_wait`
    /// and doubles while no ballots arrive.
    pub max_notification_interval: Duration,
}

#[derive(Debug)]
pub enum ElectionOutcome {
    Elected { leader: ServerId },
    Shutdown,
}

enum FinalizeResult {
    Decided,
    Upset(Ballot),
    Shutdown,
}

/// One pass of leader election, run while the peer is LOOKING. Broadcasts
/// our vote, absorbs everyone else's, and returns once a quorum agrees on a
/// leader (or a settled ensemble is discovered to join).
pub struct LookForLeader<'a> {
    pub logger: slog::Logger,
    pub membership: &'a ClusterMembership,
    pub verifier: &'a MajorityQuorumVerifier,
    pub config: &'a ElectionConfig,
    pub messenger: &'a mut ElectionMessenger,
    pub shutdown: &'a mut ShutdownSignal,
}

impl<'a> LookForLeader<'a> {
    /// `round` is the peer's election logical clock; it survives between
    /// elections and only moves forward.
    pub async fn run(mut self, my_last_zxid: Zxid, my_epoch: Epoch, round: &mut u64) -> ElectionOutcome {
        *round += 1;
        let my_id = self.membership.my_id();
        let mut my_vote = if self.membership.i_am_participant() {
            Vote::for_self(my_id, my_last_zxid, my_epoch)
        } else {
            Vote::unelectable()
        };

        let mut looking = LookingTally::new();
        let mut settled = SettledTally::new();

        looking.record(my_id, my_vote);
        self.broadcast(my_vote, *round);
        slog::info!(
            self.logger,
            "Looking for a leader in round {}, voting for {:?}.",
            *round,
            my_vote
        );

        let mut interval = self.config.finalize_wait;
        loop {
            if self.membership.is_participant(my_vote.leader) && looking.has_quorum_for(&my_vote, self.verifier) {
                match self.drain_for_upset(&my_vote, *round).await {
                    FinalizeResult::Decided => {
                        slog::info!(self.logger, "Round {} elected {:?}.", *round, my_vote);
                        return ElectionOutcome::Elected { leader: my_vote.leader };
                    }
                    FinalizeResult::Upset(ballot) => {
                        if let Some(outcome) =
                            self.absorb(ballot, &mut my_vote, round, &mut looking, &mut settled)
                        {
                            return outcome;
                        }
                        continue;
                    }
                    FinalizeResult::Shutdown => return ElectionOutcome::Shutdown,
                }
            }

            let received = tokio::select! {
                _ = self.shutdown.wait() => return ElectionOutcome::Shutdown,
                received = timeout(interval, self.messenger.recv()) => received,
            };
            match received {
                Ok(Some(ballot)) => {
                    if let Some(outcome) = self.absorb(ballot, &mut my_vote, round, &mut looking, &mut settled) {
                        return outcome;
                    }
                }
                Ok(None) => return ElectionOutcome::Shutdown,
                Err(_) => {
                    // Silence; remind everyone of our vote and widen the window.
                    self.broadcast(my_vote, *round);
                    interval = cmp::min(interval * 2, self.config.max_notification_interval);
                }
            }
        }
    }

    /// Applies one ballot to the election state. Returns an outcome only
    /// when a settled ensemble was confirmed.
    fn absorb(
        &mut self,
        ballot: Ballot,
        my_vote: &mut Vote,
        round: &mut u64,
        looking: &mut LookingTally,
        settled: &mut SettledTally,
    ) -> Option<ElectionOutcome> {
        if !self.membership.contains(ballot.from) {
            slog::warn!(self.logger, "Ignoring ballot from unknown server {}.", ballot.from);
            return None;
        }

        match ballot.sender_state {
            PeerState::Looking => {
                if !self.membership.is_participant(ballot.vote.leader) {
                    slog::warn!(
                        self.logger,
                        "Ignoring ballot proposing non-participant {} as leader.",
                        ballot.vote.leader
                    );
                    return None;
                }
                if ballot.round < *round {
                    slog::debug!(self.logger, "Ignoring stale round {} ballot.", ballot.round);
                    return None;
                }
                if ballot.round > *round {
                    slog::debug!(self.logger, "Joining newer election round {}.", ballot.round);
                    *round = ballot.round;
                    looking.clear();
                    if ballot.vote.supersedes(my_vote) {
                        *my_vote = ballot.vote;
                    }
                    looking.record(self.membership.my_id(), *my_vote);
                    self.broadcast(*my_vote, *round);
                } else if ballot.vote.supersedes(my_vote) {
                    *my_vote = ballot.vote;
                    looking.record(self.membership.my_id(), *my_vote);
                    self.broadcast(*my_vote, *round);
                }
                looking.record(ballot.from, ballot.vote);
                None
            }
            PeerState::Leading | PeerState::Following | PeerState::Observing => {
                settled.record(ballot.from, ballot.vote, ballot.sender_state);
                if settled.confirms(ballot.vote.leader, self.verifier) {
                    slog::info!(
                        self.logger,
                        "Joining settled ensemble led by {}.",
                        ballot.vote.leader
                    );
                    return Some(ElectionOutcome::Elected {
                        leader: ballot.vote.leader,
                    });
                }
                None
            }
        }
    }

    /// We have a quorum for `my_vote`. Drain ballots for a short window; any
    /// ballot that could change the outcome aborts finalization.
    async fn drain_for_upset(&mut self, my_vote: &Vote, round: u64) -> FinalizeResult {
        let deadline = Instant::now() + self.config.finalize_wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return FinalizeResult::Decided;
            }
            let received = tokio::select! {
                _ = self.shutdown.wait() => return FinalizeResult::Shutdown,
                received = timeout(remaining, self.messenger.recv()) => received,
            };
            match received {
                Ok(Some(ballot)) => {
                    if self.is_upset(&ballot, my_vote, round) {
                        return FinalizeResult::Upset(ballot);
                    }
                    // A same-round supporter; nothing to re-evaluate.
                }
                Ok(None) => return FinalizeResult::Shutdown,
                Err(_) => return FinalizeResult::Decided,
            }
        }
    }

    fn is_upset(&self, ballot: &Ballot, my_vote: &Vote, round: u64) -> bool {
        match ballot.sender_state {
            PeerState::Looking => {
                ballot.round > round || (ballot.round == round && ballot.vote.supersedes(my_vote))
            }
            // A settled ensemble exists; always worth re-evaluating.
            _ => true,
        }
    }

    fn broadcast(&self, vote: Vote, round: u64) {
        self.messenger.broadcast(Ballot {
            vote,
            from: self.membership.my_id(),
            round,
            sender_state: PeerState::Looking,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{QuorumServer, ServerRole};
    use crate::peer::shutdown_channel;
    use tokio::net::TcpListener;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn members(port_base: u16) -> Vec<QuorumServer> {
        (1..=3)
            .map(|id| QuorumServer {
                id: ServerId::new(id),
                role: ServerRole::Participant,
                ip_addr: "127.0.0.1".parse().unwrap(),
                quorum_port: port_base + 100 + id as u16,
                election_port: port_base + id as u16,
            })
            .collect()
    }

    fn zxid(epoch: u32, counter: u32) -> Zxid {
        Zxid::new(Epoch::new(epoch), counter)
    }

    /// One full election pass for one peer, with its own messenger.
    async fn elect(my_id: u64, members: Vec<QuorumServer>, listener: TcpListener, last_zxid: Zxid) -> ElectionOutcome {
        let logger = test_logger();
        let membership = ClusterMembership::new(ServerId::new(my_id), members).unwrap();
        let verifier = MajorityQuorumVerifier::new(membership.participant_ids());
        let config = ElectionConfig {
            finalize_wait: Duration::from_millis(100),
            max_notification_interval: Duration::from_secs(5),
        };
        let (_shutdown_handle, signal) = shutdown_channel();
        let mut messenger = ElectionMessenger::start(logger.clone(), &membership, listener, signal.clone());
        let mut shutdown = signal;
        let mut round = 0;
        LookForLeader {
            logger,
            membership: &membership,
            verifier: &verifier,
            config: &config,
            messenger: &mut messenger,
            shutdown: &mut shutdown,
        }
        .run(last_zxid, Epoch::new(1), &mut round)
        .await
    }

    fn elected(outcome: ElectionOutcome) -> ServerId {
        match outcome {
            ElectionOutcome::Elected { leader } => leader,
            ElectionOutcome::Shutdown => panic!("Election shut down unexpectedly"),
        }
    }

    #[tokio::test]
    async fn peer_with_the_longest_history_wins() {
        let members = members(24870);
        let l1 = TcpListener::bind("127.0.0.1:24871").await.unwrap();
        let l2 = TcpListener::bind("127.0.0.1:24872").await.unwrap();
        let l3 = TcpListener::bind("127.0.0.1:24873").await.unwrap();

        let (a, b, c) = timeout(Duration::from_secs(10), async {
            tokio::join!(
                elect(1, members.clone(), l1, zxid(1, 3)),
                elect(2, members.clone(), l2, zxid(1, 9)),
                elect(3, members, l3, zxid(1, 5)),
            )
        })
        .await
        .unwrap();

        assert_eq!(elected(a), ServerId::new(2));
        assert_eq!(elected(b), ServerId::new(2));
        assert_eq!(elected(c), ServerId::new(2));
    }

    #[tokio::test]
    async fn server_id_settles_an_exact_tie() {
        let members = members(24874);
        let l1 = TcpListener::bind("127.0.0.1:24875").await.unwrap();
        let l2 = TcpListener::bind("127.0.0.1:24876").await.unwrap();
        let l3 = TcpListener::bind("127.0.0.1:24877").await.unwrap();

        let (a, b, c) = timeout(Duration::from_secs(10), async {
            tokio::join!(
                elect(1, members.clone(), l1, zxid(1, 4)),
                elect(2, members.clone(), l2, zxid(1, 4)),
                elect(3, members, l3, zxid(1, 4)),
            )
        })
        .await
        .unwrap();

        assert_eq!(elected(a), ServerId::new(3));
        assert_eq!(elected(b), ServerId::new(3));
        assert_eq!(elected(c), ServerId::new(3));
    }
}
