use crate::cluster::{ClusterMembership, MajorityQuorumVerifier};
use crate::election::{ElectionConfig, ElectionMessenger, ElectionOutcome, LookForLeader};
use crate::leader::{Leader, LeaderConfig, LeaderExit};
use crate::learner::{Learner, LearnerConfig, LearnerExit};
use crate::peer::local_state::PersistentPeerState;
use crate::peer::shutdown::ShutdownSignal;
use crate::peer::status::{RoleNotifier, RoleSnapshot};
use crate::pipeline::{ClientSubmission, CommitInput, PendingWrite};
use crate::txnlog::TxnLog;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct PeerConfig {
    pub tick_time: Duration,
    pub init_limit_ticks: u32,
    pub sync_limit_ticks: u32,
    pub finalize_wait: Duration,
    pub max_notification_interval: Duration,
}

impl PeerConfig {
    fn election(&self) -> ElectionConfig {
        ElectionConfig {
            finalize_wait: self.finalize_wait,
            max_notification_interval: self.max_notification_interval,
        }
    }

    fn leader(&self) -> LeaderConfig {
        LeaderConfig {
            tick_time: self.tick_time,
            init_limit_ticks: self.init_limit_ticks,
            sync_limit_ticks: self.sync_limit_ticks,
        }
    }

    fn learner(&self) -> LearnerConfig {
        LearnerConfig {
            tick_time: self.tick_time,
            init_limit_ticks: self.init_limit_ticks,
            sync_limit_ticks: self.sync_limit_ticks,
        }
    }
}

/// The peer's role state machine: LOOKING until an election settles, then
/// LEADING or FOLLOWING/OBSERVING until that role falls, then LOOKING again.
///
/// Owns the transaction log and the persisted epochs outright and lends them
/// to whichever role is active, so no synchronization ever guards them.
pub struct QuorumPeer<L: TxnLog, S: PersistentPeerState> {
    logger: slog::Logger,
    config: PeerConfig,
    membership: ClusterMembership,
    verifier: MajorityQuorumVerifier,
    log: L,
    pstate: S,
    notifier: RoleNotifier,
    local_tx: mpsc::UnboundedSender<PendingWrite>,
    committed_tx: mpsc::UnboundedSender<CommitInput>,
}

impl<L: TxnLog, S: PersistentPeerState> QuorumPeer<L, S> {
    pub fn new(
        logger: slog::Logger,
        config: PeerConfig,
        membership: ClusterMembership,
        log: L,
        pstate: S,
        notifier: RoleNotifier,
        local_tx: mpsc::UnboundedSender<PendingWrite>,
        committed_tx: mpsc::UnboundedSender<CommitInput>,
    ) -> Self {
        let verifier = MajorityQuorumVerifier::new(membership.participant_ids());
        QuorumPeer {
            logger,
            config,
            membership,
            verifier,
            log,
            pstate,
            notifier,
            local_tx,
            committed_tx,
        }
    }

    pub async fn run(
        mut self,
        election_listener: TcpListener,
        mut submit_rx: mpsc::Receiver<ClientSubmission>,
        mut shutdown: ShutdownSignal,
    ) {
        let mut messenger = ElectionMessenger::start(
            self.logger.new(slog::o!("subsystem" => "election")),
            &self.membership,
            election_listener,
            shutdown.clone(),
        );
        let mut round: u64 = 0;

        loop {
            if shutdown.is_shutdown() {
                break;
            }
            self.notifier.update(RoleSnapshot::looking(self.pstate.current_epoch()));

            let election_config = self.config.election();
            let election = LookForLeader {
                logger: self.logger.new(slog::o!("role" => "looking")),
                membership: &self.membership,
                verifier: &self.verifier,
                config: &election_config,
                messenger: &mut messenger,
                shutdown: &mut shutdown,
            };
            let leader_id = match election
                .run(self.log.last_logged_zxid(), self.pstate.current_epoch(), &mut round)
                .await
            {
                ElectionOutcome::Elected { leader } => leader,
                ElectionOutcome::Shutdown => break,
            };

            if leader_id == self.membership.my_id() {
                let leader = Leader::new(
                    self.logger.new(slog::o!("role" => "leader")),
                    self.config.leader(),
                    &self.membership,
                    &self.verifier,
                    &mut self.log,
                    &mut self.pstate,
                    &self.notifier,
                    self.local_tx.clone(),
                    self.committed_tx.clone(),
                    round,
                );
                let exit = leader.run(&mut messenger, &mut submit_rx, shutdown.clone()).await;
                let _ = self.committed_tx.send(CommitInput::Reset);
                match exit {
                    LeaderExit::Shutdown => break,
                    LeaderExit::QuorumLost | LeaderExit::StorageFailed | LeaderExit::BindFailed => {
                        slog::warn!(self.logger, "Leadership ended: {:?}; looking again.", exit);
                    }
                }
            } else {
                let learner = Learner::new(
                    self.logger.new(slog::o!("role" => "learner")),
                    self.config.learner(),
                    &self.membership,
                    leader_id,
                    &mut self.log,
                    &mut self.pstate,
                    &self.notifier,
                    self.local_tx.clone(),
                    self.committed_tx.clone(),
                    round,
                );
                let exit = learner.run(&mut messenger, &mut submit_rx, shutdown.clone()).await;
                let _ = self.committed_tx.send(CommitInput::Reset);
                match exit {
                    LearnerExit::Shutdown => break,
                    LearnerExit::ToLooking => {
                        slog::info!(self.logger, "Lost the leader; looking again.");
                    }
                    LearnerExit::Fatal => {
                        slog::error!(self.logger, "Local state is unusable; stopping this peer.");
                        break;
                    }
                }
            }
        }

        // Fail anything still waiting on an outcome.
        let _ = self.committed_tx.send(CommitInput::Reset);
        slog::info!(self.logger, "Peer exited.");
    }
}
