use crate::cluster::{ClusterMembership, ServerId, ServerRole};
use crate::election::{Ballot, ElectionMessenger, Vote};
use crate::learner::pending::PendingReplies;
use crate::peer::{Epoch, PeerState, PersistentPeerState, RoleNotifier, RoleSnapshot, ShutdownSignal, Zxid};
use crate::pipeline::{ClientSubmission, CommitInput, PendingWrite, TxnEnvelope, WriteError};
use crate::txnlog::{Snapshot, TxnLog};
use crate::wire::{PacketCodec, PacketType, QuorumPacket};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::codec::Framed;

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);

type LeaderLink = Framed<TcpStream, PacketCodec>;

#[derive(Clone)]
pub struct LearnerConfig {
    pub tick_time: Duration,
    pub init_limit_ticks: u32,
    pub sync_limit_ticks: u32,
}

/// Why the learner stopped following.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LearnerExit {
    /// The leader is gone or rejected us; go elect another one.
    ToLooking,
    /// Local state is unusable; following anyone would fork history.
    Fatal,
    Shutdown,
}

/// What a learner does inside the broadcast protocol, fixed at construction.
/// One session loop serves both member roles; the behavioral differences
/// between a follower and an observer all run through these flags.
#[derive(Copy, Clone)]
struct RoleCaps {
    /// Durably log proposals and ack them, then consume matching commits.
    acks_proposals: bool,
    /// Register as a voting follower whose acks count toward commit quorums.
    counts_for_quorum: bool,
}

impl RoleCaps {
    fn for_role(role: ServerRole) -> RoleCaps {
        match role {
            ServerRole::Participant => RoleCaps { acks_proposals: true, counts_for_quorum: true },
            ServerRole::Observer => RoleCaps { acks_proposals: false, counts_for_quorum: false },
        }
    }
}

/// The following/observing role. Connects to the elected leader, runs the
/// epoch handshake, applies catch-up, then processes the live broadcast:
/// a follower logs and acks proposals and applies commits in order, an
/// observer applies INFORMs. Client submissions are forwarded to the leader.
pub struct Learner<'a, L: TxnLog, S: PersistentPeerState> {
    logger: slog::Logger,
    config: LearnerConfig,
    membership: &'a ClusterMembership,
    leader_id: ServerId,
    role: ServerRole,
    caps: RoleCaps,
    log: &'a mut L,
    pstate: &'a mut S,
    notifier: &'a RoleNotifier,
    local_tx: mpsc::UnboundedSender<PendingWrite>,
    committed_tx: mpsc::UnboundedSender<CommitInput>,
    /// Election round that settled on this leader; echoed when answering
    /// ballots from peers still looking.
    round: u64,

    epoch: Epoch,
    /// Proposals logged and acked, waiting for their commit. Commits must
    /// match the head; anything else means we diverged from the leader.
    pending_commits: VecDeque<TxnEnvelope>,
    replies: PendingReplies,
}

impl<'a, L: TxnLog, S: PersistentPeerState> Learner<'a, L, S> {
    pub fn new(
        logger: slog::Logger,
        config: LearnerConfig,
        membership: &'a ClusterMembership,
        leader_id: ServerId,
        log: &'a mut L,
        pstate: &'a mut S,
        notifier: &'a RoleNotifier,
        local_tx: mpsc::UnboundedSender<PendingWrite>,
        committed_tx: mpsc::UnboundedSender<CommitInput>,
        round: u64,
    ) -> Self {
        let role = membership.me().role;
        Learner {
            logger,
            config,
            membership,
            leader_id,
            role,
            caps: RoleCaps::for_role(role),
            log,
            pstate,
            notifier,
            local_tx,
            committed_tx,
            round,
            epoch: Epoch::ZERO,
            pending_commits: VecDeque::new(),
            replies: PendingReplies::new(),
        }
    }

    pub async fn run(
        mut self,
        messenger: &mut ElectionMessenger,
        submit_rx: &mut mpsc::Receiver<ClientSubmission>,
        mut shutdown: ShutdownSignal,
    ) -> LearnerExit {
        let exit = self.drive(messenger, submit_rx, &mut shutdown).await;
        let error = match exit {
            LearnerExit::Shutdown => WriteError::PeerShutdown,
            _ => WriteError::ConnectionLoss,
        };
        self.replies.fail_all(error);
        exit
    }

    async fn drive(
        &mut self,
        messenger: &mut ElectionMessenger,
        submit_rx: &mut mpsc::Receiver<ClientSubmission>,
        shutdown: &mut ShutdownSignal,
    ) -> LearnerExit {
        let leader = match self.membership.get(self.leader_id) {
            Some(server) => server.clone(),
            None => {
                slog::error!(self.logger, "Elected leader {} is not in the membership.", self.leader_id);
                return LearnerExit::ToLooking;
            }
        };
        slog::info!(self.logger, "Following {} at {}.", self.leader_id, leader.quorum_addr());

        let stream = match self.connect(leader.quorum_addr(), shutdown).await {
            Ok(stream) => stream,
            Err(exit) => return exit,
        };
        let mut framed = Framed::new(stream, PacketCodec::new());

        if let Err(exit) = self.register(&mut framed, shutdown).await {
            return exit;
        }
        if let Err(exit) = self.sync(&mut framed, shutdown).await {
            return exit;
        }

        let state = match self.role {
            ServerRole::Participant => PeerState::Following,
            ServerRole::Observer => PeerState::Observing,
        };
        self.notifier.update(RoleSnapshot {
            state,
            leader_id: Some(self.leader_id),
            epoch: self.epoch,
        });

        self.broadcast_loop(&mut framed, messenger, submit_rx, shutdown).await
    }

    async fn connect(&self, addr: std::net::SocketAddr, shutdown: &mut ShutdownSignal) -> Result<TcpStream, LearnerExit> {
        for attempt in 1..=CONNECT_ATTEMPTS {
            tokio::select! {
                _ = shutdown.wait() => return Err(LearnerExit::Shutdown),
                connected = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)) => match connected {
                    Ok(Ok(stream)) => return Ok(stream),
                    Ok(Err(e)) => {
                        slog::info!(self.logger, "Connect to leader failed (attempt {}): {}", attempt, e);
                    }
                    Err(_) => {
                        slog::info!(self.logger, "Connect to leader timed out (attempt {}).", attempt);
                    }
                },
            }
            tokio::time::sleep(CONNECT_RETRY_DELAY).await;
        }
        slog::warn!(self.logger, "Could not reach leader {}; going back to election.", self.leader_id);
        Err(LearnerExit::ToLooking)
    }

    /// FOLLOWERINFO/OBSERVERINFO out, LEADERINFO in, ACKEPOCH out. The
    /// accepted epoch is persisted before the ack so a restart cannot accept
    /// an older leader.
    async fn register(&mut self, framed: &mut LeaderLink, shutdown: &mut ShutdownSignal) -> Result<(), LearnerExit> {
        let my_id = self.membership.my_id();
        let info = if self.caps.counts_for_quorum {
            QuorumPacket::follower_info(my_id, self.pstate.accepted_epoch(), self.log.last_logged_zxid())
        } else {
            QuorumPacket::observer_info(my_id, self.pstate.accepted_epoch(), self.log.last_logged_zxid())
        };
        if framed.send(info).await.is_err() {
            return Err(LearnerExit::ToLooking);
        }

        let packet = self.next_packet(framed, shutdown).await?;
        if packet.ptype != PacketType::LeaderInfo {
            slog::warn!(self.logger, "Expected LEADERINFO, got {:?}.", packet.ptype);
            return Err(LearnerExit::ToLooking);
        }
        let new_epoch = packet.zxid.epoch();
        if new_epoch < self.pstate.accepted_epoch() {
            slog::warn!(
                self.logger,
                "Leader proposed epoch {} below our accepted {}; abandoning it.",
                new_epoch,
                self.pstate.accepted_epoch()
            );
            return Err(LearnerExit::ToLooking);
        }
        if new_epoch > self.pstate.accepted_epoch() {
            if let Err(e) = self.pstate.store_accepted_epoch(new_epoch) {
                slog::error!(self.logger, "Cannot persist accepted epoch {}: {}", new_epoch, e);
                return Err(LearnerExit::Fatal);
            }
        }
        self.epoch = new_epoch;
        slog::info!(self.logger, "Accepted epoch {} from leader {}.", new_epoch, self.leader_id);

        let ack = QuorumPacket::ack_epoch(self.pstate.current_epoch(), self.log.last_logged_zxid());
        if framed.send(ack).await.is_err() {
            return Err(LearnerExit::ToLooking);
        }
        Ok(())
    }

    /// Applies the leader's catch-up stream until UPTODATE: trunc or snap
    /// first if needed, then proposal/commit pairs (INFORMs for observers),
    /// then NEWLEADER which we ack only after the new epoch is persisted.
    async fn sync(&mut self, framed: &mut LeaderLink, shutdown: &mut ShutdownSignal) -> Result<(), LearnerExit> {
        let mut saw_newleader = false;
        loop {
            let packet = self.next_packet(framed, shutdown).await?;
            match packet.ptype {
                PacketType::Diff => {
                    slog::info!(self.logger, "Catching up via diff to {}.", packet.zxid);
                    self.commit_local_prefix(packet.zxid)?;
                }
                PacketType::Trunc => {
                    let applied = self.log.last_committed_zxid();
                    if let Err(e) = self.log.truncate_after(packet.zxid) {
                        slog::error!(self.logger, "Cannot truncate to {}: {}", packet.zxid, e);
                        return Err(LearnerExit::Fatal);
                    }
                    slog::info!(self.logger, "Truncated local history to {}.", packet.zxid);
                    if packet.zxid < applied {
                        self.rebuild_from_truncated_log(applied)?;
                    } else {
                        self.commit_local_prefix(packet.zxid)?;
                    }
                }
                PacketType::Snap => {
                    let snapshot = Snapshot {
                        last_zxid: packet.zxid,
                        data: packet.data.clone(),
                    };
                    if let Err(e) = self.log.restore(snapshot) {
                        slog::error!(self.logger, "Cannot install snapshot at {}: {}", packet.zxid, e);
                        return Err(LearnerExit::Fatal);
                    }
                    let _ = self.committed_tx.send(CommitInput::Snapshot {
                        last_zxid: packet.zxid,
                        data: packet.data,
                    });
                    slog::info!(self.logger, "Installed a full snapshot at {}.", packet.zxid);
                }
                PacketType::Proposal => self.handle_proposal(framed, &packet).await?,
                PacketType::Commit => self.handle_commit(packet.zxid)?,
                PacketType::Inform => self.handle_inform(&packet)?,
                PacketType::NewLeader => {
                    if packet.zxid.epoch() != self.epoch {
                        slog::warn!(
                            self.logger,
                            "NEWLEADER for epoch {} does not match the accepted {}.",
                            packet.zxid.epoch(),
                            self.epoch
                        );
                        return Err(LearnerExit::ToLooking);
                    }
                    if let Err(e) = self.pstate.store_current_epoch(self.epoch) {
                        slog::error!(self.logger, "Cannot persist current epoch {}: {}", self.epoch, e);
                        return Err(LearnerExit::Fatal);
                    }
                    if framed.send(QuorumPacket::ack(packet.zxid)).await.is_err() {
                        return Err(LearnerExit::ToLooking);
                    }
                    saw_newleader = true;
                }
                PacketType::UpToDate => {
                    if !saw_newleader {
                        slog::warn!(self.logger, "UPTODATE before NEWLEADER; abandoning this leader.");
                        return Err(LearnerExit::ToLooking);
                    }
                    slog::info!(self.logger, "In sync with leader {} at epoch {}.", self.leader_id, self.epoch);
                    return Ok(());
                }
                PacketType::Ping => {
                    if framed.send(QuorumPacket::ping()).await.is_err() {
                        return Err(LearnerExit::ToLooking);
                    }
                }
                other => {
                    slog::warn!(self.logger, "Unexpected {:?} during sync.", other);
                    return Err(LearnerExit::ToLooking);
                }
            }
        }
    }

    async fn broadcast_loop(
        &mut self,
        framed: &mut LeaderLink,
        messenger: &mut ElectionMessenger,
        submit_rx: &mut mpsc::Receiver<ClientSubmission>,
        shutdown: &mut ShutdownSignal,
    ) -> LearnerExit {
        let silence_window = self.config.tick_time * self.config.sync_limit_ticks;
        let mut last_heard = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.wait() => return LearnerExit::Shutdown,
                _ = sleep_until(last_heard + silence_window) => {
                    slog::warn!(self.logger, "Leader {} went silent; going back to election.", self.leader_id);
                    return LearnerExit::ToLooking;
                }
                packet = framed.next() => match packet {
                    Some(Ok(packet)) => {
                        last_heard = Instant::now();
                        if let Err(exit) = self.handle_broadcast_packet(framed, packet).await {
                            return exit;
                        }
                    }
                    Some(Err(e)) => {
                        slog::warn!(self.logger, "Leader link failed: {}", e);
                        return LearnerExit::ToLooking;
                    }
                    None => {
                        slog::info!(self.logger, "Leader {} closed the link.", self.leader_id);
                        return LearnerExit::ToLooking;
                    }
                },
                submission = submit_rx.recv() => match submission {
                    Some(submission) => {
                        if let Err(exit) = self.forward(framed, submission).await {
                            return exit;
                        }
                    }
                    // Client handle dropped; nothing left to serve.
                    None => return LearnerExit::Shutdown,
                },
                ballot = messenger.recv() => {
                    if let Some(ballot) = ballot {
                        self.answer_ballot(ballot, messenger);
                    }
                }
            }
        }
    }

    async fn handle_broadcast_packet(&mut self, framed: &mut LeaderLink, packet: QuorumPacket) -> Result<(), LearnerExit> {
        match packet.ptype {
            PacketType::Ping => {
                if framed.send(QuorumPacket::ping()).await.is_err() {
                    return Err(LearnerExit::ToLooking);
                }
                Ok(())
            }
            PacketType::Proposal => self.handle_proposal(framed, &packet).await,
            PacketType::Commit => self.handle_commit(packet.zxid),
            PacketType::Inform => self.handle_inform(&packet),
            PacketType::Revalidate => match packet.parse_revalidate_reply() {
                Ok((session_id, valid)) => {
                    if !self.replies.resolve_revalidation(session_id, valid) {
                        slog::warn!(self.logger, "Unsolicited revalidation reply for session {:#x}.", session_id);
                    }
                    Ok(())
                }
                Err(e) => {
                    slog::warn!(self.logger, "Malformed revalidation reply: {}", e);
                    Err(LearnerExit::ToLooking)
                }
            },
            PacketType::Sync => match packet.parse_sync() {
                Ok((session_id, cxid)) => {
                    if !self.replies.resolve_sync(session_id, cxid) {
                        slog::warn!(self.logger, "Unsolicited sync reply for session {:#x}.", session_id);
                    }
                    Ok(())
                }
                Err(e) => {
                    slog::warn!(self.logger, "Malformed sync reply: {}", e);
                    Err(LearnerExit::ToLooking)
                }
            },
            other => {
                slog::warn!(self.logger, "Unexpected {:?} from the leader.", other);
                Ok(())
            }
        }
    }

    /// Followers log and ack every proposal; the ack promises the txn is in
    /// the local log, nothing more.
    async fn handle_proposal(&mut self, framed: &mut LeaderLink, packet: &QuorumPacket) -> Result<(), LearnerExit> {
        if !self.caps.acks_proposals {
            slog::warn!(self.logger, "Observer received a proposal; ignoring it.");
            return Ok(());
        }
        let txn = match packet.parse_txn() {
            Ok(txn) => txn,
            Err(e) => {
                slog::warn!(self.logger, "Malformed proposal: {}", e);
                return Err(LearnerExit::ToLooking);
            }
        };
        let zxid = txn.zxid;
        if let Err(e) = self.log.append(txn.clone()) {
            slog::error!(self.logger, "Cannot log proposal {}: {}", zxid, e);
            return Err(LearnerExit::Fatal);
        }
        self.pending_commits.push_back(txn);
        if framed.send(QuorumPacket::ack(zxid)).await.is_err() {
            return Err(LearnerExit::ToLooking);
        }
        Ok(())
    }

    /// Commits arrive in proposal order; anything but the pending head means
    /// this learner and the leader disagree about history.
    fn handle_commit(&mut self, zxid: Zxid) -> Result<(), LearnerExit> {
        if !self.caps.acks_proposals {
            slog::warn!(self.logger, "Observer received a commit; ignoring it.");
            return Ok(());
        }
        match self.pending_commits.front() {
            Some(head) if head.zxid == zxid => {}
            Some(head) => {
                slog::error!(
                    self.logger,
                    "Commit for {} does not match the next pending proposal {}; resyncing.",
                    zxid,
                    head.zxid
                );
                return Err(LearnerExit::ToLooking);
            }
            None => {
                slog::error!(self.logger, "Commit for {} with nothing pending; resyncing.", zxid);
                return Err(LearnerExit::ToLooking);
            }
        }
        let txn = match self.pending_commits.pop_front() {
            Some(txn) => txn,
            None => return Err(LearnerExit::ToLooking),
        };
        if let Err(e) = self.log.mark_committed(zxid) {
            slog::error!(self.logger, "Cannot mark {} committed: {}", zxid, e);
            return Err(LearnerExit::Fatal);
        }
        let _ = self.committed_tx.send(CommitInput::Txn(txn));
        Ok(())
    }

    /// Observers get committed transactions directly. Each INFORM must be the
    /// exact continuation of the applied sequence: the next counter in the
    /// same epoch, or the first txn of a later epoch. Anything else means
    /// this observer and the leader disagree about history.
    fn handle_inform(&mut self, packet: &QuorumPacket) -> Result<(), LearnerExit> {
        if self.caps.acks_proposals {
            slog::warn!(self.logger, "Follower received an INFORM; ignoring it.");
            return Ok(());
        }
        let txn = match packet.parse_txn() {
            Ok(txn) => txn,
            Err(e) => {
                slog::warn!(self.logger, "Malformed INFORM: {}", e);
                return Err(LearnerExit::ToLooking);
            }
        };
        let last = self.log.last_committed_zxid();
        let continues =
            txn.zxid == last.next() || (txn.zxid.epoch() > last.epoch() && txn.zxid.counter() == 1);
        if !continues {
            slog::error!(
                self.logger,
                "INFORM for {} does not follow {}; resyncing.",
                txn.zxid,
                last
            );
            return Err(LearnerExit::ToLooking);
        }
        let zxid = txn.zxid;
        if let Err(e) = self.log.append(txn.clone()) {
            slog::error!(self.logger, "Cannot log informed txn {}: {}", zxid, e);
            return Err(LearnerExit::Fatal);
        }
        if let Err(e) = self.log.mark_committed(zxid) {
            slog::error!(self.logger, "Cannot mark {} committed: {}", zxid, e);
            return Err(LearnerExit::Fatal);
        }
        let _ = self.committed_tx.send(CommitInput::Txn(txn));
        Ok(())
    }

    /// A diff or trunc boundary confirms our retained log up to `boundary` as
    /// the leader's own committed history. Anything in that prefix we had not
    /// applied yet is applied now; the leader will never resend it.
    fn commit_local_prefix(&mut self, boundary: Zxid) -> Result<(), LearnerExit> {
        for txn in self.log.uncommitted_tail() {
            if txn.zxid > boundary {
                break;
            }
            if let Err(e) = self.log.mark_committed(txn.zxid) {
                slog::error!(self.logger, "Cannot mark {} committed: {}", txn.zxid, e);
                return Err(LearnerExit::Fatal);
            }
            slog::info!(self.logger, "Committing retained history {}.", txn.zxid);
            let _ = self.committed_tx.send(CommitInput::Txn(txn));
        }
        Ok(())
    }

    /// The truncation cut below the applied point: transactions the
    /// application already consumed are no longer history. They cannot be
    /// taken back one by one, so the application is rebuilt from the
    /// truncated committed prefix.
    fn rebuild_from_truncated_log(&mut self, applied: Zxid) -> Result<(), LearnerExit> {
        let snapshot = match self.log.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                slog::error!(self.logger, "Cannot snapshot the truncated log: {}", e);
                return Err(LearnerExit::Fatal);
            }
        };
        slog::warn!(
            self.logger,
            "Truncated below the applied point {}; rebuilding the application at {}.",
            applied,
            snapshot.last_zxid
        );
        let _ = self.committed_tx.send(CommitInput::Snapshot {
            last_zxid: snapshot.last_zxid,
            data: snapshot.data,
        });
        Ok(())
    }

    async fn forward(&mut self, framed: &mut LeaderLink, submission: ClientSubmission) -> Result<(), LearnerExit> {
        match submission {
            ClientSubmission::Write { request, done } => {
                // Queue before forwarding so the matcher sees local writes in
                // the order the leader will propose them.
                let _ = self.local_tx.send(PendingWrite {
                    session_id: request.session_id,
                    cxid: request.cxid,
                    done,
                });
                if framed.send(QuorumPacket::request(&request, Vec::new())).await.is_err() {
                    return Err(LearnerExit::ToLooking);
                }
            }
            ClientSubmission::SyncBarrier { session_id, cxid, done } => {
                self.replies.expect_sync(session_id, cxid, done);
                if framed.send(QuorumPacket::sync(session_id, cxid)).await.is_err() {
                    return Err(LearnerExit::ToLooking);
                }
            }
            ClientSubmission::RevalidateSession { session_id, timeout_ms, done } => {
                self.replies.expect_revalidation(session_id, done);
                if framed.send(QuorumPacket::revalidate(session_id, timeout_ms)).await.is_err() {
                    return Err(LearnerExit::ToLooking);
                }
            }
        }
        Ok(())
    }

    /// Peers still LOOKING probe with their ballots; answer with the leader
    /// we settled on so they converge without a fresh election.
    fn answer_ballot(&self, ballot: Ballot, messenger: &ElectionMessenger) {
        if ballot.sender_state != PeerState::Looking {
            return;
        }
        let state = match self.role {
            ServerRole::Participant => PeerState::Following,
            ServerRole::Observer => PeerState::Observing,
        };
        let vote = Vote {
            leader: self.leader_id,
            zxid: self.log.last_logged_zxid(),
            epoch: self.pstate.current_epoch(),
        };
        messenger.send_to(
            ballot.from,
            Ballot {
                vote,
                from: self.membership.my_id(),
                round: self.round,
                sender_state: state,
            },
        );
    }

    /// One packet off the leader link, bounded by the init window. Used for
    /// the registration and sync phases where silence means a dead leader.
    async fn next_packet(&mut self, framed: &mut LeaderLink, shutdown: &mut ShutdownSignal) -> Result<QuorumPacket, LearnerExit> {
        let window = self.config.tick_time * self.config.init_limit_ticks;
        tokio::select! {
            _ = shutdown.wait() => Err(LearnerExit::Shutdown),
            next = timeout(window, framed.next()) => match next {
                Ok(Some(Ok(packet))) => Ok(packet),
                Ok(Some(Err(e))) => {
                    slog::warn!(self.logger, "Leader link failed: {}", e);
                    Err(LearnerExit::ToLooking)
                }
                Ok(None) => {
                    slog::info!(self.logger, "Leader closed the link.");
                    Err(LearnerExit::ToLooking)
                }
                Err(_) => {
                    slog::warn!(self.logger, "Leader went silent before we were in sync.");
                    Err(LearnerExit::ToLooking)
                }
            },
        }
    }
}
