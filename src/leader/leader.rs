use crate::cluster::{ClusterMembership, MajorityQuorumVerifier, QuorumVerifier, ServerId, ServerRole};
use crate::election::{Ballot, ElectionMessenger, Vote};
use crate::leader::learner_handler;
use crate::leader::sync_strategy::{plan_sync, SyncPlan};
use crate::peer::{Epoch, PeerState, PersistentPeerState, RoleNotifier, RoleSnapshot, ShutdownSignal, Zxid};
use crate::pipeline::{ClientSubmission, CommitInput, PendingWrite, Request, TxnEnvelope, WriteError};
use crate::txnlog::TxnLog;
use crate::wire::QuorumPacket;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

const EVENT_QUEUE_CAP: usize = 100;

#[derive(Clone)]
pub struct LeaderConfig {
    pub tick_time: Duration,
    /// Ticks a startup barrier (or a syncing learner) may take before the
    /// leader gives up.
    pub init_limit_ticks: u32,
    /// Ticks of learner silence tolerated in steady state.
    pub sync_limit_ticks: u32,
}

/// Everything a learner handler can tell the leader.
pub enum LeaderEvent {
    Register {
        sid: ServerId,
        role: ServerRole,
        accepted_epoch: Epoch,
        last_logged: Zxid,
        outbound: mpsc::UnboundedSender<QuorumPacket>,
    },
    EpochAck {
        sid: ServerId,
        current_epoch: Epoch,
        last_zxid: Zxid,
    },
    NewLeaderAck {
        sid: ServerId,
    },
    Ack {
        sid: ServerId,
        zxid: Zxid,
    },
    ForwardedRequest {
        request: Request,
    },
    SyncRequested {
        sid: ServerId,
        session_id: u64,
        cxid: u32,
    },
    Revalidate {
        sid: ServerId,
        session_id: u64,
        timeout_ms: i32,
    },
    LearnerClosed {
        sid: ServerId,
    },
}

/// Why the leader stepped down. Everything except `Shutdown` sends the peer
/// back to LOOKING.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LeaderExit {
    /// Fewer than a quorum of participants are registered and in sync.
    QuorumLost,
    /// The local log or epoch store refused a write; leading without it
    /// would fork history.
    StorageFailed,
    /// Could not bind the quorum port learners connect to.
    BindFailed,
    Shutdown,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SlotPhase {
    /// Sent FOLLOWERINFO/OBSERVERINFO, waiting for the epoch round-trip.
    Registered,
    /// Acked LEADERINFO; eligible for catch-up.
    EpochAcked,
    /// Catch-up and live traffic are flowing; NEWLEADER not acked yet.
    Syncing,
    AckedNewLeader,
    /// Saw UPTODATE; counts toward the steady-state quorum.
    Active,
}

struct LearnerSlot {
    role: ServerRole,
    outbound: mpsc::UnboundedSender<QuorumPacket>,
    phase: SlotPhase,
    /// Once set, live proposals and commits are queued to this learner in
    /// addition to whatever catch-up packets precede them.
    forwarding: bool,
    last_logged: Zxid,
}

struct OutstandingProposal {
    txn: TxnEnvelope,
    acks: HashSet<ServerId>,
}

enum SyncOrigin {
    Local(oneshot::Sender<Result<(), WriteError>>),
    Remote { sid: ServerId, session_id: u64, cxid: u32 },
}

/// The leading role. Single task: accepts learner links, runs the three
/// startup barriers (epoch proposal, epoch ack, NEWLEADER ack), then drives
/// the broadcast pipeline: stamp, log, propose, count acks, commit in order.
///
/// Borrows the peer's log and epoch store for the duration of the term; no
/// locks anywhere because every mutation happens on this task.
pub struct Leader<'a, L: TxnLog, S: PersistentPeerState> {
    logger: slog::Logger,
    config: LeaderConfig,
    membership: &'a ClusterMembership,
    verifier: &'a MajorityQuorumVerifier,
    log: &'a mut L,
    pstate: &'a mut S,
    notifier: &'a RoleNotifier,
    local_tx: mpsc::UnboundedSender<PendingWrite>,
    committed_tx: mpsc::UnboundedSender<CommitInput>,
    /// Election round that elected this leader; echoed when answering
    /// ballots from peers still looking.
    round: u64,

    epoch: Epoch,
    last_proposed: Zxid,
    slots: HashMap<ServerId, LearnerSlot>,
    outstanding: BTreeMap<Zxid, OutstandingProposal>,
    pending_syncs: Vec<(Zxid, SyncOrigin)>,
    sessions_seen: HashSet<u64>,

    epoch_proposals: HashMap<ServerId, Epoch>,
    epoch_acks: HashSet<ServerId>,
    newleader_acks: HashSet<ServerId>,
    b1_done: bool,
    b2_done: bool,
    b3_done: bool,
    ticks_in_phase: u32,
    fatal: Option<LeaderExit>,
}

impl<'a, L: TxnLog, S: PersistentPeerState> Leader<'a, L, S> {
    pub fn new(
        logger: slog::Logger,
        config: LeaderConfig,
        membership: &'a ClusterMembership,
        verifier: &'a MajorityQuorumVerifier,
        log: &'a mut L,
        pstate: &'a mut S,
        notifier: &'a RoleNotifier,
        local_tx: mpsc::UnboundedSender<PendingWrite>,
        committed_tx: mpsc::UnboundedSender<CommitInput>,
        round: u64,
    ) -> Self {
        Leader {
            logger,
            config,
            membership,
            verifier,
            log,
            pstate,
            notifier,
            local_tx,
            committed_tx,
            round,
            epoch: Epoch::ZERO,
            last_proposed: Zxid::ZERO,
            slots: HashMap::new(),
            outstanding: BTreeMap::new(),
            pending_syncs: Vec::new(),
            sessions_seen: HashSet::new(),
            epoch_proposals: HashMap::new(),
            epoch_acks: HashSet::new(),
            newleader_acks: HashSet::new(),
            b1_done: false,
            b2_done: false,
            b3_done: false,
            ticks_in_phase: 0,
            fatal: None,
        }
    }

    pub async fn run(
        mut self,
        messenger: &mut ElectionMessenger,
        submit_rx: &mut mpsc::Receiver<ClientSubmission>,
        mut shutdown: ShutdownSignal,
    ) -> LeaderExit {
        let quorum_addr = self.membership.me().quorum_addr();
        let listener = match TcpListener::bind(quorum_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                slog::error!(self.logger, "Cannot bind leader port {}: {}", quorum_addr, e);
                return LeaderExit::BindFailed;
            }
        };
        slog::info!(
            self.logger,
            "Assuming leadership; need {} of {} participants to establish an epoch.",
            self.verifier.required(),
            self.verifier.num_participants()
        );

        let (event_tx, mut event_rx) = mpsc::channel(EVENT_QUEUE_CAP);

        self.start();
        if let Some(exit) = self.fatal.take() {
            return exit;
        }

        let mut tick = tokio::time::interval(self.config.tick_time);
        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    return LeaderExit::Shutdown;
                }
                _ = tick.tick() => {
                    if let Some(exit) = self.handle_tick() {
                        return exit;
                    }
                }
                event = event_rx.recv() => match event {
                    Some(event) => {
                        self.handle_event(event);
                        if let Some(exit) = self.fatal.take() {
                            return exit;
                        }
                    }
                    // Unreachable while we hold event_tx.
                    None => return LeaderExit::Shutdown,
                },
                submission = submit_rx.recv(), if self.b3_done => match submission {
                    Some(submission) => {
                        self.handle_submission(submission);
                        if let Some(exit) = self.fatal.take() {
                            return exit;
                        }
                    }
                    // Client handle dropped; nothing left to lead for.
                    None => return LeaderExit::Shutdown,
                },
                ballot = messenger.recv() => {
                    if let Some(ballot) = ballot {
                        self.answer_ballot(ballot, messenger);
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let handler_logger = self.logger.new(slog::o!("remote" => remote.to_string()));
                        tokio::spawn(learner_handler::run_learner_handler(
                            handler_logger,
                            stream,
                            event_tx.clone(),
                            self.config.tick_time,
                            self.config.init_limit_ticks,
                            self.config.sync_limit_ticks,
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        slog::warn!(self.logger, "Learner accept failed: {}", e);
                    }
                },
            }
        }
    }

    /// Seeds the barriers with this peer's own contribution. A single-node
    /// ensemble crosses all three immediately.
    fn start(&mut self) {
        let my_id = self.membership.my_id();
        self.epoch_proposals.insert(my_id, self.pstate.accepted_epoch());
        self.epoch_acks.insert(my_id);
        self.newleader_acks.insert(my_id);
        self.try_advance_barriers();
    }

    fn handle_event(&mut self, event: LeaderEvent) {
        match event {
            LeaderEvent::Register { sid, role, accepted_epoch, last_logged, outbound } => {
                self.handle_register(sid, role, accepted_epoch, last_logged, outbound);
            }
            LeaderEvent::EpochAck { sid, current_epoch, last_zxid } => {
                self.handle_epoch_ack(sid, current_epoch, last_zxid);
            }
            LeaderEvent::NewLeaderAck { sid } => self.handle_newleader_ack(sid),
            LeaderEvent::Ack { sid, zxid } => self.handle_ack(sid, zxid),
            LeaderEvent::ForwardedRequest { request } => {
                if !self.b2_done {
                    slog::warn!(self.logger, "Dropping a forwarded request; the epoch is not established yet.");
                    return;
                }
                // Forwarded writes resolve at the peer that accepted them;
                // no local pending entry here.
                self.propose(request);
            }
            LeaderEvent::SyncRequested { sid, session_id, cxid } => {
                self.handle_sync_request(sid, session_id, cxid);
            }
            LeaderEvent::Revalidate { sid, session_id, timeout_ms } => {
                self.handle_revalidate(sid, session_id, timeout_ms);
            }
            LeaderEvent::LearnerClosed { sid } => self.handle_learner_closed(sid),
        }
    }

    fn handle_submission(&mut self, submission: ClientSubmission) {
        match submission {
            ClientSubmission::Write { request, done } => {
                // Queue before proposing so the matcher sees local writes in
                // exactly proposal order.
                let _ = self.local_tx.send(PendingWrite {
                    session_id: request.session_id,
                    cxid: request.cxid,
                    done,
                });
                self.propose(request);
            }
            ClientSubmission::SyncBarrier { session_id, cxid: _, done } => {
                if self.outstanding.is_empty() {
                    let _ = done.send(Ok(()));
                } else {
                    slog::debug!(
                        self.logger,
                        "Sync barrier for session {:#x} waits for {}.",
                        session_id,
                        self.last_proposed
                    );
                    self.pending_syncs.push((self.last_proposed, SyncOrigin::Local(done)));
                }
            }
            ClientSubmission::RevalidateSession { session_id, timeout_ms, done } => {
                let valid = self.sessions_seen.contains(&session_id);
                slog::info!(
                    self.logger,
                    "Session {:#x} revalidated: {} (timeout {} ms).",
                    session_id,
                    valid,
                    timeout_ms
                );
                let _ = done.send(Ok(valid));
            }
        }
    }

    fn handle_register(
        &mut self,
        sid: ServerId,
        claimed_role: ServerRole,
        accepted_epoch: Epoch,
        last_logged: Zxid,
        outbound: mpsc::UnboundedSender<QuorumPacket>,
    ) {
        let member = match self.membership.get(sid) {
            Some(member) => member,
            None => {
                slog::warn!(self.logger, "Server {} is not in the membership; refusing it.", sid);
                return;
            }
        };
        if claimed_role != member.role {
            slog::warn!(
                self.logger,
                "Server {} registered as {:?} but the membership says {:?}; using the membership.",
                sid,
                claimed_role,
                member.role
            );
        }
        let role = member.role;
        if self.slots.contains_key(&sid) {
            slog::info!(self.logger, "Server {} re-registered; replacing its link.", sid);
        }
        self.slots.insert(
            sid,
            LearnerSlot {
                role,
                outbound,
                phase: SlotPhase::Registered,
                forwarding: false,
                last_logged,
            },
        );
        if role == ServerRole::Participant {
            self.epoch_proposals.insert(sid, accepted_epoch);
        }
        if self.b1_done {
            self.send_to(sid, QuorumPacket::leader_info(self.epoch));
        } else {
            self.try_advance_barriers();
        }
    }

    fn handle_epoch_ack(&mut self, sid: ServerId, current_epoch: Epoch, last_zxid: Zxid) {
        let my_last = self.log.last_logged_zxid();
        if last_zxid > my_last {
            slog::error!(
                self.logger,
                "Server {} has more history than the leader ({} > {}); refusing it.",
                sid,
                last_zxid,
                my_last
            );
            self.slots.remove(&sid);
            return;
        }
        let role = match self.slots.get_mut(&sid) {
            Some(slot) => {
                slot.phase = SlotPhase::EpochAcked;
                slot.last_logged = last_zxid;
                slot.role
            }
            None => return,
        };
        slog::debug!(
            self.logger,
            "Server {} acked the epoch at current epoch {}, last zxid {}.",
            sid,
            current_epoch,
            last_zxid
        );
        if role == ServerRole::Participant {
            self.epoch_acks.insert(sid);
        }
        if self.b2_done {
            self.begin_sync(sid);
        } else {
            self.try_advance_barriers();
        }
    }

    fn handle_newleader_ack(&mut self, sid: ServerId) {
        let role = match self.slots.get_mut(&sid) {
            Some(slot) => {
                slot.phase = SlotPhase::AckedNewLeader;
                slot.role
            }
            None => return,
        };
        if role == ServerRole::Participant {
            self.newleader_acks.insert(sid);
        }
        if self.b3_done {
            self.activate(sid);
        } else {
            self.try_advance_barriers();
        }
    }

    fn handle_ack(&mut self, sid: ServerId, zxid: Zxid) {
        if !self.membership.is_participant(sid) {
            slog::warn!(self.logger, "Dropping ack from non-participant {}.", sid);
            return;
        }
        match self.outstanding.get_mut(&zxid) {
            Some(proposal) => {
                proposal.acks.insert(sid);
                self.maybe_commit();
            }
            None => {
                if zxid <= self.log.last_committed_zxid() {
                    slog::debug!(self.logger, "Late ack for {} from {}.", zxid, sid);
                } else {
                    slog::warn!(self.logger, "Ack for unknown proposal {} from {}.", zxid, sid);
                }
            }
        }
    }

    fn handle_sync_request(&mut self, sid: ServerId, session_id: u64, cxid: u32) {
        if self.outstanding.is_empty() {
            self.send_to(sid, QuorumPacket::sync(session_id, cxid));
        } else {
            self.pending_syncs
                .push((self.last_proposed, SyncOrigin::Remote { sid, session_id, cxid }));
        }
    }

    fn handle_revalidate(&mut self, sid: ServerId, session_id: u64, timeout_ms: i32) {
        let valid = self.sessions_seen.contains(&session_id);
        slog::info!(
            self.logger,
            "Session {:#x} revalidated for server {}: {} (timeout {} ms).",
            session_id,
            sid,
            valid,
            timeout_ms
        );
        self.send_to(sid, QuorumPacket::revalidate_reply(session_id, valid));
    }

    fn handle_learner_closed(&mut self, sid: ServerId) {
        // A replaced link reports its close after the new one registered;
        // only the slot whose queue actually closed is dead.
        let gone = match self.slots.get(&sid) {
            Some(slot) => slot.outbound.is_closed(),
            None => false,
        };
        if !gone {
            return;
        }
        self.slots.remove(&sid);
        slog::info!(self.logger, "Learner {} disconnected.", sid);
        if !self.b1_done {
            self.epoch_proposals.remove(&sid);
        }
        if !self.b2_done {
            self.epoch_acks.remove(&sid);
        }
        if !self.b3_done {
            self.newleader_acks.remove(&sid);
        }
    }

    fn handle_tick(&mut self) -> Option<LeaderExit> {
        self.ticks_in_phase += 1;
        if !self.b3_done {
            if self.ticks_in_phase > self.config.init_limit_ticks {
                slog::warn!(self.logger, "No quorum finished startup within the init window; giving up leadership.");
                return Some(LeaderExit::QuorumLost);
            }
            return None;
        }
        let mut connected: HashSet<ServerId> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                slot.role == ServerRole::Participant
                    && matches!(slot.phase, SlotPhase::Syncing | SlotPhase::AckedNewLeader | SlotPhase::Active)
            })
            .map(|(sid, _)| *sid)
            .collect();
        connected.insert(self.membership.my_id());
        if !self.verifier.contains_quorum(&connected) {
            slog::warn!(self.logger, "Lost contact with a quorum of participants; giving up leadership.");
            return Some(LeaderExit::QuorumLost);
        }
        None
    }

    /// Peers still LOOKING probe with their ballots; answer with our
    /// established claim so they settle on us.
    fn answer_ballot(&self, ballot: Ballot, messenger: &ElectionMessenger) {
        if ballot.sender_state != PeerState::Looking {
            return;
        }
        let my_id = self.membership.my_id();
        let vote = Vote {
            leader: my_id,
            zxid: self.log.last_logged_zxid(),
            epoch: self.pstate.current_epoch(),
        };
        messenger.send_to(
            ballot.from,
            Ballot {
                vote,
                from: my_id,
                round: self.round,
                sender_state: PeerState::Leading,
            },
        );
    }

    fn try_advance_barriers(&mut self) {
        if !self.b1_done {
            let proposed: HashSet<ServerId> = self.epoch_proposals.keys().copied().collect();
            if !self.verifier.contains_quorum(&proposed) {
                return;
            }
            let highest = self.epoch_proposals.values().max().copied().unwrap_or(Epoch::ZERO);
            self.epoch = highest.next();
            if let Err(e) = self.pstate.store_accepted_epoch(self.epoch) {
                slog::error!(self.logger, "Cannot persist accepted epoch {}: {}", self.epoch, e);
                self.fatal = Some(LeaderExit::StorageFailed);
                return;
            }
            self.b1_done = true;
            self.ticks_in_phase = 0;
            slog::info!(self.logger, "Established epoch {} from a quorum of proposals.", self.epoch);
            let leader_info = QuorumPacket::leader_info(self.epoch);
            for slot in self.slots.values() {
                let _ = slot.outbound.send(leader_info.clone());
            }
        }

        if !self.b2_done && self.verifier.contains_quorum(&self.epoch_acks) {
            if let Err(e) = self.pstate.store_current_epoch(self.epoch) {
                slog::error!(self.logger, "Cannot persist current epoch {}: {}", self.epoch, e);
                self.fatal = Some(LeaderExit::StorageFailed);
                return;
            }
            self.b2_done = true;
            self.ticks_in_phase = 0;
            self.last_proposed = Zxid::epoch_base(self.epoch);
            self.commit_logged_history();
            if self.fatal.is_some() {
                return;
            }
            let ready: Vec<ServerId> = self
                .slots
                .iter()
                .filter(|(_, slot)| slot.phase == SlotPhase::EpochAcked)
                .map(|(sid, _)| *sid)
                .collect();
            for sid in ready {
                self.begin_sync(sid);
            }
        }

        if self.b2_done && !self.b3_done && self.verifier.contains_quorum(&self.newleader_acks) {
            self.b3_done = true;
            self.ticks_in_phase = 0;
            slog::info!(self.logger, "Quorum synced at epoch {}; broadcast is open.", self.epoch);
            self.notifier.update(RoleSnapshot {
                state: PeerState::Leading,
                leader_id: Some(self.membership.my_id()),
                epoch: self.epoch,
            });
            let acked: Vec<ServerId> = self
                .slots
                .iter()
                .filter(|(_, slot)| slot.phase == SlotPhase::AckedNewLeader)
                .map(|(sid, _)| *sid)
                .collect();
            for sid in acked {
                self.activate(sid);
            }
        }
    }

    /// A freshly elected leader treats everything it ever logged as
    /// committed; that history is what the election chose it for.
    fn commit_logged_history(&mut self) {
        for txn in self.log.committed_window().txns {
            self.sessions_seen.insert(txn.session_id);
        }
        for txn in self.log.uncommitted_tail() {
            if let Err(e) = self.log.mark_committed(txn.zxid) {
                slog::error!(self.logger, "Cannot commit logged history at {}: {}", txn.zxid, e);
                self.fatal = Some(LeaderExit::StorageFailed);
                return;
            }
            slog::info!(self.logger, "Committing logged history {}.", txn.zxid);
            self.sessions_seen.insert(txn.session_id);
            let _ = self.committed_tx.send(CommitInput::Txn(txn));
        }
    }

    /// Queues the catch-up packets for one learner: a plan against the
    /// committed window, then any in-flight proposals, then NEWLEADER. Live
    /// traffic queues behind these from here on, so the learner misses
    /// nothing.
    fn begin_sync(&mut self, sid: ServerId) {
        let (role, last_logged) = match self.slots.get(&sid) {
            Some(slot) => (slot.role, slot.last_logged),
            None => return,
        };
        let window = self.log.committed_window();
        let plan = plan_sync(last_logged, &window);
        let mut packets: Vec<QuorumPacket> = Vec::new();
        match plan {
            SyncPlan::Diff { txns } => {
                slog::info!(self.logger, "Syncing {} from {} with a diff of {} txns.", sid, last_logged, txns.len());
                packets.push(QuorumPacket::diff(window.max));
                push_txn_pairs(role, &txns, &mut packets);
            }
            SyncPlan::TruncThenDiff { truncate_to, txns } => {
                slog::info!(
                    self.logger,
                    "Syncing {}: truncating its diverged history to {}, then a diff of {} txns.",
                    sid,
                    truncate_to,
                    txns.len()
                );
                packets.push(QuorumPacket::trunc(truncate_to));
                push_txn_pairs(role, &txns, &mut packets);
            }
            SyncPlan::Trunc { truncate_to } => {
                slog::info!(self.logger, "Syncing {}: truncating it back to {}.", sid, truncate_to);
                packets.push(QuorumPacket::trunc(truncate_to));
            }
            SyncPlan::Snap => match self.log.snapshot() {
                Ok(snapshot) => {
                    slog::info!(self.logger, "Syncing {} with a full snapshot at {}.", sid, snapshot.last_zxid);
                    packets.push(QuorumPacket::snap(snapshot.last_zxid, snapshot.data));
                }
                Err(e) => {
                    slog::error!(self.logger, "Cannot snapshot for {}: {}", sid, e);
                    self.slots.remove(&sid);
                    return;
                }
            },
        }
        if role == ServerRole::Participant {
            for proposal in self.outstanding.values() {
                packets.push(QuorumPacket::proposal(&proposal.txn));
            }
        }
        packets.push(QuorumPacket::new_leader(self.epoch));

        let slot = match self.slots.get_mut(&sid) {
            Some(slot) => slot,
            None => return,
        };
        slot.phase = SlotPhase::Syncing;
        slot.forwarding = true;
        for packet in packets {
            if slot.outbound.send(packet).is_err() {
                // Handler already exited; its LearnerClosed will clean up.
                return;
            }
        }
    }

    fn activate(&mut self, sid: ServerId) {
        if let Some(slot) = self.slots.get_mut(&sid) {
            slot.phase = SlotPhase::Active;
            let _ = slot.outbound.send(QuorumPacket::up_to_date());
        }
    }

    fn propose(&mut self, request: Request) {
        let zxid = self.last_proposed.next();
        let txn = TxnEnvelope::from_request(zxid, request);
        if let Err(e) = self.log.append(txn.clone()) {
            slog::error!(self.logger, "Cannot log proposal {}: {}", zxid, e);
            self.fatal = Some(LeaderExit::StorageFailed);
            return;
        }
        self.last_proposed = zxid;
        slog::debug!(self.logger, "Proposing {}.", zxid);

        let packet = QuorumPacket::proposal(&txn);
        for slot in self.slots.values() {
            if slot.forwarding && slot.role == ServerRole::Participant {
                let _ = slot.outbound.send(packet.clone());
            }
        }

        let mut acks = HashSet::new();
        acks.insert(self.membership.my_id());
        self.outstanding.insert(zxid, OutstandingProposal { txn, acks });
        // A single-node ensemble is its own quorum.
        self.maybe_commit();
    }

    /// Commits from the head of the outstanding queue for as long as the
    /// head has a quorum. Commit order is proposal order, always.
    fn maybe_commit(&mut self) {
        loop {
            let ready = match self.outstanding.iter().next() {
                Some((zxid, proposal)) if self.verifier.contains_quorum(&proposal.acks) => Some(*zxid),
                _ => None,
            };
            let zxid = match ready {
                Some(zxid) => zxid,
                None => return,
            };
            let proposal = match self.outstanding.remove(&zxid) {
                Some(proposal) => proposal,
                None => return,
            };
            if let Err(e) = self.log.mark_committed(zxid) {
                slog::error!(self.logger, "Cannot mark {} committed: {}", zxid, e);
                self.fatal = Some(LeaderExit::StorageFailed);
                return;
            }
            slog::debug!(self.logger, "Committing {}.", zxid);
            self.sessions_seen.insert(proposal.txn.session_id);

            let commit = QuorumPacket::commit(zxid);
            let inform = QuorumPacket::inform(&proposal.txn);
            for slot in self.slots.values() {
                if !slot.forwarding {
                    continue;
                }
                let packet = match slot.role {
                    ServerRole::Participant => commit.clone(),
                    ServerRole::Observer => inform.clone(),
                };
                let _ = slot.outbound.send(packet);
            }
            let _ = self.committed_tx.send(CommitInput::Txn(proposal.txn));
            self.drain_sync_barriers();
        }
    }

    fn drain_sync_barriers(&mut self) {
        let last_committed = self.log.last_committed_zxid();
        let pending = std::mem::take(&mut self.pending_syncs);
        for (marker, origin) in pending {
            if marker <= last_committed {
                self.finish_sync_barrier(origin);
            } else {
                self.pending_syncs.push((marker, origin));
            }
        }
    }

    fn finish_sync_barrier(&mut self, origin: SyncOrigin) {
        match origin {
            SyncOrigin::Local(done) => {
                let _ = done.send(Ok(()));
            }
            SyncOrigin::Remote { sid, session_id, cxid } => {
                self.send_to(sid, QuorumPacket::sync(session_id, cxid));
            }
        }
    }

    fn send_to(&self, sid: ServerId, packet: QuorumPacket) {
        if let Some(slot) = self.slots.get(&sid) {
            let _ = slot.outbound.send(packet);
        }
    }
}

fn push_txn_pairs(role: ServerRole, txns: &[TxnEnvelope], packets: &mut Vec<QuorumPacket>) {
    for txn in txns {
        match role {
            ServerRole::Participant => {
                packets.push(QuorumPacket::proposal(txn));
                packets.push(QuorumPacket::commit(txn.zxid));
            }
            // Observers never vote, so they get committed state directly.
            ServerRole::Observer => packets.push(QuorumPacket::inform(txn)),
        }
    }
}
