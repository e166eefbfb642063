use crate::cluster::{ServerId, ServerRole};
use crate::leader::LeaderEvent;
use crate::peer::{Epoch, ShutdownSignal, Zxid};
use crate::wire::{PacketCodec, PacketType, QuorumPacket};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::codec::Framed;

/// Per-learner connection task. Owns the socket for one follower or observer:
/// reads its packets and routes them to the leader as events, and drains the
/// outbound queue the leader writes catch-up and broadcast packets into.
///
/// The leader drops the outbound queue to disconnect a learner; the handler
/// notices and exits. The handler exiting for any reason reports
/// `LearnerClosed` so the leader can drop the slot.
pub async fn run_learner_handler(
    logger: slog::Logger,
    stream: TcpStream,
    leader_tx: mpsc::Sender<LeaderEvent>,
    tick_time: Duration,
    init_limit_ticks: u32,
    sync_limit_ticks: u32,
    mut shutdown: ShutdownSignal,
) {
    let mut framed = Framed::new(stream, PacketCodec::new());
    let init_window = tick_time * init_limit_ticks;
    let sync_window = tick_time * sync_limit_ticks;

    // The first packet must identify the learner.
    let first = match timeout(init_window, framed.next()).await {
        Ok(Some(Ok(packet))) => packet,
        Ok(Some(Err(e))) => {
            slog::warn!(logger, "Learner link failed before registration: {}", e);
            return;
        }
        Ok(None) | Err(_) => {
            slog::debug!(logger, "Learner link closed before registration.");
            return;
        }
    };
    let role = match first.ptype {
        PacketType::FollowerInfo => ServerRole::Participant,
        PacketType::ObserverInfo => ServerRole::Observer,
        other => {
            slog::warn!(logger, "Learner link opened with {:?} instead of an info packet.", other);
            return;
        }
    };
    let (sid, accepted_epoch) = match first.parse_learner_info() {
        Ok(info) => info,
        Err(e) => {
            slog::warn!(logger, "Malformed learner info packet: {}", e);
            return;
        }
    };
    let logger = logger.new(slog::o!("learner" => sid.as_u64()));
    slog::info!(logger, "Learner registered as {:?} at {}.", role, first.zxid);

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let registered = leader_tx
        .send(LeaderEvent::Register {
            sid,
            role,
            accepted_epoch,
            last_logged: first.zxid,
            outbound: outbound_tx,
        })
        .await
        .is_ok();
    if !registered {
        return;
    }

    let mut last_contact = Instant::now();
    let mut leader_epoch: Option<Epoch> = None;
    let mut newleader_acked = false;
    let mut active = false;
    let mut ping = tokio::time::interval(tick_time);
    loop {
        // Generous while the learner is still syncing, then the stricter
        // steady-state window.
        let window = if active { sync_window } else { init_window };
        tokio::select! {
            _ = shutdown.wait() => {
                break;
            }
            _ = sleep_until(last_contact + window) => {
                slog::warn!(logger, "Learner went silent; closing its link.");
                break;
            }
            _ = ping.tick(), if active => {
                if framed.send(QuorumPacket::ping()).await.is_err() {
                    break;
                }
            }
            queued = outbound_rx.recv() => match queued {
                Some(packet) => {
                    let activates = packet.ptype == PacketType::UpToDate;
                    if packet.ptype == PacketType::LeaderInfo {
                        leader_epoch = Some(packet.zxid.epoch());
                    }
                    if framed.send(packet).await.is_err() {
                        break;
                    }
                    if activates {
                        active = true;
                        last_contact = Instant::now();
                    }
                }
                // Leader dropped this learner.
                None => break,
            },
            inbound = framed.next() => match inbound {
                Some(Ok(packet)) => {
                    last_contact = Instant::now();
                    if !route_inbound(&logger, packet, sid, &leader_tx, leader_epoch, &mut newleader_acked).await {
                        break;
                    }
                }
                Some(Err(e)) => {
                    slog::debug!(logger, "Learner link failed: {}", e);
                    break;
                }
                None => break,
            },
        }
    }

    // Close our end of the outbound queue first: the leader tells a stale
    // LearnerClosed from a replaced link apart from ours by whether the
    // current slot's queue is still open.
    drop(outbound_rx);
    let _ = leader_tx.send(LeaderEvent::LearnerClosed { sid }).await;
    slog::info!(logger, "Learner handler exited.");
}

/// Translates one inbound packet into a leader event. Returns false when the
/// link should be torn down.
async fn route_inbound(
    logger: &slog::Logger,
    packet: QuorumPacket,
    sid: ServerId,
    leader_tx: &mpsc::Sender<LeaderEvent>,
    leader_epoch: Option<Epoch>,
    newleader_acked: &mut bool,
) -> bool {
    let event = match packet.ptype {
        PacketType::AckEpoch => match packet.parse_ack_epoch() {
            Ok((current_epoch, last_zxid)) => LeaderEvent::EpochAck { sid, current_epoch, last_zxid },
            Err(e) => {
                slog::warn!(logger, "Malformed epoch ack: {}", e);
                return false;
            }
        },
        PacketType::Ack => {
            // The first ack after LEADERINFO answers NEWLEADER, not a proposal.
            let answers_newleader = !*newleader_acked
                && leader_epoch.map_or(false, |epoch| packet.zxid == Zxid::epoch_base(epoch));
            if answers_newleader {
                *newleader_acked = true;
                LeaderEvent::NewLeaderAck { sid }
            } else {
                LeaderEvent::Ack { sid, zxid: packet.zxid }
            }
        }
        PacketType::Ping => return true,
        PacketType::Request => match packet.parse_request() {
            Ok(request) => LeaderEvent::ForwardedRequest { request },
            Err(e) => {
                slog::warn!(logger, "Malformed forwarded request: {}", e);
                return false;
            }
        },
        PacketType::Revalidate => match packet.parse_revalidate() {
            Ok((session_id, timeout_ms)) => LeaderEvent::Revalidate { sid, session_id, timeout_ms },
            Err(e) => {
                slog::warn!(logger, "Malformed revalidate: {}", e);
                return false;
            }
        },
        PacketType::Sync => match packet.parse_sync() {
            Ok((session_id, cxid)) => LeaderEvent::SyncRequested { sid, session_id, cxid },
            Err(e) => {
                slog::warn!(logger, "Malformed sync request: {}", e);
                return false;
            }
        },
        other => {
            slog::warn!(logger, "Unexpected {:?} from learner.", other);
            return true;
        }
    };

    leader_tx.send(event).await.is_ok()
}
