use crate::cluster::{ClusterMembership, QuorumServer, ServerId};
use crate::election::vote::Ballot;
use crate::peer::ShutdownSignal;
use crate::wire::{PacketCodec, PacketType, QuorumPacket};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tokio_util::codec::Framed;

/// Bounded inbox; a flood of notifications backpressures the senders rather
/// than growing memory.
pub const INBOUND_QUEUE_CAP: usize = 100;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Ballot transport between peers. Each peer dials every other peer's
/// election port to send and accepts inbound connections to receive, so no
/// connection tie-breaking is needed.
///
/// Outbound delivery is latest-wins per peer: only the freshest undelivered
/// ballot matters, older ones are happily clobbered. Lost ballots are
/// tolerated because the election loop re-broadcasts on timeout.
pub struct ElectionMessenger {
    outbound: HashMap<ServerId, watch::Sender<Option<Ballot>>>,
    inbound_rx: mpsc::Receiver<Ballot>,
}

impl ElectionMessenger {
    /// Takes an already-bound listener so bind failures surface at peer
    /// creation time.
    pub fn start(
        logger: slog::Logger,
        membership: &ClusterMembership,
        listener: TcpListener,
        shutdown: ShutdownSignal,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAP);

        let acceptor_logger = logger.new(slog::o!("task" => "election-acceptor"));
        tokio::spawn(run_acceptor(acceptor_logger, listener, inbound_tx, shutdown.clone()));

        let mut outbound = HashMap::new();
        for peer in membership.peers() {
            let (ballot_tx, ballot_rx) = watch::channel(None);
            outbound.insert(peer.id, ballot_tx);
            let sender_logger = logger.new(slog::o!("task" => "election-sender", "to" => peer.id.as_u64()));
            tokio::spawn(run_peer_sender(sender_logger, peer.clone(), ballot_rx, shutdown.clone()));
        }

        ElectionMessenger { outbound, inbound_rx }
    }

    pub fn send_to(&self, peer: ServerId, ballot: Ballot) {
        if let Some(ballot_tx) = self.outbound.get(&peer) {
            let _ = ballot_tx.send(Some(ballot));
        }
    }

    /// Queues the ballot for every other peer. The caller accounts for its
    /// own vote directly.
    pub fn broadcast(&self, ballot: Ballot) {
        for ballot_tx in self.outbound.values() {
            let _ = ballot_tx.send(Some(ballot.clone()));
        }
    }

    pub async fn recv(&mut self) -> Option<Ballot> {
        self.inbound_rx.recv().await
    }
}

async fn run_acceptor(
    logger: slog::Logger,
    listener: TcpListener,
    inbound_tx: mpsc::Sender<Ballot>,
    mut shutdown: ShutdownSignal,
) {
    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let reader_logger = logger.new(slog::o!("remote" => remote.to_string()));
                    tokio::spawn(run_reader(reader_logger, stream, inbound_tx.clone(), shutdown.clone()));
                }
                Err(e) => {
                    slog::warn!(logger, "Election accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn run_reader(
    logger: slog::Logger,
    stream: TcpStream,
    inbound_tx: mpsc::Sender<Ballot>,
    mut shutdown: ShutdownSignal,
) {
    let mut framed = Framed::new(stream, PacketCodec::new());
    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            packet = framed.next() => match packet {
                Some(Ok(packet)) if packet.ptype == PacketType::Ballot => {
                    match packet.parse_ballot() {
                        Ok(ballot) => {
                            if inbound_tx.send(ballot).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            slog::warn!(logger, "Bad ballot payload, closing link: {}", e);
                            return;
                        }
                    }
                }
                Some(Ok(packet)) => {
                    slog::warn!(logger, "Unexpected {:?} on election link.", packet.ptype);
                }
                Some(Err(e)) => {
                    slog::debug!(logger, "Election link failed: {}", e);
                    return;
                }
                None => return,
            }
        }
    }
}

async fn run_peer_sender(
    logger: slog::Logger,
    peer: QuorumServer,
    mut ballot_rx: watch::Receiver<Option<Ballot>>,
    mut shutdown: ShutdownSignal,
) {
    let mut conn: Option<Framed<TcpStream, PacketCodec>> = None;
    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            changed = ballot_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
        let ballot = match ballot_rx.borrow().clone() {
            Some(ballot) => ballot,
            None => continue,
        };
        let packet = QuorumPacket::ballot(&ballot);

        // At most one reconnect attempt per ballot; undelivered ballots are
        // retried when the election loop re-broadcasts.
        for _ in 0..2 {
            if conn.is_none() {
                conn = connect(&peer, &logger).await;
            }
            match conn.as_mut() {
                Some(framed) => match framed.send(packet.clone()).await {
                    Ok(()) => break,
                    Err(e) => {
                        slog::debug!(logger, "Ballot send failed, dropping connection: {}", e);
                        conn = None;
                    }
                },
                None => break,
            }
        }
    }
}

async fn connect(peer: &QuorumServer, logger: &slog::Logger) -> Option<Framed<TcpStream, PacketCodec>> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer.election_addr())).await {
        Ok(Ok(stream)) => Some(Framed::new(stream, PacketCodec::new())),
        Ok(Err(e)) => {
            slog::debug!(logger, "Cannot reach election peer: {}", e);
            None
        }
        Err(_) => {
            slog::debug!(logger, "Election connect timed out.");
            None
        }
    }
}
