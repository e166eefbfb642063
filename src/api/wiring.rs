use crate::api::create_commit_stream;
use crate::api::event_bus::ZabEventListener;
use crate::api::options::ZabOptionsValidated;
use crate::api::types::ZabMemberInfo;
use crate::api::write_handle::ZabWriteHandle;
use crate::api::{ZabCommitStream, ZabOptions};
use crate::cluster::{ClusterMembership, QuorumServer, ServerId};
use crate::peer::{
    role_channel, shutdown_channel, InMemoryPeerState, PeerConfig, QuorumPeer, ShutdownHandle, ZxidCell,
};
use crate::pipeline::CommitMatcher;
use crate::txnlog::InMemoryTxnLog;
use std::convert::TryFrom;
use std::error::Error;
use std::io;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Submissions wait here until the peer has an established role. Bounded so a
/// peer stuck in election pushes back instead of buffering without limit.
const SUBMIT_QUEUE_CAP: usize = 1000;

pub struct ZabPeerConfig {
    pub my_server_id: u64,
    pub cluster_members: Vec<ZabMemberInfo>,
    pub info_logger: slog::Logger,
    pub options: ZabOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum ZabPeerCreationError {
    #[error("Invalid cluster info")]
    InvalidClusterInfo(Box<dyn Error>),
    #[error("Illegal options for configuring the peer: {0}")]
    IllegalPeerOptions(String),
    #[error("Could not bind the election listener")]
    ElectionListenerBind(io::Error),
}

/// A running peer and the handles the application drives it with. Dropping
/// `shutdown_handle` stops the peer.
pub struct ZabPeer {
    pub write_handle: ZabWriteHandle,
    pub commit_stream: ZabCommitStream,
    pub event_listener: ZabEventListener,
    pub shutdown_handle: ShutdownHandle,
}

pub async fn try_create_peer(config: ZabPeerConfig) -> Result<ZabPeer, ZabPeerCreationError> {
    let root_logger = config.info_logger;
    let my_server_id = config.my_server_id;

    let servers: Vec<QuorumServer> = config.cluster_members.into_iter().map(QuorumServer::from).collect();
    let membership = ClusterMembership::new(ServerId::new(my_server_id), servers)
        .map_err(|e| ZabPeerCreationError::InvalidClusterInfo(e.into()))?;

    let options = ZabOptionsValidated::try_from(config.options)
        .map_err(|e| ZabPeerCreationError::IllegalPeerOptions(e.to_string()))?;

    // The election port is held for the life of the peer. The quorum port is
    // bound by the leader role, per term.
    let election_listener = TcpListener::bind(membership.me().election_addr())
        .await
        .map_err(ZabPeerCreationError::ElectionListenerBind)?;

    let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_QUEUE_CAP);
    let (local_tx, local_rx) = mpsc::unbounded_channel();
    let (committed_tx, committed_rx) = mpsc::unbounded_channel();
    let (commit_publisher, commit_stream) = create_commit_stream();
    let (role_notifier, role_listener) = role_channel(root_logger.new(slog::o!("subsystem" => "status")));
    let (shutdown_handle, shutdown_signal) = shutdown_channel();
    let last_committed = ZxidCell::new();

    let matcher = CommitMatcher::new(
        root_logger.new(slog::o!("subsystem" => "pipeline")),
        commit_publisher,
        last_committed.clone(),
    );
    tokio::spawn(matcher.run(local_rx, committed_rx));

    let peer = QuorumPeer::new(
        root_logger,
        peer_config(&options),
        membership,
        InMemoryTxnLog::new(),
        InMemoryPeerState::new(),
        role_notifier,
        local_tx,
        committed_tx,
    );
    tokio::spawn(peer.run(election_listener, submit_rx, shutdown_signal));

    let write_handle = ZabWriteHandle::new(submit_tx, new_session_id(my_server_id));

    Ok(ZabPeer {
        write_handle,
        commit_stream,
        event_listener: ZabEventListener::new(role_listener, last_committed),
        shutdown_handle,
    })
}

fn peer_config(options: &ZabOptionsValidated) -> PeerConfig {
    PeerConfig {
        tick_time: options.tick_time,
        init_limit_ticks: options.init_limit_ticks,
        sync_limit_ticks: options.sync_limit_ticks,
        finalize_wait: options.election_finalize_wait,
        max_notification_interval: options.election_max_notification_interval,
    }
}

/// Session ids carry the minting server's id in the top byte so sessions
/// created at different peers cannot collide.
fn new_session_id(my_server_id: u64) -> u64 {
    (my_server_id << 56) | (rand::random::<u64>() >> 8)
}
