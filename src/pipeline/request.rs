use crate::peer::Zxid;
use bytes::Bytes;
use tokio::sync::oneshot;

/// A client write as submitted at some peer, before the leader has assigned
/// it a zxid. `(session_id, cxid)` uniquely identifies the request and is how
/// the submitting peer later recognizes its own commit.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub session_id: u64,
    pub cxid: u32,
    pub op: i32,
    pub payload: Bytes,
}

/// A request after the leader has stamped it into the total order. This is
/// the unit that gets logged, proposed, committed and applied.
#[derive(Debug, Clone, PartialEq)]
pub struct TxnEnvelope {
    pub zxid: Zxid,
    pub session_id: u64,
    pub cxid: u32,
    pub op: i32,
    pub payload: Bytes,
}

impl TxnEnvelope {
    pub fn from_request(zxid: Zxid, request: Request) -> Self {
        TxnEnvelope {
            zxid,
            session_id: request.session_id,
            cxid: request.cxid,
            op: request.op,
            payload: request.payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WriteError {
    /// The request may or may not have committed. The link to the leader was
    /// lost (or leadership was lost) before the outcome was known.
    #[error("Connection to the leader was lost before the request resolved")]
    ConnectionLoss,

    /// The local peer is shutting down and no longer accepts requests.
    #[error("Peer is shut down")]
    PeerShutdown,
}

/// What a client handle pushes into the peer. The active role consumes these:
/// a leader proposes writes directly, a follower or observer forwards them to
/// the leader. While the peer is still LOOKING, submissions queue up in the
/// bounded channel until a role is established.
pub enum ClientSubmission {
    Write {
        request: Request,
        done: oneshot::Sender<Result<Zxid, WriteError>>,
    },
    /// Resolves once everything proposed before it (from this peer's point of
    /// contact with the leader) has committed.
    SyncBarrier {
        session_id: u64,
        cxid: u32,
        done: oneshot::Sender<Result<(), WriteError>>,
    },
    RevalidateSession {
        session_id: u64,
        timeout_ms: i32,
        done: oneshot::Sender<Result<bool, WriteError>>,
    },
}
