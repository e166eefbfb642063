use crate::peer::Zxid;
use crate::pipeline::{ClientSubmission, Request, WriteError};
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{mpsc, oneshot};

/// ZabWriteHandle is how the external application submits work to its local
/// peer. Writes are accepted at any peer; a leader proposes them itself, a
/// follower or observer forwards them to the leader. Each handle owns a
/// session, and requests are tagged `(session_id, cxid)` so this peer can
/// recognize its own commits coming back off the ordered stream.
pub struct ZabWriteHandle {
    submit_tx: mpsc::Sender<ClientSubmission>,
    session_id: u64,
    next_cxid: AtomicU32,
}

impl ZabWriteHandle {
    pub(crate) fn new(submit_tx: mpsc::Sender<ClientSubmission>, session_id: u64) -> Self {
        ZabWriteHandle {
            submit_tx,
            session_id,
            next_cxid: AtomicU32::new(1),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Submits a write and resolves once it has committed, with the zxid the
    /// leader stamped on it. `ConnectionLoss` means the outcome is unknown:
    /// the write may still commit.
    pub async fn submit_write(&self, input: SubmitWriteInput) -> Result<SubmitWriteOutput, ZabRequestError> {
        let (done, done_rx) = oneshot::channel();
        let submission = ClientSubmission::Write {
            request: Request {
                session_id: self.session_id,
                cxid: self.take_cxid(),
                op: input.op,
                payload: input.data,
            },
            done,
        };

        self.submit(submission).await?;
        let zxid = Self::resolve(done_rx).await?;
        Ok(SubmitWriteOutput { zxid })
    }

    /// Resolves once everything this peer had in flight toward the leader at
    /// the time of the call has committed. A fence for read-your-writes.
    pub async fn sync_barrier(&self) -> Result<(), ZabRequestError> {
        let (done, done_rx) = oneshot::channel();
        let submission = ClientSubmission::SyncBarrier {
            session_id: self.session_id,
            cxid: self.take_cxid(),
            done,
        };

        self.submit(submission).await?;
        Self::resolve(done_rx).await
    }

    /// Asks the current leader whether a session from a previous connection
    /// is still known to the replicated history.
    pub async fn revalidate_session(
        &self,
        input: RevalidateSessionInput,
    ) -> Result<RevalidateSessionOutput, ZabRequestError> {
        let (done, done_rx) = oneshot::channel();
        let submission = ClientSubmission::RevalidateSession {
            session_id: input.session_id,
            timeout_ms: input.timeout_ms,
            done,
        };

        self.submit(submission).await?;
        let valid = Self::resolve(done_rx).await?;
        Ok(RevalidateSessionOutput { valid })
    }

    fn take_cxid(&self) -> u32 {
        self.next_cxid.fetch_add(1, Ordering::SeqCst)
    }

    async fn submit(&self, submission: ClientSubmission) -> Result<(), ZabRequestError> {
        // Bounded send: a peer stuck in election applies backpressure here.
        self.submit_tx
            .send(submission)
            .await
            .map_err(|_| ZabRequestError::PeerShutdown)
    }

    async fn resolve<T>(done_rx: oneshot::Receiver<Result<T, WriteError>>) -> Result<T, ZabRequestError> {
        match done_rx.await {
            Ok(outcome) => outcome.map_err(ZabRequestError::from),
            // The role fell with the request in flight and dropped it.
            Err(_) => Err(ZabRequestError::ConnectionLoss),
        }
    }
}

#[derive(Debug)]
pub struct SubmitWriteInput {
    /// Application-defined operation code, carried opaquely.
    pub op: i32,
    pub data: Bytes,
}

#[derive(Debug)]
pub struct SubmitWriteOutput {
    pub zxid: Zxid,
}

#[derive(Debug)]
pub struct RevalidateSessionInput {
    pub session_id: u64,
    pub timeout_ms: i32,
}

#[derive(Debug)]
pub struct RevalidateSessionOutput {
    pub valid: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ZabRequestError {
    // Can be retried after the local peer reconnects to a leader; watch the
    // event listener for the next role transition. The request may or may not
    // have committed.
    #[error("Connection to the leader was lost before the request resolved")]
    ConnectionLoss,

    #[error("Peer has shut down")]
    PeerShutdown,
}

// ------- Conversions --------

impl From<WriteError> for ZabRequestError {
    fn from(internal_error: WriteError) -> Self {
        match internal_error {
            WriteError::ConnectionLoss => ZabRequestError::ConnectionLoss,
            WriteError::PeerShutdown => ZabRequestError::PeerShutdown,
        }
    }
}
