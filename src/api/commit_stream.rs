use crate::peer::Zxid;
use crate::wire;
use bytes::Bytes;
use tokio::sync::mpsc;

pub(crate) fn create_commit_stream() -> (CommitStreamPublisher, ZabCommitStream) {
    let (tx, rx) = mpsc::unbounded_channel();

    let publisher = CommitStreamPublisher { sender: tx };
    let stream = ZabCommitStream { receiver: rx };

    (publisher, stream)
}

pub(crate) struct CommitStreamPublisher {
    sender: mpsc::UnboundedSender<ZabCommitEvent>,
}

impl CommitStreamPublisher {
    pub fn notify(&self, logger: &slog::Logger, event: ZabCommitEvent) {
        if self.sender.send(event).is_err() {
            slog::warn!(logger, "Commit stream has disconnected.");
        }
    }
}

// For external application to call into this library.
pub struct ZabCommitStream {
    receiver: mpsc::UnboundedReceiver<ZabCommitEvent>,
}

impl ZabCommitStream {
    /// Returns the next committed change to apply to your application's
    /// state, or None once the peer has shut down. Events arrive in strict
    /// zxid order regardless of which peer originally accepted the write.
    pub async fn next(&mut self) -> Option<ZabCommitEvent> {
        self.receiver.recv().await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ZabCommitEvent {
    Committed(ZabCommittedTxn),

    /// This peer was too far behind to catch up incrementally and installed
    /// a full snapshot. The application must replace its state with `data`;
    /// every transaction at or below `last_zxid` is folded into it.
    SnapshotInstalled { last_zxid: Zxid, data: Bytes },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZabCommittedTxn {
    pub zxid: Zxid,
    pub session_id: u64,
    pub op: i32,
    pub data: Bytes,
}

/// Decodes a snapshot blob into the committed transactions folded into it,
/// oldest first. Replaying them against empty application state reproduces
/// the snapshot.
pub fn decode_snapshot(data: &Bytes) -> Result<Vec<ZabCommittedTxn>, SnapshotDecodeError> {
    let mut remaining = data.clone();
    let mut txns = Vec::new();
    while !remaining.is_empty() {
        let txn = wire::decode_txn(&mut remaining).map_err(|e| SnapshotDecodeError(e.to_string()))?;
        txns.push(ZabCommittedTxn {
            zxid: txn.zxid,
            session_id: txn.session_id,
            op: txn.op,
            data: txn.payload,
        });
    }
    Ok(txns)
}

#[derive(Debug, thiserror::Error)]
#[error("Snapshot blob is corrupt: {0}")]
pub struct SnapshotDecodeError(String);
