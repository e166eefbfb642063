use crate::peer::Zxid;
use crate::pipeline::TxnEnvelope;
use crate::wire::WireError;
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum TxnLogError {
    #[error("Transaction {attempted} does not come after last logged {last}")]
    OutOfOrderAppend { last: Zxid, attempted: Zxid },
    #[error("Cannot commit {0}: no such transaction is logged")]
    CommitOfUnknownTxn(Zxid),
    #[error("Cannot truncate to {0}: it precedes the local snapshot")]
    TruncateIntoSnapshot(Zxid),
    #[error("Snapshot payload is corrupt: {0}")]
    CorruptSnapshot(#[from] WireError),
    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Application state folded up to a point in the transaction order. The
/// payload layout is owned by the log implementation; the replication
/// machinery only moves it around.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub last_zxid: Zxid,
    pub data: Bytes,
}

/// Recently committed tail retained in memory so learners that are only a
/// little behind can catch up incrementally instead of via full snapshot.
#[derive(Debug, Clone)]
pub struct CommittedWindow {
    /// Oldest committed zxid still retained. Equal to `max` when the window
    /// holds no transactions.
    pub min: Zxid,
    /// Last committed zxid.
    pub max: Zxid,
    pub txns: Vec<TxnEnvelope>,
}

/// Ordered record of transactions this peer has accepted, plus the commit
/// cursor separating applied history from the in-flight tail.
///
/// Single-owner: the peer state machine owns the log and lends it to
/// whichever role is active.
pub trait TxnLog: Send + 'static {
    /// Appends a transaction. Zxids must be strictly increasing; gaps are
    /// fine (epoch changes produce them), regressions are not.
    fn append(&mut self, txn: TxnEnvelope) -> Result<(), TxnLogError>;

    /// Highest zxid ever appended (committed or not). `Zxid::ZERO` when
    /// nothing was ever logged.
    fn last_logged_zxid(&self) -> Zxid;

    /// Moves the commit cursor to `zxid`, which must be a logged transaction
    /// beyond the current cursor. Commits arrive strictly in order.
    fn mark_committed(&mut self, zxid: Zxid) -> Result<(), TxnLogError>;

    fn last_committed_zxid(&self) -> Zxid;

    /// Discards every logged transaction with zxid greater than `boundary`.
    /// Only the uncommitted tail is ever truncated in correct operation.
    fn truncate_after(&mut self, boundary: Zxid) -> Result<(), TxnLogError>;

    fn committed_window(&self) -> CommittedWindow;

    /// Logged transactions past the commit cursor, in order.
    fn uncommitted_tail(&self) -> Vec<TxnEnvelope>;

    fn snapshot(&self) -> Result<Snapshot, TxnLogError>;

    /// Replaces the entire log contents with the snapshot.
    fn restore(&mut self, snapshot: Snapshot) -> Result<(), TxnLogError>;
}
