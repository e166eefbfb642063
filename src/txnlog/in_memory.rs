use crate::peer::Zxid;
use crate::pipeline::TxnEnvelope;
use crate::txnlog::log::{CommittedWindow, Snapshot, TxnLog, TxnLogError};
use crate::wire;
use bytes::{Bytes, BytesMut};

pub const DEFAULT_COMMITTED_WINDOW: usize = 500;

/// Heap-backed log for tests and single-process setups. Keeps the full
/// history since the last restore; the window cap only bounds what
/// `committed_window()` reports.
pub struct InMemoryTxnLog {
    /// Transactions at or below this zxid live only inside `base_data`.
    snapshot_mark: Zxid,
    base_data: Bytes,
    /// Ordered by zxid, all greater than `snapshot_mark`.
    txns: Vec<TxnEnvelope>,
    committed_upto: Zxid,
    window_cap: usize,
}

impl InMemoryTxnLog {
    pub fn new() -> Self {
        Self::with_window_cap(DEFAULT_COMMITTED_WINDOW)
    }

    pub fn with_window_cap(window_cap: usize) -> Self {
        InMemoryTxnLog {
            snapshot_mark: Zxid::ZERO,
            base_data: Bytes::new(),
            txns: Vec::new(),
            committed_upto: Zxid::ZERO,
            window_cap,
        }
    }

    /// Number of leading txns that are at or below the commit cursor.
    fn committed_prefix_len(&self) -> usize {
        self.txns
            .iter()
            .take_while(|txn| txn.zxid <= self.committed_upto)
            .count()
    }
}

impl TxnLog for InMemoryTxnLog {
    fn append(&mut self, txn: TxnEnvelope) -> Result<(), TxnLogError> {
        let last = self.last_logged_zxid();
        if txn.zxid <= last {
            return Err(TxnLogError::OutOfOrderAppend {
                last,
                attempted: txn.zxid,
            });
        }
        self.txns.push(txn);
        Ok(())
    }

    fn last_logged_zxid(&self) -> Zxid {
        self.txns.last().map(|txn| txn.zxid).unwrap_or(self.snapshot_mark)
    }

    fn mark_committed(&mut self, zxid: Zxid) -> Result<(), TxnLogError> {
        if zxid <= self.committed_upto {
            return Err(TxnLogError::CommitOfUnknownTxn(zxid));
        }
        let logged = self.txns.binary_search_by(|txn| txn.zxid.cmp(&zxid)).is_ok();
        if !logged {
            return Err(TxnLogError::CommitOfUnknownTxn(zxid));
        }
        self.committed_upto = zxid;
        Ok(())
    }

    fn last_committed_zxid(&self) -> Zxid {
        self.committed_upto
    }

    fn truncate_after(&mut self, boundary: Zxid) -> Result<(), TxnLogError> {
        if boundary < self.snapshot_mark {
            return Err(TxnLogError::TruncateIntoSnapshot(boundary));
        }
        self.txns.retain(|txn| txn.zxid <= boundary);
        if self.committed_upto > boundary {
            self.committed_upto = boundary;
        }
        Ok(())
    }

    fn committed_window(&self) -> CommittedWindow {
        let committed = &self.txns[..self.committed_prefix_len()];
        let start = committed.len().saturating_sub(self.window_cap);
        let windowed = &committed[start..];
        CommittedWindow {
            min: windowed.first().map(|txn| txn.zxid).unwrap_or(self.committed_upto),
            max: self.committed_upto,
            txns: windowed.to_vec(),
        }
    }

    fn uncommitted_tail(&self) -> Vec<TxnEnvelope> {
        self.txns[self.committed_prefix_len()..].to_vec()
    }

    fn snapshot(&self) -> Result<Snapshot, TxnLogError> {
        let mut data = BytesMut::with_capacity(self.base_data.len() + self.txns.len() * 64);
        data.extend_from_slice(&self.base_data);
        for txn in &self.txns[..self.committed_prefix_len()] {
            wire::encode_txn_into(txn, &mut data);
        }
        Ok(Snapshot {
            last_zxid: self.committed_upto,
            data: data.freeze(),
        })
    }

    fn restore(&mut self, snapshot: Snapshot) -> Result<(), TxnLogError> {
        // Validate before adopting anything.
        let mut probe = snapshot.data.clone();
        while !probe.is_empty() {
            wire::decode_txn(&mut probe)?;
        }

        self.snapshot_mark = snapshot.last_zxid;
        self.base_data = snapshot.data;
        self.txns.clear();
        self.committed_upto = snapshot.last_zxid;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Epoch;

    fn txn(epoch: u32, counter: u32) -> TxnEnvelope {
        TxnEnvelope {
            zxid: Zxid::new(Epoch::new(epoch), counter),
            session_id: 70,
            cxid: counter,
            op: 1,
            payload: Bytes::from_static(b"data"),
        }
    }

    fn zxid(epoch: u32, counter: u32) -> Zxid {
        Zxid::new(Epoch::new(epoch), counter)
    }

    #[test]
    fn append_requires_increasing_zxids() {
        let mut log = InMemoryTxnLog::new();
        log.append(txn(1, 1)).unwrap();
        log.append(txn(1, 2)).unwrap();
        // Epoch jump leaves a counter gap; that is fine.
        log.append(txn(3, 1)).unwrap();

        let result = log.append(txn(1, 3));
        assert!(matches!(result, Err(TxnLogError::OutOfOrderAppend { .. })));
        assert_eq!(log.last_logged_zxid(), zxid(3, 1));
    }

    #[test]
    fn commit_cursor_moves_through_logged_txns() {
        let mut log = InMemoryTxnLog::new();
        log.append(txn(1, 1)).unwrap();
        log.append(txn(1, 2)).unwrap();

        assert_eq!(log.last_committed_zxid(), Zxid::ZERO);
        log.mark_committed(zxid(1, 1)).unwrap();
        assert_eq!(log.last_committed_zxid(), zxid(1, 1));

        // Unknown and already-passed zxids are rejected.
        assert!(matches!(
            log.mark_committed(zxid(1, 9)),
            Err(TxnLogError::CommitOfUnknownTxn(_))
        ));
        assert!(matches!(
            log.mark_committed(zxid(1, 1)),
            Err(TxnLogError::CommitOfUnknownTxn(_))
        ));
    }

    #[test]
    fn window_reports_only_committed_tail() {
        let mut log = InMemoryTxnLog::with_window_cap(2);
        for counter in 1..=4 {
            log.append(txn(1, counter)).unwrap();
        }
        log.mark_committed(zxid(1, 1)).unwrap();
        log.mark_committed(zxid(1, 2)).unwrap();
        log.mark_committed(zxid(1, 3)).unwrap();

        let window = log.committed_window();
        assert_eq!(window.max, zxid(1, 3));
        assert_eq!(window.min, zxid(1, 2));
        assert_eq!(window.txns.len(), 2);
        assert_eq!(window.txns[0].zxid, zxid(1, 2));

        let tail = log.uncommitted_tail();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].zxid, zxid(1, 4));
    }

    #[test]
    fn empty_window_collapses_to_cursor() {
        let log = InMemoryTxnLog::new();
        let window = log.committed_window();
        assert_eq!(window.min, Zxid::ZERO);
        assert_eq!(window.max, Zxid::ZERO);
        assert!(window.txns.is_empty());
    }

    #[test]
    fn truncate_drops_the_tail() {
        let mut log = InMemoryTxnLog::new();
        for counter in 1..=3 {
            log.append(txn(1, counter)).unwrap();
        }
        log.mark_committed(zxid(1, 1)).unwrap();

        log.truncate_after(zxid(1, 1)).unwrap();
        assert_eq!(log.last_logged_zxid(), zxid(1, 1));
        assert!(log.uncommitted_tail().is_empty());

        // New history can be appended after the cut.
        log.append(txn(2, 1)).unwrap();
        assert_eq!(log.last_logged_zxid(), zxid(2, 1));
    }

    #[test]
    fn snapshot_and_restore_transfer_state() {
        let mut source = InMemoryTxnLog::new();
        for counter in 1..=3 {
            source.append(txn(1, counter)).unwrap();
            source.mark_committed(zxid(1, counter)).unwrap();
        }
        let snapshot = source.snapshot().unwrap();
        assert_eq!(snapshot.last_zxid, zxid(1, 3));

        let mut target = InMemoryTxnLog::new();
        target.restore(snapshot).unwrap();
        assert_eq!(target.last_logged_zxid(), zxid(1, 3));
        assert_eq!(target.last_committed_zxid(), zxid(1, 3));
        assert!(target.committed_window().txns.is_empty());

        // History resumes past the snapshot point.
        target.append(txn(1, 4)).unwrap();
        assert!(matches!(
            target.truncate_after(zxid(1, 2)),
            Err(TxnLogError::TruncateIntoSnapshot(_))
        ));
    }

    #[test]
    fn snapshot_after_restore_carries_prior_history() {
        let mut source = InMemoryTxnLog::new();
        source.append(txn(1, 1)).unwrap();
        source.mark_committed(zxid(1, 1)).unwrap();

        let mut target = InMemoryTxnLog::new();
        target.restore(source.snapshot().unwrap()).unwrap();
        target.append(txn(1, 2)).unwrap();
        target.mark_committed(zxid(1, 2)).unwrap();

        let combined = target.snapshot().unwrap();
        assert_eq!(combined.last_zxid, zxid(1, 2));

        let mut decoded = Vec::new();
        let mut data = combined.data.clone();
        while !data.is_empty() {
            decoded.push(wire::decode_txn(&mut data).unwrap());
        }
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].zxid, zxid(1, 1));
        assert_eq!(decoded[1].zxid, zxid(1, 2));
    }

    #[test]
    fn corrupt_snapshot_is_rejected() {
        let mut log = InMemoryTxnLog::new();
        let result = log.restore(Snapshot {
            last_zxid: zxid(1, 1),
            data: Bytes::from_static(&[1, 2, 3]),
        });
        assert!(matches!(result, Err(TxnLogError::CorruptSnapshot(_))));
        // The failed restore must not have touched anything.
        assert_eq!(log.last_logged_zxid(), Zxid::ZERO);
    }
}
