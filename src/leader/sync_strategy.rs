use crate::peer::Zxid;
use crate::pipeline::TxnEnvelope;
use crate::txnlog::CommittedWindow;

/// How to bring one learner in line with the leader's committed history
/// before it may participate.
#[derive(Debug, PartialEq)]
pub enum SyncPlan {
    /// Learner is consistent with our history; send what it is missing
    /// (possibly nothing).
    Diff { txns: Vec<TxnEnvelope> },
    /// Learner logged transactions we never committed; cut it back to the
    /// last point we share, then send the rest.
    TruncThenDiff { truncate_to: Zxid, txns: Vec<TxnEnvelope> },
    /// Learner is ahead of everything we committed; cut it back.
    Trunc { truncate_to: Zxid },
    /// Learner is behind the retained window; full state transfer.
    Snap,
}

/// Picks the cheapest safe catch-up for a learner whose last logged zxid is
/// `peer_last`, against the leader's retained committed tail.
pub fn plan_sync(peer_last: Zxid, window: &CommittedWindow) -> SyncPlan {
    if peer_last == window.max {
        return SyncPlan::Diff { txns: Vec::new() };
    }
    if peer_last > window.max {
        return SyncPlan::Trunc { truncate_to: window.max };
    }
    if peer_last < window.min {
        return SyncPlan::Snap;
    }

    // Highest retained zxid at or below the learner's point.
    let mut shared = None;
    for txn in &window.txns {
        if txn.zxid <= peer_last {
            shared = Some(txn.zxid);
        } else {
            break;
        }
    }

    match shared {
        Some(boundary) if boundary == peer_last => SyncPlan::Diff {
            txns: txns_after(window, peer_last),
        },
        Some(boundary) => SyncPlan::TruncThenDiff {
            truncate_to: boundary,
            txns: txns_after(window, boundary),
        },
        // peer_last >= window.min guarantees a shared point exists.
        None => SyncPlan::Snap,
    }
}

fn txns_after(window: &CommittedWindow, after: Zxid) -> Vec<TxnEnvelope> {
    window.txns.iter().filter(|txn| txn.zxid > after).cloned().collect()
}
