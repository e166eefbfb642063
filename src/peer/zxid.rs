use std::fmt;

/// Epoch of a leader's reign. A new leader establishes a strictly greater
/// epoch before it may broadcast anything.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Epoch(u32);

impl Epoch {
    pub const ZERO: Epoch = Epoch(0);

    pub fn new(epoch: u32) -> Self {
        Epoch(epoch)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

/// 64-bit transaction id that totally orders all state changes in the
/// ensemble. The high 32 bits are the epoch of the leader that proposed the
/// transaction, the low 32 bits a counter that restarts at 1 within each
/// epoch.
///
/// Comparing two zxids as plain u64s therefore compares (epoch, counter)
/// lexicographically, which is exactly the replication order.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Zxid(u64);

impl Zxid {
    pub const ZERO: Zxid = Zxid(0);

    pub fn new(epoch: Epoch, counter: u32) -> Self {
        Zxid(((epoch.0 as u64) << 32) | counter as u64)
    }

    /// The zxid a fresh epoch starts from, before any transaction has been
    /// proposed in it. This is the zxid carried by a leader's NEWLEADER
    /// packet.
    pub fn epoch_base(epoch: Epoch) -> Self {
        Zxid::new(epoch, 0)
    }

    pub fn from_u64(val: u64) -> Self {
        Zxid(val)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn epoch(&self) -> Epoch {
        Epoch((self.0 >> 32) as u32)
    }

    pub fn counter(&self) -> u32 {
        self.0 as u32
    }

    /// Next zxid within the same epoch.
    pub fn next(&self) -> Zxid {
        Zxid(self.0 + 1)
    }

    /// True if `self` is the zxid expected directly after `prev`: the next
    /// counter of the same epoch, or the first transaction of a greater
    /// epoch.
    pub fn is_successor_of(&self, prev: Zxid) -> bool {
        if self.epoch() == prev.epoch() {
            self.counter() == prev.counter().wrapping_add(1)
        } else {
            self.epoch() > prev.epoch() && self.counter() == 1
        }
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Zxid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Zxid(0x{:x})", self.0)
    }
}

impl fmt::Display for Zxid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zxid_packs_epoch_and_counter() {
        let zxid = Zxid::new(Epoch::new(3), 17);
        assert_eq!(zxid.epoch(), Epoch::new(3));
        assert_eq!(zxid.counter(), 17);
        assert_eq!(zxid.as_u64(), (3u64 << 32) | 17);
        assert_eq!(Zxid::from_u64(zxid.as_u64()), zxid);
    }

    #[test]
    fn zxid_orders_by_epoch_then_counter() {
        let a = Zxid::new(Epoch::new(1), 500);
        let b = Zxid::new(Epoch::new(2), 1);
        let c = Zxid::new(Epoch::new(2), 2);
        assert!(a < b);
        assert!(b < c);
        assert!(Zxid::ZERO < a);
    }

    #[test]
    fn successor_within_epoch() {
        let prev = Zxid::new(Epoch::new(5), 9);
        assert!(Zxid::new(Epoch::new(5), 10).is_successor_of(prev));
        assert!(!Zxid::new(Epoch::new(5), 11).is_successor_of(prev));
        assert!(!Zxid::new(Epoch::new(5), 9).is_successor_of(prev));
    }

    #[test]
    fn successor_across_epochs_must_restart_counter() {
        let prev = Zxid::new(Epoch::new(5), 9);
        assert!(Zxid::new(Epoch::new(6), 1).is_successor_of(prev));
        assert!(Zxid::new(Epoch::new(8), 1).is_successor_of(prev));
        assert!(!Zxid::new(Epoch::new(6), 2).is_successor_of(prev));
        assert!(!Zxid::new(Epoch::new(4), 1).is_successor_of(prev));
    }

    #[test]
    fn first_transaction_of_epoch_follows_epoch_base() {
        let base = Zxid::epoch_base(Epoch::new(7));
        assert!(base.next().is_successor_of(base));
        assert_eq!(base.next(), Zxid::new(Epoch::new(7), 1));
    }

    #[test]
    fn display_is_hex() {
        let zxid = Zxid::new(Epoch::new(1), 255);
        assert_eq!(format!("{}", zxid), "0x1000000ff");
    }

    #[test]
    fn epoch_displays_as_decimal() {
        assert_eq!(format!("{}", Epoch::new(42)), "42");
    }
}
