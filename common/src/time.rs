// Copyright (c) 2018-2022 The Botho Foundation

//! `PeerTime`: a node's boot-epoch plus a per-epoch monotonic counter, used
//! to order a peer's alive messages without relying on wall-clock time.

use serde::{Deserialize, Serialize};

/// `{incNum, seqNum}`. `incNum` increases across restarts (the node's boot
/// epoch); `seqNum` is a per-epoch monotonic counter. Ordering is
/// lexicographic: a higher `incNum` always wins, and within the same
/// `incNum` a higher `seqNum` wins.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct PeerTime {
    /// The node's boot epoch.
    pub inc_num: u64,
    /// Per-epoch monotonic counter.
    pub seq_num: u64,
}

impl PeerTime {
    /// Build a `PeerTime`.
    pub fn new(inc_num: u64, seq_num: u64) -> Self {
        Self { inc_num, seq_num }
    }

    /// The first timestamp of a freshly booted epoch.
    pub fn epoch_start(inc_num: u64) -> Self {
        Self { inc_num, seq_num: 0 }
    }

    /// Return the next timestamp in the same epoch.
    pub fn next(self) -> Self {
        Self {
            inc_num: self.inc_num,
            seq_num: self.seq_num + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_lexicographic() {
        assert!(PeerTime::new(1, 100) < PeerTime::new(2, 0));
        assert!(PeerTime::new(1, 1) < PeerTime::new(1, 2));
        assert_eq!(PeerTime::new(1, 1), PeerTime::new(1, 1));
    }

    #[test]
    fn next_increments_seq_num_within_epoch() {
        let t = PeerTime::epoch_start(5);
        assert_eq!(t.next(), PeerTime::new(5, 1));
        assert_eq!(t.next().next(), PeerTime::new(5, 2));
    }
}
