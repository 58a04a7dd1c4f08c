//! Snapshots
//!
//! A snapshot pins a sequence number; reads at the snapshot ignore newer
//! rows and compaction keeps enough history to serve every live pin.

use parking_lot::Mutex;
use shardfs_common::SequenceNo;
use std::sync::{Arc, Weak};

/// A pinned read point. Dropping the handle releases the pin.
pub struct Snapshot {
    seq: SequenceNo,
}

impl Snapshot {
    pub fn sequence(&self) -> SequenceNo {
        self.seq
    }
}

/// The engine's registry of live snapshots.
#[derive(Default)]
pub struct SnapshotList {
    pins: Mutex<Vec<Weak<Snapshot>>>,
}

impl SnapshotList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, seq: SequenceNo) -> Arc<Snapshot> {
        let snap = Arc::new(Snapshot { seq });
        let mut pins = self.pins.lock();
        pins.retain(|w| w.strong_count() > 0);
        pins.push(Arc::downgrade(&snap));
        snap
    }

    /// The oldest live pin, or None when nothing is pinned.
    pub fn oldest(&self) -> Option<SequenceNo> {
        let mut pins = self.pins.lock();
        pins.retain(|w| w.strong_count() > 0);
        pins.iter()
            .filter_map(|w| w.upgrade())
            .map(|s| s.seq)
            .min()
    }

    pub fn is_empty(&self) -> bool {
        self.oldest().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_tracks_drops() {
        let list = SnapshotList::new();
        assert!(list.is_empty());

        let s1 = list.acquire(10);
        let s2 = list.acquire(20);
        assert_eq!(list.oldest(), Some(10));

        drop(s1);
        assert_eq!(list.oldest(), Some(20));
        drop(s2);
        assert!(list.is_empty());
    }
}
