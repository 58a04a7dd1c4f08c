//! Per-directory control blocks
//!
//! The server hosting a directory's partitions keeps one control block
//! per directory: the partition index, per-partition entry counts, and
//! the split state. Handlers serialize mutations on the block's lock;
//! lookups copy the current index under the lock and route lock-free
//! afterwards.

use parking_lot::{Mutex, MutexGuard};
use shardfs_common::{DirId, NameHash, Result};
use shardfs_index::DirIndex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

pub struct DirState {
    pub index: DirIndex,
    /// Entries per locally hosted partition.
    pub counts: HashMap<u32, u64>,
    /// A split is in flight for this directory.
    pub splitting: bool,
}

impl DirState {
    pub fn count_entry(&mut self, hash: &NameHash) -> u64 {
        let partition = self.index.partition_of(hash);
        let count = self.counts.entry(partition).or_insert(0);
        *count += 1;
        *count
    }

    pub fn uncount_entry(&mut self, hash: &NameHash) {
        let partition = self.index.partition_of(hash);
        if let Some(count) = self.counts.get_mut(&partition) {
            *count = count.saturating_sub(1);
        }
    }
}

/// One directory's server-side control block.
pub struct DirControl {
    pub id: DirId,
    state: Mutex<DirState>,
}

impl DirControl {
    pub fn new(id: DirId, index: DirIndex, counts: HashMap<u32, u64>) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(DirState {
                index,
                counts,
                splitting: false,
            }),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, DirState> {
        self.state.lock()
    }

    /// Copy of the current index for lock-free routing.
    pub fn index_snapshot(&self) -> DirIndex {
        self.state.lock().index.clone()
    }
}

/// Bounded table of live directory control blocks. Entries nobody else
/// holds are dropped under capacity pressure and rebuilt from the store
/// on the next touch.
pub struct DirTable {
    capacity: usize,
    dirs: Mutex<HashMap<DirId, Arc<DirControl>>>,
}

impl DirTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            dirs: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.dirs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.lock().is_empty()
    }

    /// Fetch the control block, building it with `load` on a miss.
    pub fn get_or_load<F>(&self, id: DirId, load: F) -> Result<Arc<DirControl>>
    where
        F: FnOnce() -> Result<Arc<DirControl>>,
    {
        if let Some(dir) = self.dirs.lock().get(&id) {
            return Ok(dir.clone());
        }
        // Build outside the table lock; racing loaders are harmless
        // because the loser's block is dropped.
        let loaded = load()?;
        let mut dirs = self.dirs.lock();
        let entry = dirs.entry(id).or_insert_with(|| loaded).clone();
        if dirs.len() > self.capacity {
            let evictable: Vec<DirId> = dirs
                .iter()
                .filter(|(k, v)| **k != id && Arc::strong_count(v) == 1 && !v.lock().splitting)
                .map(|(k, _)| *k)
                .take(dirs.len() - self.capacity)
                .collect();
            for k in evictable {
                trace!(dir = %k, "evicting directory control block");
                dirs.remove(&k);
            }
        }
        Ok(entry)
    }

    pub fn remove(&self, id: DirId) {
        self.dirs.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardfs_common::IndexOptions;

    fn control(n: u64) -> Arc<DirControl> {
        let id = DirId::new(0, n);
        DirControl::new(
            id,
            DirIndex::new(0, IndexOptions::default()),
            HashMap::new(),
        )
    }

    #[test]
    fn test_get_or_load_caches() {
        let table = DirTable::new(16);
        let a = table
            .get_or_load(DirId::new(0, 1), || Ok(control(1)))
            .unwrap();
        let b = table
            .get_or_load(DirId::new(0, 1), || panic!("must not reload"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_capacity_evicts_unreferenced() {
        let table = DirTable::new(4);
        for i in 0..12 {
            table
                .get_or_load(DirId::new(0, i), || Ok(control(i)))
                .unwrap();
        }
        assert!(table.len() <= 5);
    }

    #[test]
    fn test_held_blocks_survive_eviction() {
        let table = DirTable::new(2);
        let held = table
            .get_or_load(DirId::new(0, 99), || Ok(control(99)))
            .unwrap();
        for i in 0..10 {
            table
                .get_or_load(DirId::new(0, i), || Ok(control(i)))
                .unwrap();
        }
        let again = table
            .get_or_load(DirId::new(0, 99), || panic!("held block was evicted"))
            .unwrap();
        assert!(Arc::ptr_eq(&held, &again));
    }

    #[test]
    fn test_counts_track_partitions() {
        let control = control(1);
        let mut state = control.lock();
        let h = NameHash::of("a");
        let n1 = state.count_entry(&h);
        let n2 = state.count_entry(&NameHash::of("b"));
        assert!(n1 >= 1 && n2 >= 1);
        state.uncount_entry(&h);
        let total: u64 = state.counts.values().sum();
        assert_eq!(total, 1);
    }
}
