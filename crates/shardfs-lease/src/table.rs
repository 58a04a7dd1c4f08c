use parking_lot::{Condvar, Mutex};
use shardfs_common::{DirId, Error, LeaseOptions, LookupStat, NameHash, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// Identity of a lease: one name in one directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LeaseKey {
    pub dir: DirId,
    pub name_hash: NameHash,
}

impl LeaseKey {
    pub fn new(dir: DirId, name_hash: NameHash) -> Self {
        Self { dir, name_hash }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseState {
    Free,
    Shared,
    Locked,
}

struct LeaseRecord {
    state: LeaseState,
    /// Absolute deadline, microseconds. Frozen while Locked.
    due: u64,
    value: LookupStat,
    /// In-process pin count; pinned entries cannot be evicted.
    refs: u32,
    /// Recency stamp for the lazy LRU queue.
    stamp: u64,
}

/// Outcome of a lookup
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseLookup {
    /// Valid Shared lease; the deadline was extended.
    Hit(LookupStat),
    /// A writer holds the lease; it cannot change before `until`.
    /// Callers either wait for the transition or answer "not yet".
    Locked { until: u64 },
    /// No usable lease; fill from the store and `insert`.
    Miss,
}

/// Granted to a writer: changes may be applied once `now >= frozen_due`.
#[derive(Clone, Copy, Debug)]
pub struct WriterGrant {
    pub frozen_due: u64,
}

impl WriterGrant {
    /// How long the writer still has to wait at `now`.
    pub fn wait_duration(&self, now: u64) -> Duration {
        Duration::from_micros(self.frozen_due.saturating_sub(now))
    }
}

/// Cache counters
#[derive(Debug, Default)]
pub struct LeaseStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl LeaseStats {
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

/// The lease table proper. Requires external synchronization; wrap in
/// [`SyncLeaseTable`] for an internally synchronized table.
pub struct LeaseTable {
    options: LeaseOptions,
    entries: HashMap<LeaseKey, LeaseRecord>,
    /// Lazy LRU: (stamp, key) pairs; stale pairs are skipped on pop.
    recency: VecDeque<(u64, LeaseKey)>,
    next_stamp: u64,
    /// Live lease count per directory, for invalidation accounting.
    dir_counts: HashMap<DirId, usize>,
    /// Servers extend deadlines on lookup; clients must not, because
    /// extension authority stays with the issuing server.
    extend_on_lookup: bool,
    stats: LeaseStats,
}

impl LeaseTable {
    pub fn new(options: LeaseOptions) -> Self {
        let options = options.sanitize();
        Self {
            options,
            entries: HashMap::new(),
            recency: VecDeque::new(),
            next_stamp: 0,
            dir_counts: HashMap::new(),
            extend_on_lookup: true,
            stats: LeaseStats::default(),
        }
    }

    /// A client-side table: deadlines come from server replies verbatim
    /// and lookups never extend them.
    pub fn client(options: LeaseOptions) -> Self {
        Self {
            extend_on_lookup: false,
            ..Self::new(options)
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &LeaseStats {
        &self.stats
    }

    /// Live leases below one directory.
    pub fn leases_for_dir(&self, dir: DirId) -> usize {
        self.dir_counts.get(&dir).copied().unwrap_or(0)
    }

    fn touch(&mut self, key: LeaseKey) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        if let Some(rec) = self.entries.get_mut(&key) {
            rec.stamp = stamp;
        }
        self.recency.push_back((stamp, key));
        // Keep the queue from growing unboundedly under re-touches.
        if self.recency.len() > self.entries.len().saturating_mul(4).max(64) {
            self.compact_recency();
        }
    }

    fn compact_recency(&mut self) {
        let entries = &self.entries;
        self.recency
            .retain(|(stamp, key)| entries.get(key).is_some_and(|r| r.stamp == *stamp));
    }

    /// Look a name up at wall-clock `now` (microseconds).
    pub fn lookup(&mut self, key: LeaseKey, now: u64) -> LeaseLookup {
        let lease_d = self.options.max_lease_duration;
        let outcome = match self.entries.get_mut(&key) {
            None => LeaseLookup::Miss,
            Some(rec) => match rec.state {
                LeaseState::Locked => LeaseLookup::Locked { until: rec.due },
                LeaseState::Shared if now < rec.due => {
                    // Each lookup refreshes the deadline (servers only).
                    if self.extend_on_lookup {
                        rec.due = now + lease_d;
                    }
                    let mut value = rec.value.clone();
                    value.lease_due = rec.due;
                    LeaseLookup::Hit(value)
                }
                LeaseState::Shared => {
                    // Expired: all holders have discarded it.
                    rec.state = LeaseState::Free;
                    LeaseLookup::Miss
                }
                LeaseState::Free if self.extend_on_lookup => {
                    // Cold data can be re-shared on the spot.
                    rec.state = LeaseState::Shared;
                    rec.due = now + lease_d;
                    let mut value = rec.value.clone();
                    value.lease_due = rec.due;
                    LeaseLookup::Hit(value)
                }
                LeaseState::Free => LeaseLookup::Miss,
            },
        };
        match &outcome {
            LeaseLookup::Hit(_) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                self.touch(key);
            }
            _ => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        outcome
    }

    /// Install (or refresh) a lease after a store read. Returns the
    /// shared payload with its deadline.
    pub fn insert(&mut self, key: LeaseKey, mut value: LookupStat, now: u64) -> LookupStat {
        value.lease_due = now + self.options.max_lease_duration;
        self.install(key, value, now)
    }

    /// Install a lease whose deadline was stamped elsewhere (a client
    /// caching a server reply).
    pub fn insert_with_due(&mut self, key: LeaseKey, value: LookupStat, now: u64) -> LookupStat {
        self.install(key, value, now)
    }

    fn install(&mut self, key: LeaseKey, value: LookupStat, now: u64) -> LookupStat {
        let due = value.lease_due;
        match self.entries.get_mut(&key) {
            Some(rec) => {
                // A locked lease keeps its frozen deadline; the pending
                // writer owns the next payload.
                if rec.state != LeaseState::Locked {
                    rec.state = LeaseState::Shared;
                    rec.due = due;
                    rec.value = value.clone();
                }
            }
            None => {
                self.evict_for_room(now);
                self.entries.insert(
                    key,
                    LeaseRecord {
                        state: LeaseState::Shared,
                        due,
                        value: value.clone(),
                        refs: 0,
                        stamp: 0,
                    },
                );
                *self.dir_counts.entry(key.dir).or_insert(0) += 1;
            }
        }
        self.touch(key);
        value
    }

    /// Take the lease for writing. The caller must not apply or publish
    /// its change before `grant.frozen_due`.
    pub fn writer_acquire(&mut self, key: LeaseKey, now: u64) -> Result<WriterGrant> {
        match self.entries.get_mut(&key) {
            Some(rec) => match rec.state {
                LeaseState::Locked => Err(Error::already_exists(
                    "another writer holds this lease".to_string(),
                )),
                LeaseState::Shared => {
                    rec.state = LeaseState::Locked;
                    // Freeze: no lookup may extend it past this point.
                    let frozen = rec.due.min(now + self.options.max_lease_duration);
                    rec.due = frozen;
                    if now >= frozen {
                        // Already expired; no holder can still trust it.
                        Ok(WriterGrant { frozen_due: now })
                    } else {
                        Ok(WriterGrant { frozen_due: frozen })
                    }
                }
                LeaseState::Free => {
                    rec.state = LeaseState::Locked;
                    rec.due = now;
                    Ok(WriterGrant { frozen_due: now })
                }
            },
            None => {
                self.evict_for_room(now);
                self.entries.insert(
                    key,
                    LeaseRecord {
                        state: LeaseState::Locked,
                        due: now,
                        value: LookupStat::default(),
                        refs: 0,
                        stamp: 0,
                    },
                );
                *self.dir_counts.entry(key.dir).or_insert(0) += 1;
                self.touch(key);
                Ok(WriterGrant { frozen_due: now })
            }
        }
    }

    /// Publish the writer's payload and return it with its new
    /// deadline. Requires `now >= frozen_due`.
    pub fn writer_commit(
        &mut self,
        key: LeaseKey,
        value: LookupStat,
        now: u64,
    ) -> Result<LookupStat> {
        let lease_d = self.options.max_lease_duration;
        let rec = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| Error::not_found("lease vanished under writer".to_string()))?;
        if rec.state != LeaseState::Locked {
            return Err(Error::AssertionFailed(
                "commit without writer_acquire".to_string(),
            ));
        }
        debug_assert!(now >= rec.due, "writer committed before lease expiry");
        rec.state = LeaseState::Shared;
        rec.due = now + lease_d;
        rec.value = value;
        rec.value.lease_due = rec.due;
        let published = rec.value.clone();
        self.touch(key);
        Ok(published)
    }

    /// Remove the lease entirely as part of a commit (for unlink).
    pub fn writer_commit_erase(&mut self, key: LeaseKey) -> Result<()> {
        match self.entries.get(&key) {
            Some(rec) if rec.state == LeaseState::Locked => {
                self.remove_entry(&key);
                Ok(())
            }
            Some(_) => Err(Error::AssertionFailed(
                "erase without writer_acquire".to_string(),
            )),
            None => Ok(()),
        }
    }

    /// Back out of a write: the old payload stays published.
    pub fn writer_abort(&mut self, key: LeaseKey) {
        if let Some(rec) = self.entries.get_mut(&key) {
            if rec.state == LeaseState::Locked {
                rec.state = LeaseState::Shared;
            }
        }
    }

    /// Pin an entry against eviction.
    pub fn pin(&mut self, key: LeaseKey) -> bool {
        match self.entries.get_mut(&key) {
            Some(rec) => {
                rec.refs += 1;
                true
            }
            None => false,
        }
    }

    pub fn unpin(&mut self, key: LeaseKey) {
        if let Some(rec) = self.entries.get_mut(&key) {
            debug_assert!(rec.refs > 0);
            rec.refs = rec.refs.saturating_sub(1);
        }
    }

    /// Drop an entry outright (directory removal).
    pub fn erase(&mut self, key: LeaseKey) {
        self.remove_entry(&key);
    }

    fn remove_entry(&mut self, key: &LeaseKey) {
        if self.entries.remove(key).is_some() {
            if let Some(count) = self.dir_counts.get_mut(&key.dir) {
                *count -= 1;
                if *count == 0 {
                    self.dir_counts.remove(&key.dir);
                }
            }
        }
    }

    /// Evict until there is room for one more entry. Only unpinned
    /// entries whose lease is free (or expired-shared) are eligible;
    /// locked leases never go away underneath their writer.
    fn evict_for_room(&mut self, now: u64) {
        while self.entries.len() >= self.options.max_num_leases {
            let Some((stamp, key)) = self.recency.pop_front() else {
                break;
            };
            let evictable = match self.entries.get(&key) {
                Some(rec) if rec.stamp == stamp => {
                    rec.refs == 0
                        && match rec.state {
                            LeaseState::Free => true,
                            LeaseState::Shared => now >= rec.due,
                            LeaseState::Locked => false,
                        }
                }
                _ => continue, // stale queue entry
            };
            if evictable {
                trace!(dir = %key.dir, "evicting lease");
                self.remove_entry(&key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            } else {
                // Still hot or protected; recycle to the back.
                self.recency.push_back((stamp, key));
                // Nothing else can be freed right now.
                if self.recency.len() <= 1 {
                    break;
                }
                // Avoid spinning over a queue of unevictable entries.
                let all_protected = self
                    .recency
                    .iter()
                    .all(|(s, k)| match self.entries.get(k) {
                        Some(r) if r.stamp == *s => {
                            r.refs > 0
                                || r.state == LeaseState::Locked
                                || (r.state == LeaseState::Shared && now < r.due)
                        }
                        _ => false,
                    });
                if all_protected {
                    break;
                }
            }
        }
    }
}

/// Internally synchronized lease table: handler threads share it
/// directly.
pub struct SyncLeaseTable {
    inner: Mutex<LeaseTable>,
    /// Signaled on writer commit/abort so blocked lookups can re-check.
    changed: Condvar,
}

impl SyncLeaseTable {
    pub fn new(options: LeaseOptions) -> Self {
        Self {
            inner: Mutex::new(LeaseTable::new(options)),
            changed: Condvar::new(),
        }
    }

    /// Client-side variant: deadlines come from replies, lookups never
    /// extend.
    pub fn client(options: LeaseOptions) -> Self {
        Self {
            inner: Mutex::new(LeaseTable::client(options)),
            changed: Condvar::new(),
        }
    }

    pub fn lookup(&self, key: LeaseKey, now: u64) -> LeaseLookup {
        self.inner.lock().lookup(key, now)
    }

    pub fn insert(&self, key: LeaseKey, value: LookupStat, now: u64) -> LookupStat {
        self.inner.lock().insert(key, value, now)
    }

    pub fn insert_with_due(&self, key: LeaseKey, value: LookupStat, now: u64) -> LookupStat {
        self.inner.lock().insert_with_due(key, value, now)
    }

    pub fn writer_acquire(&self, key: LeaseKey, now: u64) -> Result<WriterGrant> {
        self.inner.lock().writer_acquire(key, now)
    }

    pub fn writer_commit(&self, key: LeaseKey, value: LookupStat, now: u64) -> Result<LookupStat> {
        let r = self.inner.lock().writer_commit(key, value, now);
        self.changed.notify_all();
        r
    }

    pub fn writer_commit_erase(&self, key: LeaseKey) -> Result<()> {
        let r = self.inner.lock().writer_commit_erase(key);
        self.changed.notify_all();
        r
    }

    pub fn writer_abort(&self, key: LeaseKey) {
        self.inner.lock().writer_abort(key);
        self.changed.notify_all();
    }

    pub fn erase(&self, key: LeaseKey) {
        self.inner.lock().erase(key);
    }

    pub fn leases_for_dir(&self, dir: DirId) -> usize {
        self.inner.lock().leases_for_dir(dir)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Wait (bounded) for a locked lease to transition, then retry the
    /// lookup once.
    pub fn lookup_waiting(&self, key: LeaseKey, now_fn: impl Fn() -> u64) -> LeaseLookup {
        let mut table = self.inner.lock();
        match table.lookup(key, now_fn()) {
            LeaseLookup::Locked { until } => {
                let now = now_fn();
                let wait = Duration::from_micros(until.saturating_sub(now));
                self.changed.wait_for(&mut table, wait);
                table.lookup(key, now_fn())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(cap: usize, lease_us: u64) -> LeaseOptions {
        LeaseOptions {
            max_lease_duration: lease_us,
            max_num_leases: cap,
        }
    }

    fn key(n: u64) -> LeaseKey {
        LeaseKey::new(DirId::new(0, 1), NameHash::of(&format!("name-{n}")))
    }

    fn stat(ino: u64) -> LookupStat {
        LookupStat {
            inode: ino,
            mode: 0o100644,
            uid: 1,
            gid: 1,
            zeroth_server: 0,
            lease_due: 0,
        }
    }

    #[test]
    fn test_miss_then_insert_then_hit() {
        let mut table = LeaseTable::new(opts(100, 1_000_000));
        let k = key(1);
        assert_eq!(table.lookup(k, 0), LeaseLookup::Miss);
        table.insert(k, stat(9), 0);
        match table.lookup(k, 100) {
            LeaseLookup::Hit(v) => {
                assert_eq!(v.inode, 9);
                assert_eq!(v.lease_due, 100 + 1_000_000);
            }
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[test]
    fn test_expired_lease_is_a_miss() {
        let mut table = LeaseTable::new(opts(100, 1_000));
        let k = key(1);
        table.insert(k, stat(1), 0);
        assert!(matches!(table.lookup(k, 500), LeaseLookup::Hit(_)));
        // Past the refreshed deadline.
        assert_eq!(table.lookup(k, 5_000_000), LeaseLookup::Miss);
        // The entry went Free and re-shares on the next lookup.
        assert!(matches!(table.lookup(k, 5_000_001), LeaseLookup::Hit(_)));
    }

    #[test]
    fn test_writer_waits_out_shared_holders() {
        let mut table = LeaseTable::new(opts(100, 1_000_000));
        let k = key(1);
        table.insert(k, stat(1), 0);
        let grant = table.writer_acquire(k, 10).unwrap();
        // The lease was due at 1_000_000; the writer must wait it out.
        assert_eq!(grant.frozen_due, 1_000_000);
        assert_eq!(grant.wait_duration(10).as_micros() as u64, 999_990);

        // Lookups meanwhile see Locked and must not extend.
        assert_eq!(
            table.lookup(k, 20),
            LeaseLookup::Locked { until: 1_000_000 }
        );

        table.writer_commit(k, stat(2), 1_000_000).unwrap();
        match table.lookup(k, 1_000_001) {
            LeaseLookup::Hit(v) => assert_eq!(v.inode, 2),
            other => panic!("expected new payload, got {other:?}"),
        }
    }

    #[test]
    fn test_writer_on_expired_lease_proceeds_immediately() {
        let mut table = LeaseTable::new(opts(100, 1_000));
        let k = key(1);
        table.insert(k, stat(1), 0);
        let now = 10_000; // long past due
        let grant = table.writer_acquire(k, now).unwrap();
        assert_eq!(grant.frozen_due, now);
        assert_eq!(grant.wait_duration(now), Duration::ZERO);
    }

    #[test]
    fn test_second_writer_rejected() {
        let mut table = LeaseTable::new(opts(100, 1_000_000));
        let k = key(1);
        table.insert(k, stat(1), 0);
        table.writer_acquire(k, 0).unwrap();
        assert!(table.writer_acquire(k, 1).is_err());
    }

    #[test]
    fn test_abort_keeps_old_payload() {
        let mut table = LeaseTable::new(opts(100, 1_000_000));
        let k = key(1);
        table.insert(k, stat(5), 0);
        table.writer_acquire(k, 10).unwrap();
        table.writer_abort(k);
        match table.lookup(k, 20) {
            LeaseLookup::Hit(v) => assert_eq!(v.inode, 5),
            other => panic!("expected old payload, got {other:?}"),
        }
    }

    #[test]
    fn test_commit_erase_removes_entry() {
        let mut table = LeaseTable::new(opts(100, 1_000));
        let k = key(1);
        table.insert(k, stat(5), 0);
        table.writer_acquire(k, 5_000).unwrap();
        table.writer_commit_erase(k).unwrap();
        assert_eq!(table.lookup(k, 5_001), LeaseLookup::Miss);
        assert_eq!(table.leases_for_dir(DirId::new(0, 1)), 0);
    }

    #[test]
    fn test_capacity_evicts_expired_first() {
        let mut table = LeaseTable::new(opts(16, 1_000));
        // sanitize clamps capacity up to 16.
        for i in 0..16 {
            table.insert(key(i), stat(i), 0);
        }
        assert_eq!(table.len(), 16);
        // All leases expired by now=10_000; inserting evicts.
        table.insert(key(99), stat(99), 10_000);
        assert_eq!(table.len(), 16);
        assert!(matches!(table.lookup(key(99), 10_001), LeaseLookup::Hit(_)));
    }

    #[test]
    fn test_pinned_entries_survive_pressure() {
        let mut table = LeaseTable::new(opts(16, 1_000));
        for i in 0..16 {
            table.insert(key(i), stat(i), 0);
        }
        assert!(table.pin(key(0)));
        // Everything expired; pressure evicts, but never the pin.
        for i in 100..140 {
            table.insert(key(i), stat(i), 10_000);
        }
        assert!(matches!(
            table.lookup(key(0), 10_001),
            LeaseLookup::Hit(_)
        ));
        table.unpin(key(0));
    }

    #[test]
    fn test_locked_lease_never_evicted() {
        let mut table = LeaseTable::new(opts(16, 1_000));
        for i in 0..16 {
            table.insert(key(i), stat(i), 0);
        }
        table.writer_acquire(key(3), 5_000).unwrap();
        for i in 100..140 {
            table.insert(key(i), stat(i), 10_000);
        }
        // The locked entry is still there for its writer.
        table.writer_commit(key(3), stat(33), 10_000).unwrap();
    }

    #[test]
    fn test_dir_lease_accounting() {
        let mut table = LeaseTable::new(opts(100, 1_000_000));
        let dir_a = DirId::new(0, 1);
        let dir_b = DirId::new(0, 2);
        table.insert(LeaseKey::new(dir_a, NameHash::of("x")), stat(1), 0);
        table.insert(LeaseKey::new(dir_a, NameHash::of("y")), stat(2), 0);
        table.insert(LeaseKey::new(dir_b, NameHash::of("z")), stat(3), 0);
        assert_eq!(table.leases_for_dir(dir_a), 2);
        assert_eq!(table.leases_for_dir(dir_b), 1);
        table.erase(LeaseKey::new(dir_a, NameHash::of("x")));
        assert_eq!(table.leases_for_dir(dir_a), 1);
    }

    #[test]
    fn test_sync_table_shared_across_threads() {
        use std::sync::Arc;
        let table = Arc::new(SyncLeaseTable::new(opts(1024, 1_000_000)));
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let table = table.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let k = key(t * 1000 + i);
                    table.insert(k, stat(i), 0);
                    assert!(matches!(table.lookup(k, 1), LeaseLookup::Hit(_)));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.len(), 800);
    }
}
