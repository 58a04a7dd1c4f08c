//! The metadata key-value engine
//!
//! A log-structured merge tree specialized for filesystem metadata
//! rows. Writes append to the WAL, land in the memtable, and reach
//! immutable table files through background flushes; a single
//! compactor thread keeps levels within budget. Readers resolve
//! against a pinned snapshot and never block the writer.

use crate::batch::WriteBatch;
use crate::filenames::{self, log_file, parse_file_name, table_file, FileKind};
use crate::iterator::{InternalIterator, MergingIterator};
use crate::key::{self, ValueKind};
use crate::log::{LogReader, LogWriter};
use crate::memtable::{MemGet, MemTable};
use crate::snapshot::{Snapshot, SnapshotList};
use crate::storage::{Storage, StorageLock};
use crate::table::TableBuilder;
use crate::table_cache::TableCache;
use crate::version::{FileMetaData, LevelIterator, VersionEdit, NUM_LEVELS};
use crate::version_set::{Compaction, VersionSet};
use parking_lot::{Condvar, Mutex, MutexGuard};
use shardfs_common::{EngineOptions, Error, Result, SequenceNo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Target size of a compaction output file.
const MAX_OUTPUT_FILE_BYTES: u64 = 2 * 1024 * 1024;

struct EngineState {
    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,
    wal: Option<LogWriter>,
    wal_number: u64,
    versions: VersionSet,
    /// Set by an unrecoverable WAL or manifest failure; the engine is
    /// read-only until reopened.
    bg_error: Option<String>,
    pending_seek: Option<(usize, Arc<FileMetaData>)>,
    compaction_running: bool,
}

/// Everything the caller threads and the compactor share.
struct Shared {
    storage: Arc<dyn Storage>,
    dir: PathBuf,
    options: EngineOptions,
    table_cache: Arc<TableCache>,
    state: Mutex<EngineState>,
    /// Wakes the compactor.
    work_cv: Condvar,
    /// Wakes writers stalled on rotation or L0 pressure.
    done_cv: Condvar,
    snapshots: SnapshotList,
    shutdown: AtomicBool,
}

pub struct Engine {
    shared: Arc<Shared>,
    bg_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    _dir_lock: Mutex<Option<Box<dyn StorageLock>>>,
}

impl Engine {
    /// Open (or create) an engine on `dir` with exclusive write access.
    pub fn open(
        storage: Arc<dyn Storage>,
        dir: impl Into<PathBuf>,
        options: EngineOptions,
    ) -> Result<Engine> {
        let dir = dir.into();
        let options = options.sanitize();
        storage.mkdirs(&dir)?;
        let dir_lock = storage.lock(&filenames::lock_file(&dir))?;

        let table_cache = Arc::new(TableCache::new(
            storage.clone(),
            dir.clone(),
            options.clone(),
        ));
        let mut versions = VersionSet::new(
            storage.clone(),
            dir.clone(),
            options.clone(),
            table_cache.clone(),
        );

        if storage.exists(&filenames::current_file(&dir)) {
            versions.recover()?;
        } else {
            versions.create_new()?;
        }

        // Replay WALs newer than the manifest's log number, flush the
        // result, and start a fresh log.
        let mut edit = VersionEdit::default();
        let recovered = replay_wal_files(&storage, &dir, &options, &mut versions, &mut edit)?;

        let wal_number = versions.new_file_number();
        let wal = LogWriter::new(storage.new_writable(&log_file(&dir, wal_number))?);
        edit.set_log_number(wal_number);
        versions.log_and_apply(edit)?;

        let shared = Arc::new(Shared {
            storage,
            dir,
            options,
            table_cache,
            state: Mutex::new(EngineState {
                mem: MemTable::new(),
                imm: None,
                wal: Some(wal),
                wal_number,
                versions,
                bg_error: None,
                pending_seek: None,
                compaction_running: false,
            }),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
            snapshots: SnapshotList::new(),
            shutdown: AtomicBool::new(false),
        });

        // Orphan temporaries from an interrupted ingest are discarded
        // here; their sender re-ships because its delete was gated on
        // our acknowledgement.
        shared.remove_obsolete_files(true);
        if recovered > 0 {
            info!(records = recovered, "replayed write-ahead log");
        }

        let bg = shared.clone();
        let handle = std::thread::Builder::new()
            .name("shardfs-compactor".to_string())
            .spawn(move || bg.background_loop())
            .map_err(|e| Error::io(format!("cannot spawn compactor: {e}")))?;

        Ok(Engine {
            shared,
            bg_handle: Mutex::new(Some(handle)),
            _dir_lock: Mutex::new(Some(dir_lock)),
        })
    }

    pub fn put(&self, user_key: &[u8], value: &[u8]) -> Result<SequenceNo> {
        let mut batch = WriteBatch::new();
        batch.put(user_key, value);
        self.write(batch)
    }

    pub fn delete(&self, user_key: &[u8]) -> Result<SequenceNo> {
        let mut batch = WriteBatch::new();
        batch.delete(user_key);
        self.write(batch)
    }

    /// Apply a batch atomically. Durable once the WAL sync returns (per
    /// the `sync_writes` option). Returns the batch's last sequence,
    /// the linearization point for clients.
    pub fn write(&self, batch: WriteBatch) -> Result<SequenceNo> {
        self.shared.write(batch)
    }

    /// Newest value for `user_key` not shadowed by a tombstone, at the
    /// given snapshot (or the current sequence).
    pub fn get(&self, user_key: &[u8], snapshot: Option<&Snapshot>) -> Result<Option<Vec<u8>>> {
        self.shared.get(user_key, snapshot)
    }

    /// Pin the current sequence for repeatable reads.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        let state = self.shared.state.lock();
        self.shared.snapshots.acquire(state.versions.last_sequence)
    }

    /// A user-level iterator at a consistent snapshot.
    pub fn iter(&self, snapshot: Option<&Snapshot>) -> Result<EngineIterator> {
        self.shared.iter(snapshot)
    }

    /// Collect user-visible rows in `[begin, end)` at a snapshot.
    pub fn scan(
        &self,
        begin: &[u8],
        end: &[u8],
        snapshot: Option<&Snapshot>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.shared.scan(begin, end, snapshot)
    }

    /// Issue tombstones for every live row in `[begin, end)`. Used by
    /// directory splits after the target acknowledges; duplicates from
    /// a replayed split are harmless because reads resolve by highest
    /// sequence.
    pub fn delete_range(&self, begin: &[u8], end: &[u8]) -> Result<u64> {
        let rows = self.shared.scan(begin, end, None)?;
        if rows.is_empty() {
            return Ok(0);
        }
        let count = rows.len() as u64;
        let mut batch = WriteBatch::new();
        for (k, _) in rows {
            batch.delete(&k);
        }
        self.shared.write(batch)?;
        Ok(count)
    }

    /// Install a pre-built sorted table directly at level 0, bypassing
    /// the WAL and memtable. The file at `external` is renamed into the
    /// data directory.
    pub fn ingest_table_file(&self, external: &Path) -> Result<u64> {
        self.shared.ingest_table_file(external)
    }

    /// Block until the live memtable (and any frozen one) is flushed.
    pub fn flush(&self) -> Result<()> {
        self.shared.flush()
    }

    /// Block until no background work is running or due.
    pub fn wait_idle(&self) -> Result<()> {
        self.shared.wait_idle()
    }

    /// Durably persist all previously written batches.
    pub fn sync_wal(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        match state.wal.as_mut() {
            Some(wal) => wal.sync(),
            None => Err(Error::io("engine is read-only")),
        }
    }

    pub fn last_sequence(&self) -> SequenceNo {
        self.shared.state.lock().versions.last_sequence
    }

    pub fn level0_files(&self) -> usize {
        self.shared.state.lock().versions.current().num_files(0)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.shared.options
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.work_cv.notify_all();
        if let Some(handle) = self.bg_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Shared {
    fn write(&self, mut batch: WriteBatch) -> Result<SequenceNo> {
        let mut state = self.state.lock();
        if batch.is_empty() {
            return Ok(state.versions.last_sequence);
        }
        self.make_room_for_write(&mut state)?;

        let seq = state.versions.last_sequence + 1;
        state.versions.last_sequence += batch.count() as u64;
        let last = state.versions.last_sequence;

        let record = batch.encode(seq).to_vec();
        let sync = self.options.sync_writes;
        let wal = state
            .wal
            .as_mut()
            .ok_or_else(|| Error::io("engine is read-only"))?;
        let wal_result = wal
            .add_record(&record)
            .and_then(|_| if sync { wal.sync() } else { wal.flush() });
        if let Err(e) = wal_result {
            // A failed WAL write is fatal to the batch and leaves the
            // engine read-only until reopened.
            state.bg_error = Some(format!("wal write: {e}"));
            error!("write-ahead log failure, engine now read-only: {e}");
            return Err(e);
        }

        batch.insert_into(seq, &state.mem)?;
        Ok(last)
    }

    fn make_room_for_write(&self, state: &mut MutexGuard<'_, EngineState>) -> Result<()> {
        let mut allow_delay = true;
        loop {
            if let Some(e) = &state.bg_error {
                return Err(Error::io(e.clone()));
            }
            let l0_files = state.versions.current().num_files(0);
            if allow_delay
                && l0_files >= self.options.l0_soft_limit
                && l0_files < self.options.l0_hard_limit
            {
                // Soft limit: shed a little write throughput so the
                // compactor can keep up.
                allow_delay = false;
                self.work_cv.notify_one();
                MutexGuard::unlocked(state, || {
                    std::thread::sleep(Duration::from_millis(1));
                });
                continue;
            }
            if state.mem.approximate_memory_usage() < self.options.write_buffer_size {
                return Ok(());
            }
            if state.imm.is_some() {
                // Previous rotation still flushing.
                self.work_cv.notify_one();
                self.done_cv.wait(state);
                continue;
            }
            if l0_files >= self.options.l0_hard_limit {
                debug!(l0_files, "stalling writer on level-0 hard limit");
                self.work_cv.notify_one();
                self.done_cv.wait(state);
                continue;
            }
            // Rotate: freeze the memtable and switch to a new WAL.
            let number = state.versions.new_file_number();
            let file = self.storage.new_writable(&log_file(&self.dir, number))?;
            state.wal = Some(LogWriter::new(file));
            state.wal_number = number;
            state.imm = Some(std::mem::replace(&mut state.mem, MemTable::new()));
            self.work_cv.notify_one();
        }
    }

    fn get(&self, user_key: &[u8], snapshot: Option<&Snapshot>) -> Result<Option<Vec<u8>>> {
        let (seq, mem, imm, version) = {
            let state = self.state.lock();
            (
                snapshot
                    .map(|s| s.sequence())
                    .unwrap_or(state.versions.last_sequence),
                state.mem.clone(),
                state.imm.clone(),
                state.versions.current(),
            )
        };

        match mem.get(user_key, seq) {
            MemGet::Found(v) => return Ok(Some(v)),
            MemGet::Deleted => return Ok(None),
            MemGet::NotPresent => {}
        }
        if let Some(imm) = imm {
            match imm.get(user_key, seq) {
                MemGet::Found(v) => return Ok(Some(v)),
                MemGet::Deleted => return Ok(None),
                MemGet::NotPresent => {}
            }
        }

        let target = key::lookup_key(user_key, seq);
        let mut first_charged: Option<(usize, Arc<FileMetaData>)> = None;
        let mut charged_reads = 0usize;
        let mut result = Ok(None);
        for (level, file) in version.files_for_get(user_key) {
            let table = self.table_cache.get(file.number, file.file_size)?;
            let (hit, charged) = table.get(&target)?;
            if charged {
                charged_reads += 1;
                if first_charged.is_none() {
                    first_charged = Some((level, file.clone()));
                }
            }
            if let Some((ikey, value)) = hit {
                if key::user_key(&ikey) == user_key {
                    match key::parse_tag(&ikey) {
                        Some((_, ValueKind::Value)) => {
                            result = Ok(Some(value));
                            break;
                        }
                        Some((_, ValueKind::Deletion)) => {
                            result = Ok(None);
                            break;
                        }
                        None => return Err(Error::corruption("bad internal key tag")),
                    }
                }
            }
        }

        // A lookup that burned more than one block read wasted a seek
        // on the first file; enough of those make it a compaction
        // victim.
        if charged_reads >= 2 {
            if let Some((level, file)) = first_charged {
                if file.charge_seek() {
                    let mut state = self.state.lock();
                    if state.pending_seek.is_none() {
                        debug!(file = file.number, level, "seek budget exhausted");
                        state.pending_seek = Some((level, file));
                        self.work_cv.notify_one();
                    }
                }
            }
        }
        result
    }

    fn iter(&self, snapshot: Option<&Snapshot>) -> Result<EngineIterator> {
        let (seq, children) = {
            let state = self.state.lock();
            let seq = snapshot
                .map(|s| s.sequence())
                .unwrap_or(state.versions.last_sequence);
            let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
            children.push(Box::new(state.mem.iter()) as Box<dyn InternalIterator>);
            if let Some(imm) = &state.imm {
                children.push(Box::new(imm.iter()));
            }
            let version = state.versions.current();
            // Newest L0 files first so merge ties resolve correctly.
            let mut l0 = version.files[0].clone();
            l0.sort_by(|a, b| b.number.cmp(&a.number));
            for f in l0 {
                let table = self.table_cache.get(f.number, f.file_size)?;
                children.push(Box::new(table.iter()));
            }
            for level in 1..NUM_LEVELS {
                if !version.files[level].is_empty() {
                    children.push(Box::new(LevelIterator::new(
                        self.table_cache.clone(),
                        version.files[level].clone(),
                    )));
                }
            }
            (seq, children)
        };
        let mut iter = EngineIterator {
            inner: MergingIterator::new(children),
            seq,
            current: None,
            seen_key: None,
        };
        iter.inner.seek_to_first()?;
        iter.advance_to_visible()?;
        Ok(iter)
    }

    fn scan(
        &self,
        begin: &[u8],
        end: &[u8],
        snapshot: Option<&Snapshot>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut iter = self.iter(snapshot)?;
        iter.seek(begin)?;
        let mut out = Vec::new();
        loop {
            let Some((k, v)) = iter.current() else { break };
            if k >= end {
                break;
            }
            let pair = (k.to_vec(), v.to_vec());
            out.push(pair);
            iter.advance()?;
        }
        Ok(out)
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.mem.is_empty() && state.imm.is_none() {
            let number = state.versions.new_file_number();
            let file = self.storage.new_writable(&log_file(&self.dir, number))?;
            state.wal = Some(LogWriter::new(file));
            state.wal_number = number;
            state.imm = Some(std::mem::replace(&mut state.mem, MemTable::new()));
            self.work_cv.notify_one();
        }
        while state.imm.is_some() && state.bg_error.is_none() {
            self.work_cv.notify_one();
            self.done_cv.wait(&mut state);
        }
        match &state.bg_error {
            Some(e) => Err(Error::io(e.clone())),
            None => Ok(()),
        }
    }

    fn wait_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if let Some(e) = &state.bg_error {
                return Err(Error::io(e.clone()));
            }
            let busy = state.imm.is_some()
                || state.compaction_running
                || state.pending_seek.is_some()
                || state.versions.needs_compaction();
            if !busy {
                return Ok(());
            }
            self.work_cv.notify_one();
            self.done_cv.wait(&mut state);
        }
    }

    fn ingest_table_file(&self, external: &Path) -> Result<u64> {
        let mut state = self.state.lock();
        if let Some(e) = &state.bg_error {
            return Err(Error::io(e.clone()));
        }
        let number = state.versions.new_file_number();
        let target = table_file(&self.dir, number);
        self.storage.rename(external, &target)?;
        let size = self.storage.file_size(&target)?;

        let table = self.table_cache.get(number, size)?;
        let mut iter = table.iter();
        iter.seek_to_first()?;
        if !iter.valid() {
            // An empty table adds nothing; drop it.
            self.table_cache.evict(number);
            self.storage.remove(&target)?;
            return Ok(number);
        }
        let smallest = iter.key().to_vec();
        let mut largest = smallest.clone();
        while iter.valid() {
            largest = iter.key().to_vec();
            iter.next()?;
        }

        let mut edit = VersionEdit::default();
        edit.add_file(0, number, size, smallest, largest);
        state.versions.log_and_apply(edit)?;
        info!(file = number, bytes = size, "ingested table at level 0");
        self.work_cv.notify_one();
        Ok(number)
    }

    // -----------------------------------------------------------------
    // Background work
    // -----------------------------------------------------------------

    fn background_loop(self: Arc<Self>) {
        loop {
            let work = {
                let mut state = self.state.lock();
                loop {
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    if state.bg_error.is_some() {
                        self.done_cv.notify_all();
                        self.work_cv.wait(&mut state);
                        continue;
                    }
                    if state.imm.is_some() {
                        break BackgroundWork::Flush;
                    }
                    if !self.options.disable_compaction {
                        let hint = state.pending_seek.take();
                        if hint.is_some() || state.versions.needs_compaction() {
                            if let Some(c) = state.versions.pick_compaction(hint) {
                                state.compaction_running = true;
                                break BackgroundWork::Compact(c);
                            }
                        }
                    }
                    self.done_cv.notify_all();
                    self.work_cv.wait(&mut state);
                }
            };

            let outcome = match work {
                BackgroundWork::Flush => self.compact_memtable(),
                BackgroundWork::Compact(c) => self.run_compaction(c),
            };

            let failed = {
                let mut state = self.state.lock();
                state.compaction_running = false;
                let failed = outcome.is_err();
                if let Err(e) = outcome {
                    warn!("background work failed, will retry: {e}");
                    // Source files are left intact; the next cycle
                    // retries unless the manifest itself failed.
                }
                self.done_cv.notify_all();
                failed
            };
            if failed {
                // Bounded backoff before retrying failed flush or
                // compaction work.
                std::thread::sleep(Duration::from_millis(100));
            }
            // Temps stay: a staged ingest may not be renamed in yet.
            self.remove_obsolete_files(false);
        }
    }

    /// Flush the frozen memtable into an L0 table.
    fn compact_memtable(&self) -> Result<()> {
        let (imm, number, wal_number) = {
            let mut state = self.state.lock();
            let Some(imm) = state.imm.clone() else {
                return Ok(());
            };
            (imm, state.versions.new_file_number(), state.wal_number)
        };

        let path = table_file(&self.dir, number);
        let mut builder =
            TableBuilder::new(self.storage.new_writable(&path)?, self.options.clone());
        let mut iter = imm.iter();
        iter.seek_to_first()?;
        let mut smallest: Option<Vec<u8>> = None;
        let mut largest: Vec<u8> = Vec::new();
        while iter.valid() {
            if smallest.is_none() {
                smallest = Some(iter.key().to_vec());
            }
            largest = iter.key().to_vec();
            builder.add(iter.key(), iter.value())?;
            iter.next()?;
        }
        let stats = builder.finish()?;

        let mut state = self.state.lock();
        let mut edit = VersionEdit::default();
        if let Some(smallest) = smallest {
            edit.add_file(0, number, stats.file_size, smallest, largest);
        }
        // Older WALs are fully covered by this flush.
        edit.set_log_number(wal_number);
        state.versions.log_and_apply(edit)?;
        state.imm = None;
        debug!(file = number, bytes = stats.file_size, "flushed memtable");
        Ok(())
    }

    fn run_compaction(&self, c: Compaction) -> Result<()> {
        if c.is_trivial_move() {
            let f = c.inputs[0][0].clone();
            let mut state = self.state.lock();
            let mut edit = VersionEdit::default();
            edit.delete_file(c.level, f.number);
            edit.add_file(
                c.output_level(),
                f.number,
                f.file_size,
                f.smallest.clone(),
                f.largest.clone(),
            );
            state.versions.log_and_apply(edit)?;
            debug!(
                file = f.number,
                from = c.level,
                to = c.output_level(),
                "trivial compaction move"
            );
            return Ok(());
        }

        let (smallest_snapshot, version_for_base) = {
            let state = self.state.lock();
            (
                self.snapshots
                    .oldest()
                    .unwrap_or(state.versions.last_sequence),
                state.versions.current(),
            )
        };

        // Merge inputs newest-shadowing-first: L0 files by number
        // descending, then the next level.
        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        if c.level == 0 {
            let mut l0 = c.inputs[0].clone();
            l0.sort_by(|a, b| b.number.cmp(&a.number));
            for f in &l0 {
                let table = self.table_cache.get(f.number, f.file_size)?;
                children.push(Box::new(table.iter()) as Box<dyn InternalIterator>);
            }
        } else {
            children.push(Box::new(LevelIterator::new(
                self.table_cache.clone(),
                c.inputs[0].clone(),
            )));
        }
        if !c.inputs[1].is_empty() {
            children.push(Box::new(LevelIterator::new(
                self.table_cache.clone(),
                c.inputs[1].clone(),
            )));
        }
        let mut iter = MergingIterator::new(children);
        if let Err(e) = iter.seek_to_first() {
            self.quarantine_inputs(&c, &e);
            return Err(e);
        }

        let mut outputs: Vec<(u64, u64, Vec<u8>, Vec<u8>)> = Vec::new();
        let mut builder: Option<(u64, TableBuilder, Vec<u8>, Vec<u8>)> = None;
        let mut current_user_key: Option<Vec<u8>> = None;
        let mut last_seq_for_key = SequenceNo::MAX;
        let mut dropped = 0u64;

        while iter.valid() {
            let ikey = iter.key().to_vec();
            let ukey = key::user_key(&ikey).to_vec();
            let (seq, kind) = key::parse_tag(&ikey)
                .ok_or_else(|| Error::corruption("bad key in compaction"))?;

            if current_user_key.as_deref() != Some(ukey.as_slice()) {
                current_user_key = Some(ukey.clone());
                last_seq_for_key = SequenceNo::MAX;
            }

            let drop_entry = if last_seq_for_key <= smallest_snapshot {
                // Shadowed by a newer entry every live snapshot can see.
                true
            } else {
                kind == ValueKind::Deletion
                    && seq <= smallest_snapshot
                    && version_for_base.is_base_level_for_key(c.output_level() + 1, &ukey)
            };
            last_seq_for_key = seq;

            if drop_entry {
                dropped += 1;
            } else {
                if builder.is_none() {
                    let number = {
                        let mut state = self.state.lock();
                        state.versions.new_file_number()
                    };
                    let file = self.storage.new_writable(&table_file(&self.dir, number))?;
                    builder = Some((
                        number,
                        TableBuilder::new(file, self.options.clone()),
                        ikey.clone(),
                        Vec::new(),
                    ));
                }
                let entry = builder.as_mut().unwrap();
                entry.1.add(&ikey, iter.value())?;
                entry.3 = ikey.clone();
                if entry.1.file_size() >= MAX_OUTPUT_FILE_BYTES {
                    let (number, b, smallest, largest) = builder.take().unwrap();
                    let stats = b.finish()?;
                    outputs.push((number, stats.file_size, smallest, largest));
                }
            }

            if let Err(e) = iter.next() {
                self.quarantine_inputs(&c, &e);
                return Err(e);
            }
        }
        if let Some((number, b, smallest, largest)) = builder.take() {
            let stats = b.finish()?;
            outputs.push((number, stats.file_size, smallest, largest));
        }

        let input0_largest = c.inputs[0]
            .iter()
            .map(|f| f.largest.clone())
            .max()
            .unwrap_or_default();

        let mut state = self.state.lock();
        let mut edit = VersionEdit::default();
        edit.set_compact_pointer(c.level, input0_largest);
        for f in &c.inputs[0] {
            edit.delete_file(c.level, f.number);
        }
        for f in &c.inputs[1] {
            edit.delete_file(c.output_level(), f.number);
        }
        for (number, size, smallest, largest) in &outputs {
            edit.add_file(
                c.output_level(),
                *number,
                *size,
                smallest.clone(),
                largest.clone(),
            );
        }
        state.versions.log_and_apply(edit)?;
        info!(
            level = c.level,
            inputs = c.num_input_files(),
            outputs = outputs.len(),
            dropped,
            "compaction installed"
        );
        Ok(())
    }

    /// Remove a corrupt input from the live version so reads stop
    /// hitting it; the data is left on disk for operator recovery.
    fn quarantine_inputs(&self, c: &Compaction, cause: &Error) {
        if !cause.is_corruption() {
            return;
        }
        let mut state = self.state.lock();
        let mut edit = VersionEdit::default();
        for f in &c.inputs[0] {
            edit.delete_file(c.level, f.number);
        }
        for f in &c.inputs[1] {
            edit.delete_file(c.output_level(), f.number);
        }
        if let Err(e) = state.versions.log_and_apply(edit) {
            state.bg_error = Some(format!("quarantine failed: {e}"));
            return;
        }
        error!("quarantined corrupt table files after: {cause}");
    }

    /// Delete files no version references: old WALs, dropped tables,
    /// and (at open only) orphaned temporaries.
    fn remove_obsolete_files(&self, include_temps: bool) {
        let (live, log_number, wal_number, manifest_keep) = {
            let state = self.state.lock();
            (
                state.versions.live_files(),
                state.versions.log_number,
                state.wal_number,
                state.versions.manifest_number(),
            )
        };
        let Ok(names) = self.storage.list(&self.dir) else {
            return;
        };
        for name in names {
            let keep = match parse_file_name(&name) {
                Some(FileKind::Current) | Some(FileKind::Lock) => true,
                Some(FileKind::Manifest(n)) => n == manifest_keep,
                Some(FileKind::WriteAheadLog(n)) => n >= log_number || n == wal_number,
                Some(FileKind::Table(n)) => {
                    let live_file = live.contains(&n);
                    if !live_file {
                        self.table_cache.evict(n);
                    }
                    live_file
                }
                Some(FileKind::Temp(_)) => !include_temps,
                None => true,
            };
            if !keep {
                let path = self.dir.join(&name);
                if self.storage.remove(&path).is_ok() {
                    debug!(file = %name, "removed obsolete file");
                }
            }
        }
    }
}

enum BackgroundWork {
    Flush,
    Compact(Compaction),
}

/// Replay WAL files newer than the manifest's log number into a fresh
/// L0 table; returns the number of records applied and fills `edit`
/// with the resulting file.
fn replay_wal_files(
    storage: &Arc<dyn Storage>,
    dir: &Path,
    options: &EngineOptions,
    versions: &mut VersionSet,
    edit: &mut VersionEdit,
) -> Result<u64> {
    let mut logs: Vec<u64> = storage
        .list(dir)?
        .into_iter()
        .filter_map(|n| match parse_file_name(&n) {
            Some(FileKind::WriteAheadLog(num)) if num >= versions.log_number => Some(num),
            _ => None,
        })
        .collect();
    logs.sort_unstable();

    let mem = MemTable::new();
    let mut records = 0u64;
    for number in &logs {
        versions.mark_file_number_used(*number);
        let mut reader = LogReader::new(storage.new_sequential(&log_file(dir, *number))?);
        while let Some(record) = reader.read_record()? {
            let (batch, seq) = WriteBatch::decode(&record)?;
            batch.insert_into(seq, &mem)?;
            let last = seq + batch.count() as u64 - 1;
            if last > versions.last_sequence {
                versions.last_sequence = last;
            }
            records += 1;
        }
        if let Some(why) = reader.corruption() {
            // A torn tail marks the WAL-sync frontier: rows past it
            // never reached durability and are dropped.
            warn!(log = number, "write-ahead log ends early: {why}");
            break;
        }
    }

    if !mem.is_empty() {
        let number = versions.new_file_number();
        let path = table_file(dir, number);
        let mut builder = TableBuilder::new(storage.new_writable(&path)?, options.clone());
        let mut iter = mem.iter();
        iter.seek_to_first()?;
        let mut smallest: Option<Vec<u8>> = None;
        let mut largest = Vec::new();
        while iter.valid() {
            if smallest.is_none() {
                smallest = Some(iter.key().to_vec());
            }
            largest = iter.key().to_vec();
            builder.add(iter.key(), iter.value())?;
            iter.next()?;
        }
        let stats = builder.finish()?;
        edit.add_file(0, number, stats.file_size, smallest.unwrap(), largest);
    }
    Ok(records)
}

/// User-level cursor: resolves internal entries into the newest visible
/// row per key, skipping tombstones, at a fixed snapshot.
pub struct EngineIterator {
    inner: MergingIterator,
    seq: SequenceNo,
    current: Option<(Vec<u8>, Vec<u8>)>,
    seen_key: Option<Vec<u8>>,
}

impl EngineIterator {
    pub fn current(&self) -> Option<(&[u8], &[u8])> {
        self.current
            .as_ref()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn seek(&mut self, user_key: &[u8]) -> Result<()> {
        self.seen_key = None;
        self.current = None;
        self.inner.seek(&key::lookup_key(user_key, self.seq))?;
        self.advance_to_visible()
    }

    pub fn advance(&mut self) -> Result<()> {
        self.inner.next()?;
        self.advance_to_visible()
    }

    fn advance_to_visible(&mut self) -> Result<()> {
        self.current = None;
        while self.inner.valid() {
            let Some((seq, kind)) = key::parse_tag(self.inner.key()) else {
                return Err(Error::corruption("bad internal key"));
            };
            if seq > self.seq {
                self.inner.next()?;
                continue;
            }
            let ukey = key::user_key(self.inner.key());
            if self.seen_key.as_deref() == Some(ukey) {
                // An older shadowed entry of a key already resolved.
                self.inner.next()?;
                continue;
            }
            self.seen_key = Some(ukey.to_vec());
            match kind {
                ValueKind::Deletion => {
                    self.inner.next()?;
                    continue;
                }
                ValueKind::Value => {
                    let ukey = ukey.to_vec();
                    let value = self.inner.value().to_vec();
                    self.current = Some((ukey, value));
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}
