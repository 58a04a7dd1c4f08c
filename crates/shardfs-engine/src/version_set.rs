//! The version set: manifest bookkeeping and compaction picking
//!
//! Owns the current `Version`, the manifest log, and the counters
//! (next file number, last sequence, live WAL number). All mutation
//! happens under the engine mutex; readers clone the current version's
//! `Arc` and resolve against it lock-free.

use crate::filenames::{current_file, manifest_file};
use crate::key;
use crate::log::{LogReader, LogWriter};
use crate::storage::{read_file_to_vec, write_string_atomic, Storage};
use crate::table_cache::TableCache;
use crate::version::{
    max_bytes_for_level, FileMetaData, Version, VersionEdit, NUM_LEVELS,
};
use shardfs_common::{EngineOptions, Error, Result, SequenceNo};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub struct VersionSet {
    storage: Arc<dyn Storage>,
    dir: PathBuf,
    options: EngineOptions,
    pub table_cache: Arc<TableCache>,

    current: Arc<Version>,
    manifest_log: Option<LogWriter>,
    manifest_number: u64,
    next_file_number: u64,
    pub last_sequence: SequenceNo,
    /// WAL file whose contents are not yet reflected in table files.
    pub log_number: u64,
    compact_pointer: Vec<Vec<u8>>,
}

impl VersionSet {
    pub fn new(
        storage: Arc<dyn Storage>,
        dir: PathBuf,
        options: EngineOptions,
        table_cache: Arc<TableCache>,
    ) -> Self {
        Self {
            storage,
            dir,
            options,
            table_cache,
            current: Version::empty(),
            manifest_log: None,
            manifest_number: 0,
            next_file_number: 2,
            last_sequence: 0,
            log_number: 0,
            compact_pointer: vec![Vec::new(); NUM_LEVELS],
        }
    }

    pub fn current(&self) -> Arc<Version> {
        self.current.clone()
    }

    pub fn manifest_number(&self) -> u64 {
        self.manifest_number
    }

    pub fn new_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    /// Initialize a fresh data directory: an empty manifest plus the
    /// CURRENT pointer.
    pub fn create_new(&mut self) -> Result<()> {
        self.manifest_number = self.new_file_number();
        let mut edit = VersionEdit::default();
        edit.set_log_number(self.log_number);
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let path = manifest_file(&self.dir, self.manifest_number);
        let mut writer = LogWriter::new(self.storage.new_writable(&path)?);
        writer.add_record(&edit.encode())?;
        writer.sync()?;
        self.manifest_log = Some(writer);
        self.install_current_pointer()?;
        info!(manifest = self.manifest_number, "initialized data directory");
        Ok(())
    }

    /// Reconstruct the current version by replaying the live manifest.
    pub fn recover(&mut self) -> Result<()> {
        let (manifest_number, records) = self.read_manifest()?;
        self.manifest_number = manifest_number;

        let mut version = Version {
            files: vec![Vec::new(); NUM_LEVELS],
        };
        for record in records {
            let edit = VersionEdit::decode(&record)?;
            self.apply_edit_to(&edit, &mut version)?;
        }
        finalize_version(&mut version);
        self.current = Arc::new(version);

        // Resume appending to the recovered manifest.
        let path = manifest_file(&self.dir, self.manifest_number);
        let len = self.storage.file_size(&path)?;
        let file = self.storage.new_appendable(&path)?;
        self.manifest_log = Some(LogWriter::with_offset(file, len));
        self.mark_file_number_used(self.manifest_number);
        debug!(
            manifest = self.manifest_number,
            last_sequence = self.last_sequence,
            "recovered version state"
        );
        Ok(())
    }

    fn read_manifest(&self) -> Result<(u64, Vec<Vec<u8>>)> {
        let current = read_file_to_vec(self.storage.as_ref(), &current_file(&self.dir))?;
        let name = std::str::from_utf8(&current)
            .map_err(|_| Error::corruption("CURRENT is not utf-8"))?
            .trim_end();
        let number = name
            .strip_prefix("MANIFEST-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| Error::corruption("CURRENT does not name a manifest"))?;
        let path = self.dir.join(name);
        let mut reader = LogReader::new(self.storage.new_sequential(&path)?);
        let records = crate::log::read_all(&mut reader)?;
        Ok((number, records))
    }

    fn apply_edit_to(&mut self, edit: &VersionEdit, version: &mut Version) -> Result<()> {
        if let Some(n) = edit.log_number {
            self.log_number = n;
        }
        if let Some(n) = edit.next_file_number {
            self.mark_file_number_used(n.saturating_sub(1));
        }
        if let Some(s) = edit.last_sequence {
            self.last_sequence = s;
        }
        for (level, ptr) in &edit.compact_pointers {
            self.compact_pointer[*level] = ptr.clone();
        }
        for (level, number) in &edit.deleted_files {
            version.files[*level].retain(|f| f.number != *number);
        }
        for (level, number, size, smallest, largest) in &edit.new_files {
            self.mark_file_number_used(*number);
            version.files[*level].push(FileMetaData::new(
                *number,
                *size,
                smallest.clone(),
                largest.clone(),
            ));
        }
        Ok(())
    }

    /// Append an edit to the manifest, sync it, and install the
    /// resulting version. The manifest is only edited after table files
    /// referenced by the edit are durably synced.
    pub fn log_and_apply(&mut self, mut edit: VersionEdit) -> Result<()> {
        if edit.log_number.is_none() {
            edit.set_log_number(self.log_number);
        }
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let mut version = clone_version(&self.current);
        self.apply_edit_to(&edit, &mut version)?;
        finalize_version(&mut version);

        let writer = self
            .manifest_log
            .as_mut()
            .ok_or_else(|| Error::AssertionFailed("manifest not open".to_string()))?;
        writer.add_record(&edit.encode())?;
        writer.sync()?;

        self.current = Arc::new(version);
        Ok(())
    }

    fn install_current_pointer(&self) -> Result<()> {
        write_string_atomic(
            self.storage.as_ref(),
            &current_file(&self.dir),
            &format!("MANIFEST-{:06}\n", self.manifest_number),
        )
    }

    /// File numbers referenced by the live version.
    pub fn live_files(&self) -> std::collections::HashSet<u64> {
        let mut live = std::collections::HashSet::new();
        for level in &self.current.files {
            for f in level {
                live.insert(f.number);
            }
        }
        live
    }

    // -----------------------------------------------------------------
    // Compaction picking
    // -----------------------------------------------------------------

    /// Size-based pressure per level; >= 1.0 means compaction is due.
    fn compaction_score(&self) -> (f64, usize) {
        let mut best = (0.0f64, 0usize);
        let l0 = self.current.num_files(0) as f64 / self.options.l0_soft_limit as f64;
        if l0 > best.0 {
            best = (l0, 0);
        }
        for level in 1..NUM_LEVELS - 1 {
            let score = self.current.level_bytes(level) as f64
                / max_bytes_for_level(level, self.options.level_factor) as f64;
            if score > best.0 {
                best = (score, level);
            }
        }
        best
    }

    pub fn needs_compaction(&self) -> bool {
        !self.options.disable_compaction && self.compaction_score().0 >= 1.0
    }

    /// Choose the next compaction, preferring size pressure and falling
    /// back to a seek-triggered victim.
    pub fn pick_compaction(
        &mut self,
        seek_hint: Option<(usize, Arc<FileMetaData>)>,
    ) -> Option<Compaction> {
        let (score, level) = self.compaction_score();
        let (level, seed) = if score >= 1.0 {
            // Round-robin within the level via the compaction pointer.
            let files = &self.current.files[level];
            let ptr = &self.compact_pointer[level];
            let seed = files
                .iter()
                .find(|f| ptr.is_empty() || f.largest.as_slice() > ptr.as_slice())
                .or_else(|| files.first())?
                .clone();
            (level, seed)
        } else if let Some((level, file)) = seek_hint {
            // Only valid while the file is still live at that level.
            if !self.current.files[level].iter().any(|f| f.number == file.number) {
                return None;
            }
            (level, file)
        } else {
            return None;
        };

        let mut inputs0 = vec![seed.clone()];
        if level == 0 {
            // L0 files overlap each other: widen to every file touching
            // the seed's range.
            let begin = key::user_key(&seed.smallest).to_vec();
            let end = key::user_key(&seed.largest).to_vec();
            inputs0 = self.current.overlapping_inputs(0, &begin, &end);
        }

        let (begin, end) = key_range(&inputs0);
        let inputs1 = if level + 1 < NUM_LEVELS {
            self.current.overlapping_inputs(level + 1, &begin, &end)
        } else {
            Vec::new()
        };

        Some(Compaction {
            level,
            inputs: [inputs0, inputs1],
        })
    }

    pub fn compact_pointer_edit(&self, level: usize, largest: &[u8]) -> (usize, Vec<u8>) {
        (level, largest.to_vec())
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }
}

/// One unit of background merge work.
pub struct Compaction {
    /// Source level; outputs land at `level + 1`.
    pub level: usize,
    pub inputs: [Vec<Arc<FileMetaData>>; 2],
}

impl Compaction {
    pub fn num_input_files(&self) -> usize {
        self.inputs[0].len() + self.inputs[1].len()
    }

    /// A single input with nothing to merge below can simply move down.
    pub fn is_trivial_move(&self) -> bool {
        self.inputs[0].len() == 1 && self.inputs[1].is_empty()
    }

    pub fn output_level(&self) -> usize {
        (self.level + 1).min(NUM_LEVELS - 1)
    }
}

fn key_range(files: &[Arc<FileMetaData>]) -> (Vec<u8>, Vec<u8>) {
    let mut begin: &[u8] = &[];
    let mut end: &[u8] = &[];
    for (i, f) in files.iter().enumerate() {
        if i == 0 {
            begin = key::user_key(&f.smallest);
            end = key::user_key(&f.largest);
        } else {
            if key::user_key(&f.smallest) < begin {
                begin = key::user_key(&f.smallest);
            }
            if key::user_key(&f.largest) > end {
                end = key::user_key(&f.largest);
            }
        }
    }
    (begin.to_vec(), end.to_vec())
}

fn clone_version(v: &Version) -> Version {
    Version {
        files: v.files.clone(),
    }
}

/// Sort invariants: L0 by file number ascending, deeper levels by
/// smallest key.
fn finalize_version(v: &mut Version) {
    v.files[0].sort_by_key(|f| f.number);
    for level in 1..NUM_LEVELS {
        v.files[level].sort_by(|a, b| a.smallest.cmp(&b.smallest));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    fn new_set(storage: Arc<MemStorage>) -> VersionSet {
        let dir = PathBuf::from("/db");
        let options = EngineOptions::default();
        let cache = Arc::new(TableCache::new(
            storage.clone(),
            dir.clone(),
            options.clone(),
        ));
        VersionSet::new(storage, dir, options, cache)
    }

    fn ik(name: &str, seq: u64) -> Vec<u8> {
        use crate::key::{entry_key, internal_key, ValueKind};
        use shardfs_common::{DirId, NameHash};
        internal_key(
            &entry_key(DirId::new(0, 1), &NameHash::of(name)),
            seq,
            ValueKind::Value,
        )
    }

    #[test]
    fn test_create_then_recover() {
        let storage = MemStorage::new();
        {
            let mut set = new_set(storage.clone());
            set.create_new().unwrap();

            let mut edit = VersionEdit::default();
            edit.add_file(0, 9, 1234, ik("a", 5), ik("z", 1));
            set.mark_file_number_used(9);
            set.last_sequence = 42;
            set.log_and_apply(edit).unwrap();
        }
        {
            let mut set = new_set(storage.clone());
            set.recover().unwrap();
            assert_eq!(set.last_sequence, 42);
            assert_eq!(set.current().num_files(0), 1);
            assert!(set.next_file_number > 9);
        }
    }

    #[test]
    fn test_recover_applies_deletes() {
        let storage = MemStorage::new();
        {
            let mut set = new_set(storage.clone());
            set.create_new().unwrap();
            let mut add = VersionEdit::default();
            add.add_file(1, 5, 100, ik("a", 9), ik("m", 1));
            add.add_file(1, 6, 100, ik("n", 9), ik("z", 1));
            set.log_and_apply(add).unwrap();

            let mut del = VersionEdit::default();
            del.delete_file(1, 5);
            set.log_and_apply(del).unwrap();
        }
        let mut set = new_set(storage);
        set.recover().unwrap();
        assert_eq!(set.current().num_files(1), 1);
        assert_eq!(set.current().files[1][0].number, 6);
    }

    #[test]
    fn test_missing_current_is_not_found() {
        let storage = MemStorage::new();
        let mut set = new_set(storage);
        assert!(set.recover().unwrap_err().is_not_found());
    }

    #[test]
    fn test_l0_pressure_triggers_compaction() {
        let storage = MemStorage::new();
        let mut set = new_set(storage);
        set.create_new().unwrap();
        let mut edit = VersionEdit::default();
        for i in 0..set.options().l0_soft_limit as u64 {
            edit.add_file(0, 10 + i, 100, ik("a", 5), ik("z", 1));
        }
        set.log_and_apply(edit).unwrap();
        assert!(set.needs_compaction());

        let c = set.pick_compaction(None).unwrap();
        assert_eq!(c.level, 0);
        // All overlapping L0 files join the compaction.
        assert_eq!(c.inputs[0].len(), set.options().l0_soft_limit);
    }

    #[test]
    fn test_seek_hint_used_when_no_pressure() {
        let storage = MemStorage::new();
        let mut set = new_set(storage);
        set.create_new().unwrap();
        let mut edit = VersionEdit::default();
        edit.add_file(1, 5, 100, ik("a", 9), ik("m", 1));
        set.log_and_apply(edit).unwrap();

        assert!(!set.needs_compaction());
        let file = set.current().files[1][0].clone();
        let c = set.pick_compaction(Some((1, file))).unwrap();
        assert_eq!(c.level, 1);
        assert!(c.is_trivial_move());
    }
}
