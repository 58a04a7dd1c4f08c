//! Versions and version edits
//!
//! The set of live table files per level is described by a monotone log
//! of `VersionEdit` records; replaying the log rebuilds the current
//! `Version`. Reads resolve against an immutable `Version`, so writers
//! install a new one without blocking readers.

use crate::coding::{get_length_prefixed, get_varint32, get_varint64, put_length_prefixed, put_varint32, put_varint64};
use crate::iterator::InternalIterator;
use crate::key::{self, ValueKind};
use crate::table_cache::TableCache;
use shardfs_common::{Error, Result, SequenceNo};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub const NUM_LEVELS: usize = 7;

/// Base byte budget for level 1; level k holds factor^(k-1) times this.
const LEVEL_BASE_BYTES: u64 = 10 * 1024 * 1024;

/// A live table file
#[derive(Debug)]
pub struct FileMetaData {
    pub number: u64,
    pub file_size: u64,
    /// Smallest internal key in the file
    pub smallest: Vec<u8>,
    /// Largest internal key in the file
    pub largest: Vec<u8>,
    /// Seeks this file may absorb before becoming a compaction victim
    pub allowed_seeks: AtomicI64,
}

impl FileMetaData {
    pub fn new(number: u64, file_size: u64, smallest: Vec<u8>, largest: Vec<u8>) -> Arc<Self> {
        // One seek costs roughly a 16 KiB read's worth of compaction
        // work; floor keeps tiny files from thrashing.
        let allowed = ((file_size / 16384) as i64).max(100);
        Arc::new(Self {
            number,
            file_size,
            smallest,
            largest,
            allowed_seeks: AtomicI64::new(allowed),
        })
    }

    /// Charge one wasted seek; true when the file should be compacted.
    pub fn charge_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, Ordering::Relaxed) <= 1
    }
}

/// Tags for the manifest record encoding
mod tag {
    pub const LOG_NUMBER: u32 = 2;
    pub const NEXT_FILE_NUMBER: u32 = 3;
    pub const LAST_SEQUENCE: u32 = 4;
    pub const COMPACT_POINTER: u32 = 5;
    pub const DELETED_FILE: u32 = 6;
    pub const NEW_FILE: u32 = 7;
}

/// A delta to the file set: the manifest is a log of these.
#[derive(Clone, Debug, Default)]
pub struct VersionEdit {
    pub log_number: Option<u64>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<SequenceNo>,
    pub compact_pointers: Vec<(usize, Vec<u8>)>,
    pub deleted_files: Vec<(usize, u64)>,
    pub new_files: Vec<(usize, u64, u64, Vec<u8>, Vec<u8>)>,
}

impl VersionEdit {
    pub fn set_log_number(&mut self, n: u64) {
        self.log_number = Some(n);
    }

    pub fn set_next_file_number(&mut self, n: u64) {
        self.next_file_number = Some(n);
    }

    pub fn set_last_sequence(&mut self, s: SequenceNo) {
        self.last_sequence = Some(s);
    }

    pub fn set_compact_pointer(&mut self, level: usize, key: Vec<u8>) {
        self.compact_pointers.push((level, key));
    }

    pub fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: Vec<u8>,
        largest: Vec<u8>,
    ) {
        self.new_files
            .push((level, number, file_size, smallest, largest));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(n) = self.log_number {
            put_varint32(&mut out, tag::LOG_NUMBER);
            put_varint64(&mut out, n);
        }
        if let Some(n) = self.next_file_number {
            put_varint32(&mut out, tag::NEXT_FILE_NUMBER);
            put_varint64(&mut out, n);
        }
        if let Some(s) = self.last_sequence {
            put_varint32(&mut out, tag::LAST_SEQUENCE);
            put_varint64(&mut out, s);
        }
        for (level, key) in &self.compact_pointers {
            put_varint32(&mut out, tag::COMPACT_POINTER);
            put_varint32(&mut out, *level as u32);
            put_length_prefixed(&mut out, key);
        }
        for (level, number) in &self.deleted_files {
            put_varint32(&mut out, tag::DELETED_FILE);
            put_varint32(&mut out, *level as u32);
            put_varint64(&mut out, *number);
        }
        for (level, number, size, smallest, largest) in &self.new_files {
            put_varint32(&mut out, tag::NEW_FILE);
            put_varint32(&mut out, *level as u32);
            put_varint64(&mut out, *number);
            put_varint64(&mut out, *size);
            put_length_prefixed(&mut out, smallest);
            put_length_prefixed(&mut out, largest);
        }
        out
    }

    pub fn decode(record: &[u8]) -> Result<Self> {
        let mut edit = Self::default();
        let mut src = record;
        while !src.is_empty() {
            let t = get_varint32(&mut src)?;
            match t {
                tag::LOG_NUMBER => edit.log_number = Some(get_varint64(&mut src)?),
                tag::NEXT_FILE_NUMBER => edit.next_file_number = Some(get_varint64(&mut src)?),
                tag::LAST_SEQUENCE => edit.last_sequence = Some(get_varint64(&mut src)?),
                tag::COMPACT_POINTER => {
                    let level = get_varint32(&mut src)? as usize;
                    let key = get_length_prefixed(&mut src)?.to_vec();
                    check_level(level)?;
                    edit.compact_pointers.push((level, key));
                }
                tag::DELETED_FILE => {
                    let level = get_varint32(&mut src)? as usize;
                    let number = get_varint64(&mut src)?;
                    check_level(level)?;
                    edit.deleted_files.push((level, number));
                }
                tag::NEW_FILE => {
                    let level = get_varint32(&mut src)? as usize;
                    let number = get_varint64(&mut src)?;
                    let size = get_varint64(&mut src)?;
                    let smallest = get_length_prefixed(&mut src)?.to_vec();
                    let largest = get_length_prefixed(&mut src)?.to_vec();
                    check_level(level)?;
                    edit.new_files.push((level, number, size, smallest, largest));
                }
                other => {
                    return Err(Error::corruption(format!(
                        "unknown version edit tag {other}"
                    )))
                }
            }
        }
        Ok(edit)
    }
}

fn check_level(level: usize) -> Result<()> {
    if level >= NUM_LEVELS {
        return Err(Error::corruption("version edit level out of range"));
    }
    Ok(())
}

/// An immutable view of the live file set.
#[derive(Default)]
pub struct Version {
    /// Per level, files sorted by smallest key; L0 sorted newest first.
    pub files: Vec<Vec<Arc<FileMetaData>>>,
}

impl Version {
    pub fn empty() -> Arc<Version> {
        Arc::new(Version {
            files: vec![Vec::new(); NUM_LEVELS],
        })
    }

    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        self.files[level].iter().map(|f| f.file_size).sum()
    }

    /// Files a point lookup for `user_key` must consult, newest first.
    pub fn files_for_get(&self, user_key: &[u8]) -> Vec<(usize, Arc<FileMetaData>)> {
        let mut out = Vec::new();
        // L0 files may overlap each other: take every cover, newest
        // (highest number) first.
        let mut l0: Vec<_> = self.files[0]
            .iter()
            .filter(|f| {
                user_key >= key::user_key(&f.smallest) && user_key <= key::user_key(&f.largest)
            })
            .cloned()
            .collect();
        l0.sort_by(|a, b| b.number.cmp(&a.number));
        out.extend(l0.into_iter().map(|f| (0, f)));

        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            if files.is_empty() {
                continue;
            }
            // Files are disjoint and sorted: binary search on largest.
            let idx = files.partition_point(|f| key::user_key(&f.largest) < user_key);
            if idx < files.len() && user_key >= key::user_key(&files[idx].smallest) {
                out.push((level, files[idx].clone()));
            }
        }
        out
    }

    /// Files in `level` overlapping the user-key range [begin, end].
    pub fn overlapping_inputs(
        &self,
        level: usize,
        begin: &[u8],
        end: &[u8],
    ) -> Vec<Arc<FileMetaData>> {
        let mut out = Vec::new();
        for f in &self.files[level] {
            let f_small = key::user_key(&f.smallest);
            let f_large = key::user_key(&f.largest);
            if f_large < begin || f_small > end {
                continue;
            }
            out.push(f.clone());
        }
        out
    }

    /// True when nothing at `level` or deeper may hold `user_key`; lets
    /// compaction drop tombstones at the bottom of the overlap.
    pub fn is_base_level_for_key(&self, from_level: usize, user_key: &[u8]) -> bool {
        for level in from_level..NUM_LEVELS {
            for f in &self.files[level] {
                if user_key >= key::user_key(&f.smallest) && user_key <= key::user_key(&f.largest)
                {
                    return false;
                }
            }
        }
        true
    }
}

/// Byte budget for a level.
pub fn max_bytes_for_level(level: usize, level_factor: u64) -> u64 {
    let mut bytes = LEVEL_BASE_BYTES;
    for _ in 1..level.max(1) {
        bytes = bytes.saturating_mul(level_factor);
    }
    bytes
}

/// Cursor over one sorted level: opens each file through the cache as
/// the cursor crosses file boundaries.
pub struct LevelIterator {
    cache: Arc<TableCache>,
    files: Vec<Arc<FileMetaData>>,
    index: usize,
    table_iter: Option<Box<dyn InternalIterator>>,
}

impl LevelIterator {
    pub fn new(cache: Arc<TableCache>, files: Vec<Arc<FileMetaData>>) -> Self {
        Self {
            cache,
            files,
            index: 0,
            table_iter: None,
        }
    }

    fn open_current(&mut self) -> Result<()> {
        if self.index >= self.files.len() {
            self.table_iter = None;
            return Ok(());
        }
        let f = &self.files[self.index];
        let table = self.cache.get(f.number, f.file_size)?;
        self.table_iter = Some(Box::new(table.iter()));
        Ok(())
    }

    fn advance_past_empty(&mut self) -> Result<()> {
        loop {
            match &self.table_iter {
                Some(iter) if iter.valid() => return Ok(()),
                _ => {
                    self.index += 1;
                    if self.index >= self.files.len() {
                        self.table_iter = None;
                        return Ok(());
                    }
                    self.open_current()?;
                    if let Some(iter) = self.table_iter.as_mut() {
                        iter.seek_to_first()?;
                    }
                }
            }
        }
    }
}

impl InternalIterator for LevelIterator {
    fn valid(&self) -> bool {
        self.table_iter.as_ref().is_some_and(|i| i.valid())
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.index = 0;
        self.open_current()?;
        if let Some(iter) = self.table_iter.as_mut() {
            iter.seek_to_first()?;
        }
        self.advance_past_empty()
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        // Find the first file whose largest key admits the target.
        self.index = self
            .files
            .partition_point(|f| f.largest.as_slice() < target);
        self.open_current()?;
        if let Some(iter) = self.table_iter.as_mut() {
            iter.seek(target)?;
        }
        self.advance_past_empty()
    }

    fn next(&mut self) -> Result<()> {
        if let Some(iter) = self.table_iter.as_mut() {
            iter.next()?;
        }
        self.advance_past_empty()
    }

    fn key(&self) -> &[u8] {
        self.table_iter
            .as_ref()
            .expect("iterator not positioned")
            .key()
    }

    fn value(&self) -> &[u8] {
        self.table_iter
            .as_ref()
            .expect("iterator not positioned")
            .value()
    }
}

/// Decide whether a key is still visible given the newest shadowing
/// entry already emitted for the same user key.
pub fn visible_kind(k: &[u8]) -> Option<(SequenceNo, ValueKind)> {
    key::parse_tag(k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_roundtrip() {
        let mut edit = VersionEdit::default();
        edit.set_log_number(4);
        edit.set_next_file_number(9);
        edit.set_last_sequence(1234);
        edit.set_compact_pointer(2, b"ptr".to_vec());
        edit.delete_file(1, 7);
        edit.add_file(0, 8, 4096, b"aaa".to_vec(), b"zzz".to_vec());

        let bytes = edit.encode();
        let back = VersionEdit::decode(&bytes).unwrap();
        assert_eq!(back.log_number, Some(4));
        assert_eq!(back.next_file_number, Some(9));
        assert_eq!(back.last_sequence, Some(1234));
        assert_eq!(back.compact_pointers, vec![(2usize, b"ptr".to_vec())]);
        assert_eq!(back.deleted_files, vec![(1usize, 7u64)]);
        assert_eq!(back.new_files.len(), 1);
        assert_eq!(back.new_files[0].1, 8);
    }

    #[test]
    fn test_edit_rejects_bad_level() {
        let mut edit = VersionEdit::default();
        edit.delete_file(NUM_LEVELS, 1);
        let bytes = edit.encode();
        assert!(VersionEdit::decode(&bytes).is_err());
    }

    #[test]
    fn test_level_budget_grows_by_factor() {
        assert_eq!(max_bytes_for_level(1, 10), LEVEL_BASE_BYTES);
        assert_eq!(max_bytes_for_level(2, 10), LEVEL_BASE_BYTES * 10);
        assert_eq!(max_bytes_for_level(3, 10), LEVEL_BASE_BYTES * 100);
    }

    #[test]
    fn test_files_for_get_l0_newest_first() {
        use crate::key::{entry_key, internal_key};
        use shardfs_common::{DirId, NameHash};

        let ukey = entry_key(DirId::new(0, 1), &NameHash::of("a"));
        let small = internal_key(&ukey, 9, ValueKind::Value);
        let large = internal_key(&ukey, 1, ValueKind::Value);

        let mut version = Version {
            files: vec![Vec::new(); NUM_LEVELS],
        };
        version.files[0].push(FileMetaData::new(3, 100, small.clone(), large.clone()));
        version.files[0].push(FileMetaData::new(8, 100, small.clone(), large.clone()));

        let hits = version.files_for_get(&ukey);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].1.number, 8);
        assert_eq!(hits[1].1.number, 3);
    }

    #[test]
    fn test_seek_charge_trips_after_budget() {
        let f = FileMetaData::new(1, 0, vec![], vec![]);
        // The floor is 100 allowed seeks.
        for _ in 0..99 {
            assert!(!f.charge_seek());
        }
        assert!(f.charge_seek());
    }
}
