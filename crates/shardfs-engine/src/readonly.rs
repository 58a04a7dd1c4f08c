//! Read-only replica engine
//!
//! Opens another engine's data directory without the lock, the WAL, or
//! a memtable, and tails the manifest for new version edits. Reads are
//! eventually consistent with the primary: `reload` picks up whatever
//! edits the primary has synced since the last call. Writes are
//! rejected.

use crate::filenames::current_file;
use crate::iterator::{InternalIterator, MergingIterator};
use crate::key::{self, ValueKind};
use crate::log::LogReader;
use crate::storage::{read_file_to_vec, Storage};
use crate::table_cache::TableCache;
use crate::version::{LevelIterator, Version, VersionEdit, NUM_LEVELS};
use parking_lot::Mutex;
use shardfs_common::{EngineOptions, Error, Result, SequenceNo};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

struct ReplicaState {
    version: Arc<Version>,
    last_sequence: SequenceNo,
    /// Manifest records applied so far; reload skips this many.
    applied_records: usize,
}

pub struct ReadonlyEngine {
    storage: Arc<dyn Storage>,
    dir: PathBuf,
    table_cache: Arc<TableCache>,
    state: Mutex<ReplicaState>,
}

impl ReadonlyEngine {
    /// Open a read-only view of `dir`. The primary may keep appending;
    /// call `reload` to follow it.
    pub fn open(
        storage: Arc<dyn Storage>,
        dir: impl Into<PathBuf>,
        options: EngineOptions,
    ) -> Result<ReadonlyEngine> {
        let dir = dir.into();
        let options = options.sanitize();
        let table_cache = Arc::new(TableCache::new(
            storage.clone(),
            dir.clone(),
            options.clone(),
        ));
        let engine = ReadonlyEngine {
            storage,
            dir,
            table_cache,
            state: Mutex::new(ReplicaState {
                version: Version::empty(),
                last_sequence: 0,
                applied_records: 0,
            }),
        };
        engine.reload()?;
        Ok(engine)
    }

    /// Apply manifest edits appended since the last load. Returns the
    /// number of new edits.
    pub fn reload(&self) -> Result<usize> {
        let current = read_file_to_vec(self.storage.as_ref(), &current_file(&self.dir))?;
        let name = std::str::from_utf8(&current)
            .map_err(|_| Error::corruption("CURRENT is not utf-8"))?
            .trim_end();
        let path = self.dir.join(name);
        let mut reader = LogReader::new(self.storage.new_sequential(&path)?);

        let mut state = self.state.lock();
        let mut version = Version {
            files: vec![Vec::new(); NUM_LEVELS],
        };
        for level in 0..NUM_LEVELS {
            version.files[level] = state.version.files[level].clone();
        }

        let mut seen = 0usize;
        let mut fresh = 0usize;
        let mut last_sequence = state.last_sequence;
        while let Some(record) = reader.read_record()? {
            seen += 1;
            if seen <= state.applied_records {
                continue;
            }
            let edit = VersionEdit::decode(&record)?;
            if let Some(s) = edit.last_sequence {
                last_sequence = s;
            }
            for (level, number) in &edit.deleted_files {
                version.files[*level].retain(|f| f.number != *number);
            }
            for (level, number, size, smallest, largest) in &edit.new_files {
                version.files[*level].push(crate::version::FileMetaData::new(
                    *number,
                    *size,
                    smallest.clone(),
                    largest.clone(),
                ));
            }
            fresh += 1;
        }
        version.files[0].sort_by_key(|f| f.number);
        for level in 1..NUM_LEVELS {
            version.files[level].sort_by(|a, b| a.smallest.cmp(&b.smallest));
        }
        state.version = Arc::new(version);
        state.last_sequence = last_sequence;
        state.applied_records = seen;
        if fresh > 0 {
            debug!(edits = fresh, "replica caught up with primary manifest");
        }
        Ok(fresh)
    }

    /// Point lookup against the replica's current view.
    pub fn get(&self, user_key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (version, seq) = {
            let state = self.state.lock();
            (state.version.clone(), state.last_sequence)
        };
        let target = key::lookup_key(user_key, seq);
        for (_, file) in version.files_for_get(user_key) {
            let table = self.table_cache.get(file.number, file.file_size)?;
            let (hit, _) = table.get(&target)?;
            if let Some((ikey, value)) = hit {
                if key::user_key(&ikey) == user_key {
                    return match key::parse_tag(&ikey) {
                        Some((_, ValueKind::Value)) => Ok(Some(value)),
                        Some((_, ValueKind::Deletion)) => Ok(None),
                        None => Err(Error::corruption("bad internal key tag")),
                    };
                }
            }
        }
        Ok(None)
    }

    /// Collect user-visible rows in `[begin, end)`.
    pub fn scan(&self, begin: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let (version, seq) = {
            let state = self.state.lock();
            (state.version.clone(), state.last_sequence)
        };
        let mut children: Vec<Box<dyn InternalIterator>> = Vec::new();
        let mut l0 = version.files[0].clone();
        l0.sort_by(|a, b| b.number.cmp(&a.number));
        for f in l0 {
            let table = self.table_cache.get(f.number, f.file_size)?;
            children.push(Box::new(table.iter()) as Box<dyn InternalIterator>);
        }
        for level in 1..NUM_LEVELS {
            if !version.files[level].is_empty() {
                children.push(Box::new(LevelIterator::new(
                    self.table_cache.clone(),
                    version.files[level].clone(),
                )));
            }
        }
        let mut iter = MergingIterator::new(children);
        iter.seek(&key::lookup_key(begin, seq))?;

        let mut out: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut seen_key: Option<Vec<u8>> = None;
        while iter.valid() {
            let Some((entry_seq, kind)) = key::parse_tag(iter.key()) else {
                return Err(Error::corruption("bad internal key"));
            };
            if entry_seq > seq {
                iter.next()?;
                continue;
            }
            let ukey = key::user_key(iter.key());
            if ukey >= end {
                break;
            }
            if seen_key.as_deref() == Some(ukey) {
                iter.next()?;
                continue;
            }
            seen_key = Some(ukey.to_vec());
            if kind == ValueKind::Value {
                out.push((ukey.to_vec(), iter.value().to_vec()));
            }
            iter.next()?;
        }
        Ok(out)
    }

    /// Writes are not supported on a replica.
    pub fn put(&self, _key: &[u8], _value: &[u8]) -> Result<SequenceNo> {
        Err(Error::not_supported("replica is read-only"))
    }

    pub fn delete(&self, _key: &[u8]) -> Result<SequenceNo> {
        Err(Error::not_supported("replica is read-only"))
    }

    pub fn last_sequence(&self) -> SequenceNo {
        self.state.lock().last_sequence
    }
}
