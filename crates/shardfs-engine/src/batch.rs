//! Write batches
//!
//! A batch is the WAL durability unit: its image is one log record and
//! its entries apply to the memtable as a unit under consecutive
//! sequence numbers.
//!
//! ```text
//! [ sequence u64 LE ][ count u32 LE ][ entries ]
//! entry: kind 1B | key (length-prefixed) | value (length-prefixed, Value only)
//! ```

use crate::coding::{decode_fixed32, decode_fixed64, get_length_prefixed, put_length_prefixed};
use crate::key::ValueKind;
use crate::memtable::MemTable;
use shardfs_common::{Error, Result, SequenceNo};

const BATCH_HEADER: usize = 12;

#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    rep: Vec<u8>,
    count: u32,
}

impl WriteBatch {
    pub fn new() -> Self {
        let mut rep = Vec::with_capacity(64);
        rep.resize(BATCH_HEADER, 0);
        Self { rep, count: 0 }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.rep.push(ValueKind::Value as u8);
        put_length_prefixed(&mut self.rep, key);
        put_length_prefixed(&mut self.rep, value);
        self.count += 1;
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.rep.push(ValueKind::Deletion as u8);
        put_length_prefixed(&mut self.rep, key);
        self.count += 1;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn byte_size(&self) -> usize {
        self.rep.len()
    }

    pub fn clear(&mut self) {
        self.rep.truncate(BATCH_HEADER);
        self.rep.iter_mut().for_each(|b| *b = 0);
        self.count = 0;
    }

    /// Stamp the starting sequence and return the WAL record image.
    pub fn encode(&mut self, seq: SequenceNo) -> &[u8] {
        self.rep[..8].copy_from_slice(&seq.to_le_bytes());
        self.rep[8..12].copy_from_slice(&self.count.to_le_bytes());
        &self.rep
    }

    /// Apply every entry to the memtable under its assigned sequence.
    pub fn insert_into(&self, base_seq: SequenceNo, mem: &MemTable) -> Result<()> {
        let mut seq = base_seq;
        self.for_each(|kind, key, value| {
            mem.add(seq, kind, key, value);
            seq += 1;
            Ok(())
        })
    }

    /// Visit entries in write order.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(ValueKind, &[u8], &[u8]) -> Result<()>,
    {
        let mut src = &self.rep[BATCH_HEADER..];
        let mut seen = 0u32;
        while !src.is_empty() {
            let kind = ValueKind::from_u8(src[0])
                .ok_or_else(|| Error::corruption("unknown batch entry kind"))?;
            src = &src[1..];
            let key = get_length_prefixed(&mut src)?;
            let value = match kind {
                ValueKind::Value => get_length_prefixed(&mut src)?,
                ValueKind::Deletion => &[][..],
            };
            f(kind, key, value)?;
            seen += 1;
        }
        if seen != self.count {
            return Err(Error::corruption("batch count mismatch"));
        }
        Ok(())
    }

    /// Rebuild a batch from a WAL record. Returns the batch and its
    /// starting sequence.
    pub fn decode(record: &[u8]) -> Result<(Self, SequenceNo)> {
        if record.len() < BATCH_HEADER {
            return Err(Error::corruption("batch record too small"));
        }
        let seq = decode_fixed64(&record[..8]);
        let count = decode_fixed32(&record[8..12]);
        let batch = Self {
            rep: record.to_vec(),
            count,
        };
        // Validate the framing eagerly so replay fails fast.
        batch.for_each(|_, _, _| Ok(()))?;
        Ok((batch, seq))
    }
}
