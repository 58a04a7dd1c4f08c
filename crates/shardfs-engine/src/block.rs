//! Table data blocks
//!
//! Sorted key/value pairs with shared-prefix compression. A restart
//! point (full key) every `restart_interval` entries bounds how far a
//! seek has to decode:
//!
//! ```text
//! entry: shared_len | unshared_len | value_len | unshared key | value
//! block: entries... | restart offsets (u32 LE each) | num_restarts u32
//! ```

use crate::coding::{decode_fixed32, get_varint32, put_fixed32, put_varint32};
use crate::iterator::InternalIterator;
use shardfs_common::{Error, Result};
use std::sync::Arc;

pub struct BlockBuilder {
    buf: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    count_since_restart: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        Self {
            buf: Vec::new(),
            restarts: vec![0],
            restart_interval: restart_interval.max(1),
            count_since_restart: 0,
            last_key: Vec::new(),
        }
    }

    /// Keys must be added in strictly ascending order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(self.last_key.is_empty() || key > self.last_key.as_slice());
        let shared = if self.count_since_restart < self.restart_interval {
            common_prefix_len(&self.last_key, key)
        } else {
            self.restarts.push(self.buf.len() as u32);
            self.count_since_restart = 0;
            0
        };
        put_varint32(&mut self.buf, shared as u32);
        put_varint32(&mut self.buf, (key.len() - shared) as u32);
        put_varint32(&mut self.buf, value.len() as u32);
        self.buf.extend_from_slice(&key[shared..]);
        self.buf.extend_from_slice(value);
        self.last_key = key.to_vec();
        self.count_since_restart += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        for &r in &self.restarts {
            put_fixed32(&mut self.buf, r);
        }
        put_fixed32(&mut self.buf, self.restarts.len() as u32);
        self.buf
    }

    pub fn current_size_estimate(&self) -> usize {
        self.buf.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// An immutable, decoded-on-demand data block.
pub struct Block {
    data: Arc<Vec<u8>>,
    restarts_offset: usize,
    num_restarts: usize,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Arc<Block>> {
        if data.len() < 4 {
            return Err(Error::corruption("block too small"));
        }
        let num_restarts = decode_fixed32(&data[data.len() - 4..]) as usize;
        let restarts_size = num_restarts
            .checked_mul(4)
            .and_then(|n| n.checked_add(4))
            .ok_or_else(|| Error::corruption("block restart count overflow"))?;
        if num_restarts == 0 || restarts_size > data.len() {
            return Err(Error::corruption("bad block restart array"));
        }
        let restarts_offset = data.len() - restarts_size;
        Ok(Arc::new(Block {
            data: Arc::new(data),
            restarts_offset,
            num_restarts,
        }))
    }

    fn restart_point(&self, i: usize) -> usize {
        decode_fixed32(&self.data[self.restarts_offset + i * 4..]) as usize
    }

    pub fn iter(self: &Arc<Self>) -> BlockIterator {
        BlockIterator {
            block: self.clone(),
            offset: 0,
            key: Vec::new(),
            value_range: (0, 0),
            valid: false,
        }
    }
}

pub struct BlockIterator {
    block: Arc<Block>,
    /// Offset of the next entry to decode.
    offset: usize,
    key: Vec<u8>,
    value_range: (usize, usize),
    valid: bool,
}

impl BlockIterator {
    /// Decode the entry at `self.offset`, extending `self.key`.
    fn parse_next(&mut self) -> Result<bool> {
        if self.offset >= self.block.restarts_offset {
            self.valid = false;
            return Ok(false);
        }
        let data = &self.block.data[..self.block.restarts_offset];
        let mut src = &data[self.offset..];
        let before = src.len();
        let shared = get_varint32(&mut src)? as usize;
        let unshared = get_varint32(&mut src)? as usize;
        let value_len = get_varint32(&mut src)? as usize;
        let header = before - src.len();
        if shared > self.key.len() || src.len() < unshared + value_len {
            return Err(Error::corruption("bad block entry"));
        }
        self.key.truncate(shared);
        self.key.extend_from_slice(&src[..unshared]);
        let value_start = self.offset + header + unshared;
        self.value_range = (value_start, value_start + value_len);
        self.offset = value_start + value_len;
        self.valid = true;
        Ok(true)
    }

    fn seek_to_restart(&mut self, i: usize) {
        self.offset = self.block.restart_point(i);
        self.key.clear();
        self.valid = false;
    }
}

impl InternalIterator for BlockIterator {
    fn valid(&self) -> bool {
        self.valid
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.seek_to_restart(0);
        self.parse_next()?;
        Ok(())
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        // Binary search the restart array for the last restart whose key
        // is < target, then scan forward.
        let mut left = 0usize;
        let mut right = self.block.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            self.seek_to_restart(mid);
            self.parse_next()?;
            if self.valid && self.key.as_slice() < target {
                left = mid;
            } else {
                right = mid - 1;
            }
        }
        self.seek_to_restart(left);
        while self.parse_next()? {
            if self.key.as_slice() >= target {
                return Ok(());
            }
        }
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if self.valid {
            self.parse_next()?;
        }
        Ok(())
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.block.data[self.value_range.0..self.value_range.1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(pairs: &[(&[u8], &[u8])], interval: usize) -> Arc<Block> {
        let mut builder = BlockBuilder::new(interval);
        for (k, v) in pairs {
            builder.add(k, v);
        }
        Block::new(builder.finish()).unwrap()
    }

    #[test]
    fn test_scan_all() {
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0..100)
            .map(|i| {
                (
                    format!("key{i:03}").into_bytes(),
                    format!("value{i}").into_bytes(),
                )
            })
            .collect();
        let refs: Vec<(&[u8], &[u8])> = pairs
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let block = build(&refs, 16);
        let mut iter = block.iter();
        iter.seek_to_first().unwrap();
        for (k, v) in &pairs {
            assert!(iter.valid());
            assert_eq!(iter.key(), k.as_slice());
            assert_eq!(iter.value(), v.as_slice());
            iter.next().unwrap();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_seek_lands_on_lower_bound() {
        let block = build(
            &[
                (b"aa", b"1"),
                (b"ab", b"2"),
                (b"ba", b"3"),
                (b"bb", b"4"),
                (b"ca", b"5"),
            ],
            2,
        );
        let mut iter = block.iter();

        iter.seek(b"ab").unwrap();
        assert_eq!(iter.key(), b"ab");

        iter.seek(b"ac").unwrap();
        assert_eq!(iter.key(), b"ba");

        iter.seek(b"\x00").unwrap();
        assert_eq!(iter.key(), b"aa");

        iter.seek(b"zz").unwrap();
        assert!(!iter.valid());
    }

    #[test]
    fn test_prefix_compression_exercised() {
        // Long shared prefixes with a tiny restart interval.
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0..50)
            .map(|i| {
                (
                    format!("shared/long/prefix/entry-{i:04}").into_bytes(),
                    vec![b'v'; i % 7],
                )
            })
            .collect();
        let refs: Vec<(&[u8], &[u8])> = pairs
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let block = build(&refs, 4);
        let mut iter = block.iter();
        for (k, v) in &pairs {
            iter.seek(k).unwrap();
            assert!(iter.valid());
            assert_eq!(iter.key(), k.as_slice());
            assert_eq!(iter.value(), v.as_slice());
        }
    }

    #[test]
    fn test_corrupt_block_rejected() {
        assert!(Block::new(vec![]).is_err());
        assert!(Block::new(vec![0, 0]).is_err());
        // Restart count pointing past the data.
        let mut data = vec![0u8; 4];
        data.extend_from_slice(&100u32.to_le_bytes());
        assert!(Block::new(data).is_err());
    }
}
