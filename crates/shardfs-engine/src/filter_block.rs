//! Filter block
//!
//! One Bloom filter per 2 KiB window of data-block offsets, so a point
//! lookup probes exactly one filter:
//!
//! ```text
//! [filter 0][filter 1]...[offset of filter i (u32 LE) ...][array offset u32][base lg 1B]
//! ```

use crate::bloom;
use crate::coding::{decode_fixed32, put_fixed32};

/// Filter window granularity: one filter per 2^11 bytes of data blocks.
const FILTER_BASE_LG: u32 = 11;

pub struct FilterBlockBuilder {
    bits_per_key: usize,
    /// Flattened keys for the filter under construction
    keys: Vec<Vec<u8>>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(bits_per_key: usize) -> Self {
        Self {
            bits_per_key,
            keys: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Called when a data block starts at `block_offset` in the table.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = (block_offset >> FILTER_BASE_LG) as usize;
        debug_assert!(filter_index >= self.filter_offsets.len());
        while filter_index > self.filter_offsets.len() {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.keys.is_empty() {
            return;
        }
        let refs: Vec<&[u8]> = self.keys.iter().map(|k| k.as_slice()).collect();
        let filter = bloom::create_filter(&refs, self.bits_per_key);
        self.result.extend_from_slice(&filter);
        self.keys.clear();
    }

    pub fn finish(mut self) -> Vec<u8> {
        if !self.keys.is_empty() {
            self.generate_filter();
        }
        let array_offset = self.result.len() as u32;
        let offsets = std::mem::take(&mut self.filter_offsets);
        for off in offsets {
            put_fixed32(&mut self.result, off);
        }
        put_fixed32(&mut self.result, array_offset);
        self.result.push(FILTER_BASE_LG as u8);
        self.result
    }
}

pub struct FilterBlockReader {
    data: Vec<u8>,
    array_offset: usize,
    num_filters: usize,
    base_lg: u32,
}

impl FilterBlockReader {
    pub fn new(data: Vec<u8>) -> Option<Self> {
        if data.len() < 5 {
            return None;
        }
        let base_lg = data[data.len() - 1] as u32;
        let array_offset = decode_fixed32(&data[data.len() - 5..]) as usize;
        if array_offset > data.len() - 5 {
            return None;
        }
        let num_filters = (data.len() - 5 - array_offset) / 4;
        Some(Self {
            data,
            array_offset,
            num_filters,
            base_lg,
        })
    }

    /// May the key be present in the data block at `block_offset`?
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            return true;
        }
        let start = decode_fixed32(&self.data[self.array_offset + index * 4..]) as usize;
        let limit = if index + 1 < self.num_filters {
            decode_fixed32(&self.data[self.array_offset + (index + 1) * 4..]) as usize
        } else {
            self.array_offset
        };
        if start == limit {
            // Empty window: no keys were hashed, nothing can match.
            return false;
        }
        if start > limit || limit > self.array_offset {
            return true;
        }
        bloom::key_may_match(key, &self.data[start..limit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_window() {
        let mut builder = FilterBlockBuilder::new(10);
        builder.start_block(0);
        builder.add_key(b"foo");
        builder.add_key(b"bar");
        let reader = FilterBlockReader::new(builder.finish()).unwrap();
        assert!(reader.key_may_match(0, b"foo"));
        assert!(reader.key_may_match(0, b"bar"));
        assert!(!reader.key_may_match(0, b"definitely-absent-key"));
    }

    #[test]
    fn test_multiple_windows() {
        let mut builder = FilterBlockBuilder::new(10);
        builder.start_block(0);
        builder.add_key(b"a0");
        builder.start_block(3000);
        builder.add_key(b"b0");
        builder.start_block(9000);
        builder.add_key(b"c0");
        let reader = FilterBlockReader::new(builder.finish()).unwrap();

        assert!(reader.key_may_match(0, b"a0"));
        assert!(reader.key_may_match(3000, b"b0"));
        assert!(reader.key_may_match(9000, b"c0"));
        assert!(!reader.key_may_match(0, b"b0"));
        assert!(!reader.key_may_match(3000, b"a0"));
        // Offsets past the last filter never prune.
        assert!(reader.key_may_match(1 << 30, b"anything"));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(FilterBlockReader::new(vec![]).is_none());
        assert!(FilterBlockReader::new(vec![1, 2, 3]).is_none());
    }
}
