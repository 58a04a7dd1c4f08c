//! Immutable table files
//!
//! ```text
//! [data block]*
//! [filter block]
//! [metaindex block]   "filter.bloom" -> filter handle
//! [index block]       last key of block -> block handle
//! [footer, 48 bytes]  metaindex handle | index handle | padding | magic
//! ```
//!
//! Every block carries a one-byte type (0 = uncompressed) and a masked
//! CRC32C trailer. The footer magic guards against opening foreign
//! files.

use crate::block::{Block, BlockBuilder, BlockIterator};
use crate::coding::{get_varint64, put_varint64};
use crate::filter_block::{FilterBlockBuilder, FilterBlockReader};
use crate::iterator::InternalIterator;
use crate::storage::{RandomAccessFile, WritableFile};
use shardfs_common::{EngineOptions, Error, Result};
use std::sync::Arc;

pub const FOOTER_SIZE: usize = 48;
const TABLE_MAGIC: u64 = 0x9c8e_55d1_42ab_37f6;

const BLOCK_TRAILER_SIZE: usize = 5;
const BLOCK_TYPE_RAW: u8 = 0;

const FILTER_META_KEY: &[u8] = b"filter.bloom";

const MASK_DELTA: u32 = 0xa282ead8;

fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

/// Location of a block within a table file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        put_varint64(dst, self.offset);
        put_varint64(dst, self.size);
    }

    pub fn decode_from(src: &mut &[u8]) -> Result<Self> {
        Ok(Self {
            offset: get_varint64(src)?,
            size: get_varint64(src)?,
        })
    }
}

// ---------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------

pub struct TableBuilder {
    file: Box<dyn WritableFile>,
    options: EngineOptions,
    data_block: BlockBuilder,
    index_block: BlockBuilder,
    filter: Option<FilterBlockBuilder>,
    /// Index entry deferred until the next key shows the separator.
    pending_handle: Option<(Vec<u8>, BlockHandle)>,
    offset: u64,
    num_entries: u64,
    last_key: Vec<u8>,
    finished: bool,
}

impl TableBuilder {
    pub fn new(file: Box<dyn WritableFile>, options: EngineOptions) -> Self {
        let filter = if options.filter_bits_per_key > 0 {
            let mut f = FilterBlockBuilder::new(options.filter_bits_per_key);
            f.start_block(0);
            Some(f)
        } else {
            None
        };
        let restart_interval = options.block_restart_interval;
        Self {
            file,
            options,
            data_block: BlockBuilder::new(restart_interval),
            index_block: BlockBuilder::new(1),
            filter,
            pending_handle: None,
            offset: 0,
            num_entries: 0,
            last_key: Vec::new(),
            finished: false,
        }
    }

    /// Add an internally-keyed entry; keys must arrive in ascending
    /// order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(!self.finished);
        debug_assert!(self.last_key.is_empty() || key > self.last_key.as_slice());
        if let Some((sep, handle)) = self.pending_handle.take() {
            let mut enc = Vec::new();
            handle.encode_to(&mut enc);
            self.index_block.add(&sep, &enc);
        }
        if let Some(f) = self.filter.as_mut() {
            f.add_key(key);
        }
        self.last_key = key.to_vec();
        self.data_block.add(key, value);
        self.num_entries += 1;
        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let block = std::mem::replace(
            &mut self.data_block,
            BlockBuilder::new(self.options.block_restart_interval),
        );
        let contents = block.finish();
        let handle = self.write_raw_block(&contents)?;
        self.pending_handle = Some((self.last_key.clone(), handle));
        if let Some(f) = self.filter.as_mut() {
            f.start_block(self.offset);
        }
        Ok(())
    }

    fn write_raw_block(&mut self, contents: &[u8]) -> Result<BlockHandle> {
        let handle = BlockHandle {
            offset: self.offset,
            size: contents.len() as u64,
        };
        self.file.append(contents)?;
        let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
        trailer[0] = BLOCK_TYPE_RAW;
        let mut crc = crc32c::crc32c(contents);
        crc = crc32c::crc32c_append(crc, &trailer[..1]);
        trailer[1..].copy_from_slice(&mask_crc(crc).to_le_bytes());
        self.file.append(&trailer)?;
        self.offset += contents.len() as u64 + BLOCK_TRAILER_SIZE as u64;
        Ok(handle)
    }

    /// Write the meta blocks and footer and sync the file.
    pub fn finish(mut self) -> Result<TableStats> {
        self.flush_data_block()?;
        if let Some((sep, handle)) = self.pending_handle.take() {
            let mut enc = Vec::new();
            handle.encode_to(&mut enc);
            self.index_block.add(&sep, &enc);
        }

        let filter_handle = match self.filter.take() {
            Some(f) => Some(self.write_raw_block(&f.finish())?),
            None => None,
        };

        let mut metaindex = BlockBuilder::new(1);
        if let Some(handle) = filter_handle {
            let mut enc = Vec::new();
            handle.encode_to(&mut enc);
            metaindex.add(FILTER_META_KEY, &enc);
        }
        let metaindex_handle = self.write_raw_block(&metaindex.finish())?;

        let index_block = std::mem::replace(&mut self.index_block, BlockBuilder::new(1));
        let index_handle = self.write_raw_block(&index_block.finish())?;

        let mut footer = Vec::with_capacity(FOOTER_SIZE);
        metaindex_handle.encode_to(&mut footer);
        index_handle.encode_to(&mut footer);
        footer.resize(FOOTER_SIZE - 8, 0);
        footer.extend_from_slice(&TABLE_MAGIC.to_le_bytes());
        self.file.append(&footer)?;
        self.offset += FOOTER_SIZE as u64;
        self.file.sync()?;
        self.finished = true;

        Ok(TableStats {
            file_size: self.offset,
            num_entries: self.num_entries,
        })
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    pub fn file_size(&self) -> u64 {
        self.offset
    }
}

/// Summary of a finished table
#[derive(Clone, Copy, Debug)]
pub struct TableStats {
    pub file_size: u64,
    pub num_entries: u64,
}

// ---------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------

pub struct Table {
    file: Arc<dyn RandomAccessFile>,
    index: Arc<Block>,
    filter: Option<FilterBlockReader>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").finish_non_exhaustive()
    }
}

impl Table {
    pub fn open(
        file: Arc<dyn RandomAccessFile>,
        file_size: u64,
        _options: &EngineOptions,
    ) -> Result<Arc<Table>> {
        if (file_size as usize) < FOOTER_SIZE {
            return Err(Error::corruption("file too short to be a table"));
        }
        let footer = file.read_at(file_size - FOOTER_SIZE as u64, FOOTER_SIZE)?;
        if footer.len() != FOOTER_SIZE {
            return Err(Error::corruption("truncated table footer"));
        }
        let magic = u64::from_le_bytes(footer[FOOTER_SIZE - 8..].try_into().unwrap());
        if magic != TABLE_MAGIC {
            return Err(Error::corruption("bad table magic"));
        }
        let mut src = &footer[..FOOTER_SIZE - 8];
        let metaindex_handle = BlockHandle::decode_from(&mut src)?;
        let index_handle = BlockHandle::decode_from(&mut src)?;

        let index = Block::new(read_block(file.as_ref(), index_handle)?)?;

        let mut filter = None;
        if let Ok(meta_contents) = read_block(file.as_ref(), metaindex_handle) {
            if let Ok(meta) = Block::new(meta_contents) {
                let mut iter = meta.iter();
                iter.seek(FILTER_META_KEY)?;
                if iter.valid() && iter.key() == FILTER_META_KEY {
                    let mut src = iter.value();
                    let handle = BlockHandle::decode_from(&mut src)?;
                    if let Ok(data) = read_block(file.as_ref(), handle) {
                        filter = FilterBlockReader::new(data);
                    }
                }
            }
        }

        Ok(Arc::new(Table { file, index, filter }))
    }

    /// Point lookup: the newest entry at or after `target` within its
    /// data block, or None when pruned by the filter or absent.
    /// The bool is true when the lookup had to read a data block (a
    /// chargeable seek for compaction accounting).
    pub fn get(&self, target: &[u8]) -> Result<(Option<(Vec<u8>, Vec<u8>)>, bool)> {
        let mut index_iter = self.index.iter();
        index_iter.seek(target)?;
        if !index_iter.valid() {
            return Ok((None, false));
        }
        let mut src = index_iter.value();
        let handle = BlockHandle::decode_from(&mut src)?;
        if let Some(filter) = &self.filter {
            if !filter.key_may_match(handle.offset, target) {
                return Ok((None, false));
            }
        }
        let block = self.read_data_block(handle)?;
        let mut iter = block.iter();
        iter.seek(target)?;
        if iter.valid() {
            Ok((Some((iter.key().to_vec(), iter.value().to_vec())), true))
        } else {
            Ok((None, true))
        }
    }

    fn read_data_block(&self, handle: BlockHandle) -> Result<Arc<Block>> {
        Block::new(read_block(self.file.as_ref(), handle)?)
    }

    pub fn iter(self: &Arc<Self>) -> TableIterator {
        TableIterator {
            table: self.clone(),
            index_iter: self.index.iter(),
            data_iter: None,
        }
    }
}

fn read_block(file: &dyn RandomAccessFile, handle: BlockHandle) -> Result<Vec<u8>> {
    let raw = file.read_at(handle.offset, handle.size as usize + BLOCK_TRAILER_SIZE)?;
    if raw.len() != handle.size as usize + BLOCK_TRAILER_SIZE {
        return Err(Error::corruption("truncated block read"));
    }
    let (contents, trailer) = raw.split_at(handle.size as usize);
    if trailer[0] != BLOCK_TYPE_RAW {
        return Err(Error::not_supported("unknown block type"));
    }
    let stored = u32::from_le_bytes(trailer[1..5].try_into().unwrap());
    let mut crc = crc32c::crc32c(contents);
    crc = crc32c::crc32c_append(crc, &trailer[..1]);
    if unmask_crc(stored) != crc {
        return Err(Error::corruption("block checksum mismatch"));
    }
    Ok(contents.to_vec())
}

/// Two-level cursor: the index block positions a data-block cursor.
pub struct TableIterator {
    table: Arc<Table>,
    index_iter: BlockIterator,
    data_iter: Option<BlockIterator>,
}

impl TableIterator {
    fn load_data_block(&mut self) -> Result<()> {
        if !self.index_iter.valid() {
            self.data_iter = None;
            return Ok(());
        }
        let mut src = self.index_iter.value();
        let handle = BlockHandle::decode_from(&mut src)?;
        let block = self.table.read_data_block(handle)?;
        self.data_iter = Some(block.iter());
        Ok(())
    }

    fn skip_empty_blocks_forward(&mut self) -> Result<()> {
        loop {
            match &self.data_iter {
                Some(iter) if iter.valid() => return Ok(()),
                _ => {
                    if !self.index_iter.valid() {
                        self.data_iter = None;
                        return Ok(());
                    }
                    self.index_iter.next()?;
                    self.load_data_block()?;
                    if let Some(iter) = self.data_iter.as_mut() {
                        iter.seek_to_first()?;
                    }
                }
            }
        }
    }
}

impl InternalIterator for TableIterator {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(|i| i.valid())
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.index_iter.seek_to_first()?;
        self.load_data_block()?;
        if let Some(iter) = self.data_iter.as_mut() {
            iter.seek_to_first()?;
        }
        self.skip_empty_blocks_forward()
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.index_iter.seek(target)?;
        self.load_data_block()?;
        if let Some(iter) = self.data_iter.as_mut() {
            iter.seek(target)?;
        }
        self.skip_empty_blocks_forward()
    }

    fn next(&mut self) -> Result<()> {
        if let Some(iter) = self.data_iter.as_mut() {
            iter.next()?;
        }
        self.skip_empty_blocks_forward()
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().expect("iterator not positioned").key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter
            .as_ref()
            .expect("iterator not positioned")
            .value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemStorage, Storage};
    use std::path::Path;

    fn build_table(
        storage: &dyn Storage,
        path: &Path,
        pairs: &[(Vec<u8>, Vec<u8>)],
        options: &EngineOptions,
    ) -> Arc<Table> {
        let mut builder = TableBuilder::new(storage.new_writable(path).unwrap(), options.clone());
        for (k, v) in pairs {
            builder.add(k, v).unwrap();
        }
        let stats = builder.finish().unwrap();
        assert_eq!(stats.num_entries, pairs.len() as u64);
        let file = storage.new_random_access(path).unwrap();
        let size = storage.file_size(path).unwrap();
        Table::open(file, size, options).unwrap()
    }

    fn sample_pairs(n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n)
            .map(|i| {
                (
                    format!("row/{i:06}").into_bytes(),
                    format!("payload-{i}").into_bytes(),
                )
            })
            .collect()
    }

    #[test]
    fn test_build_and_scan() {
        let storage = MemStorage::new();
        let options = EngineOptions {
            block_size: 256,
            ..Default::default()
        };
        let pairs = sample_pairs(500);
        let table = build_table(storage.as_ref(), Path::new("/t.ldb"), &pairs, &options);

        let mut iter = table.iter();
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
    fn test_point_lookups() {
        let storage = MemStorage::new();
        let options = EngineOptions {
            block_size: 128,
            ..Default::default()
        };
        let pairs = sample_pairs(200);
        let table = build_table(storage.as_ref(), Path::new("/t.ldb"), &pairs, &options);

        for (k, v) in pairs.iter().step_by(7) {
            let (hit, _charged) = table.get(k).unwrap();
            let (fk, fv) = hit.expect("present key");
            assert_eq!(fk, *k);
            assert_eq!(fv, *v);
        }
        // A key past the end misses without error.
        let (miss, _) = table.get(b"zzzz").unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn test_filter_prunes_absent_keys() {
        let storage = MemStorage::new();
        let options = EngineOptions::default();
        let pairs = sample_pairs(100);
        let table = build_table(storage.as_ref(), Path::new("/t.ldb"), &pairs, &options);

        let mut pruned = 0;
        for i in 0..100 {
            let probe = format!("absent/{i:06}").into_bytes();
            let (hit, charged) = table.get(&probe).unwrap();
            // "absent/..." sorts below "row/...", so seeks land in the
            // first block; the filter should prune nearly all of them.
            assert!(hit.is_none() || hit.unwrap().0 != probe);
            if !charged {
                pruned += 1;
            }
        }
        assert!(pruned > 80, "filter pruned only {pruned}/100");
    }

    #[test]
    fn test_seek_positions_lower_bound() {
        let storage = MemStorage::new();
        let options = EngineOptions {
            block_size: 64,
            ..Default::default()
        };
        let pairs = sample_pairs(50);
        let table = build_table(storage.as_ref(), Path::new("/t.ldb"), &pairs, &options);

        let mut iter = table.iter();
        iter.seek(b"row/000010").unwrap();
        assert_eq!(iter.key(), b"row/000010");
        iter.seek(b"row/0000105").unwrap();
        assert_eq!(iter.key(), b"row/000011");
        iter.seek(b"zz").unwrap();
        assert!(!iter.valid());
    }

    #[test]
    fn test_corrupt_footer_rejected() {
        let storage = MemStorage::new();
        let path = Path::new("/t.ldb");
        {
            let mut f = storage.new_writable(path).unwrap();
            f.append(&[0u8; 64]).unwrap();
        }
        let file = storage.new_random_access(path).unwrap();
        let err = Table::open(file, 64, &EngineOptions::default()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_flipped_block_byte_detected() {
        let storage = MemStorage::new();
        let options = EngineOptions {
            filter_bits_per_key: 0,
            ..Default::default()
        };
        let path = Path::new("/t.ldb");
        let pairs = sample_pairs(10);
        {
            let mut builder =
                TableBuilder::new(storage.new_writable(path).unwrap(), options.clone());
            for (k, v) in &pairs {
                builder.add(k, v).unwrap();
            }
            builder.finish().unwrap();
        }
        // Flip a byte inside the first data block.
        let data = crate::storage::read_file_to_vec(storage.as_ref(), path).unwrap();
        let mut bad = data.clone();
        bad[10] ^= 1;
        let bad_path = Path::new("/bad.ldb");
        {
            let mut f = storage.new_writable(bad_path).unwrap();
            f.append(&bad).unwrap();
        }
        let table = Table::open(
            storage.new_random_access(bad_path).unwrap(),
            bad.len() as u64,
            &options,
        )
        .unwrap();
        assert!(table.get(&pairs[0].0).unwrap_err().is_corruption());
    }
}
