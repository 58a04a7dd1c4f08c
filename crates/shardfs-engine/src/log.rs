//! Block-structured record log
//!
//! Shared by the write-ahead log and the version manifest. The file is a
//! sequence of 32 KiB blocks; records never straddle a block boundary
//! and are fragmented instead:
//!
//! ```text
//! +----------+--------+------+---------+
//! | CRC32C   | length | type | payload |
//! | 4B       | 2B LE  | 1B   | var     |
//! +----------+--------+------+---------+
//! ```
//!
//! `type` is Full, or First/Middle/Last for fragmented records. The CRC
//! covers the type byte and payload and is stored masked so that logs
//! containing logs stay checkable.

use crate::storage::{SequentialFile, WritableFile};
use shardfs_common::{Error, Result};

pub const BLOCK_SIZE: usize = 32 * 1024;
pub const HEADER_SIZE: usize = 4 + 2 + 1;

const FULL: u8 = 1;
const FIRST: u8 = 2;
const MIDDLE: u8 = 3;
const LAST: u8 = 4;

const MASK_DELTA: u32 = 0xa282ead8;

/// Mask a CRC stored inside CRC-bearing payloads.
fn mask_crc(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

fn unmask_crc(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}

/// Appends records to a log file.
pub struct LogWriter {
    file: Box<dyn WritableFile>,
    block_offset: usize,
}

impl LogWriter {
    pub fn new(file: Box<dyn WritableFile>) -> Self {
        Self {
            file,
            block_offset: 0,
        }
    }

    /// Resume writing a log whose current size is `len`.
    pub fn with_offset(file: Box<dyn WritableFile>, len: u64) -> Self {
        Self {
            file,
            block_offset: (len % BLOCK_SIZE as u64) as usize,
        }
    }

    pub fn add_record(&mut self, mut payload: &[u8]) -> Result<()> {
        let mut begin = true;
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Fill the block trailer with zeros.
                if leftover > 0 {
                    self.file.append(&[0u8; HEADER_SIZE - 1][..leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = payload.len().min(avail);
            let end = fragment_len == payload.len();
            let record_type = match (begin, end) {
                (true, true) => FULL,
                (true, false) => FIRST,
                (false, true) => LAST,
                (false, false) => MIDDLE,
            };
            self.emit(record_type, &payload[..fragment_len])?;
            payload = &payload[fragment_len..];
            begin = false;
            if end {
                return Ok(());
            }
        }
    }

    fn emit(&mut self, record_type: u8, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= 0xffff);
        let mut crc = crc32c::crc32c(&[record_type]);
        crc = crc32c::crc32c_append(crc, payload);
        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&mask_crc(crc).to_le_bytes());
        header[4..6].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        header[6] = record_type;
        self.file.append(&header)?;
        self.file.append(payload)?;
        self.block_offset += HEADER_SIZE + payload.len();
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()
    }

    /// Durably persist everything appended so far.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync()
    }
}

/// Reads records back, stopping cleanly at a torn tail.
pub struct LogReader {
    file: Box<dyn SequentialFile>,
    block: Vec<u8>,
    block_len: usize,
    block_pos: usize,
    eof: bool,
    /// Set when the reader stopped early because of a damaged record.
    corruption: Option<String>,
}

impl LogReader {
    pub fn new(file: Box<dyn SequentialFile>) -> Self {
        Self {
            file,
            block: vec![0u8; BLOCK_SIZE],
            block_len: 0,
            block_pos: 0,
            eof: false,
            corruption: None,
        }
    }

    /// Why reading stopped early, if it did.
    pub fn corruption(&self) -> Option<&str> {
        self.corruption.as_deref()
    }

    /// Read the next complete record, or None at end of log. A torn or
    /// damaged tail ends the log; everything before it is returned.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut assembled: Option<Vec<u8>> = None;
        loop {
            let Some((record_type, payload)) = self.read_physical()? else {
                // A dangling fragment at EOF is a torn write.
                if assembled.is_some() {
                    self.corruption = Some("log ended mid-record".to_string());
                }
                return Ok(None);
            };
            match record_type {
                FULL => {
                    if assembled.is_some() {
                        self.corruption = Some("unexpected full record".to_string());
                        return Ok(None);
                    }
                    return Ok(Some(payload));
                }
                FIRST => {
                    if assembled.is_some() {
                        self.corruption = Some("unexpected first record".to_string());
                        return Ok(None);
                    }
                    assembled = Some(payload);
                }
                MIDDLE => match assembled.as_mut() {
                    Some(buf) => buf.extend_from_slice(&payload),
                    None => {
                        self.corruption = Some("orphan middle record".to_string());
                        return Ok(None);
                    }
                },
                LAST => match assembled.take() {
                    Some(mut buf) => {
                        buf.extend_from_slice(&payload);
                        return Ok(Some(buf));
                    }
                    None => {
                        self.corruption = Some("orphan last record".to_string());
                        return Ok(None);
                    }
                },
                other => {
                    self.corruption = Some(format!("unknown record type {other}"));
                    return Ok(None);
                }
            }
        }
    }

    fn read_physical(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        loop {
            if self.corruption.is_some() {
                return Ok(None);
            }
            if self.block_len - self.block_pos < HEADER_SIZE {
                // Trailer: skip to the next block.
                if !self.refill()? {
                    return Ok(None);
                }
                continue;
            }
            let header = &self.block[self.block_pos..self.block_pos + HEADER_SIZE];
            let stored_crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let record_type = header[6];
            if record_type == 0 && length == 0 && stored_crc == 0 {
                // Preallocated or zero-filled space ends the block.
                self.block_pos = self.block_len;
                continue;
            }
            if self.block_pos + HEADER_SIZE + length > self.block_len {
                self.corruption = Some("record overruns block".to_string());
                return Ok(None);
            }
            let payload =
                &self.block[self.block_pos + HEADER_SIZE..self.block_pos + HEADER_SIZE + length];
            let mut crc = crc32c::crc32c(&[record_type]);
            crc = crc32c::crc32c_append(crc, payload);
            if unmask_crc(stored_crc) != crc {
                self.corruption = Some("record checksum mismatch".to_string());
                return Ok(None);
            }
            let out = payload.to_vec();
            self.block_pos += HEADER_SIZE + length;
            return Ok(Some((record_type, out)));
        }
    }

    fn refill(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        self.block_pos = 0;
        self.block_len = 0;
        while self.block_len < BLOCK_SIZE {
            let n = self.file.read(&mut self.block[self.block_len..])?;
            if n == 0 {
                self.eof = true;
                break;
            }
            self.block_len += n;
        }
        Ok(self.block_len >= HEADER_SIZE)
    }
}

/// Convenience: read every record of a log.
pub fn read_all(reader: &mut LogReader) -> Result<Vec<Vec<u8>>> {
    let mut records = Vec::new();
    while let Some(record) = reader.read_record()? {
        records.push(record);
    }
    if let Some(why) = reader.corruption() {
        return Err(Error::corruption(why.to_string()));
    }
    Ok(records)
}
