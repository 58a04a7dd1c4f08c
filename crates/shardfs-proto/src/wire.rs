//! Datagram framing
//!
//! Calls ride UDP datagrams. Small messages fit one datagram; larger
//! ones (a shipped split table) are fragmented and reassembled by call
//! id. Each datagram is independently checksummed:
//!
//! ```text
//! +-------+---------+------+--------+----+-----+----------+--------+
//! | magic | call_id | frag | nfrags | op | err | fragment | CRC32C |
//! | 4B LE | 8B LE   | 2B   | 2B     | 1B | 1B  | var      | 4B LE  |
//! +-------+---------+------+--------+----+-----+----------+--------+
//! ```

use crate::message::{Message, OpCode};
use bytes::Bytes;
use shardfs_common::{Error, Result};

const WIRE_MAGIC: u32 = 0x5346_5250; // "PRFS"
pub const DATAGRAM_OVERHEAD: usize = 4 + 8 + 2 + 2 + 1 + 1 + 4;

/// Ceiling on a reassembled message; larger payloads belong on a bulk
/// transport.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct Fragment {
    pub call_id: u64,
    pub frag: u16,
    pub nfrags: u16,
    pub op: u8,
    pub err: u8,
    pub body: Bytes,
}

/// Split a message into datagrams no larger than `max_datagram`.
pub fn encode_fragments(call_id: u64, msg: &Message, max_datagram: usize) -> Result<Vec<Vec<u8>>> {
    let budget = max_datagram.saturating_sub(DATAGRAM_OVERHEAD);
    if budget == 0 {
        return Err(Error::invalid_argument("datagram size too small"));
    }
    let nfrags = (msg.payload.len().max(1) + budget - 1) / budget;
    if nfrags > u16::MAX as usize {
        return Err(Error::BufferFull {
            need: msg.payload.len(),
            have: budget * u16::MAX as usize,
        });
    }
    let mut out = Vec::with_capacity(nfrags);
    for i in 0..nfrags {
        let chunk = &msg.payload[i * budget..((i + 1) * budget).min(msg.payload.len())];
        let mut buf = Vec::with_capacity(DATAGRAM_OVERHEAD + chunk.len());
        buf.extend_from_slice(&WIRE_MAGIC.to_le_bytes());
        buf.extend_from_slice(&call_id.to_le_bytes());
        buf.extend_from_slice(&(i as u16).to_le_bytes());
        buf.extend_from_slice(&(nfrags as u16).to_le_bytes());
        buf.push(msg.op as u8);
        buf.push(msg.err);
        buf.extend_from_slice(chunk);
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        out.push(buf);
    }
    Ok(out)
}

/// Parse and verify one datagram.
pub fn decode_fragment(datagram: &[u8]) -> Result<Fragment> {
    if datagram.len() < DATAGRAM_OVERHEAD {
        return Err(Error::corruption("datagram too short"));
    }
    let (body, crc_bytes) = datagram.split_at(datagram.len() - 4);
    let stored = u32::from_le_bytes(crc_bytes.try_into().unwrap());
    if crc32c::crc32c(body) != stored {
        return Err(Error::corruption("datagram checksum mismatch"));
    }
    let magic = u32::from_le_bytes(body[0..4].try_into().unwrap());
    if magic != WIRE_MAGIC {
        return Err(Error::corruption("bad datagram magic"));
    }
    let call_id = u64::from_le_bytes(body[4..12].try_into().unwrap());
    let frag = u16::from_le_bytes(body[12..14].try_into().unwrap());
    let nfrags = u16::from_le_bytes(body[14..16].try_into().unwrap());
    if nfrags == 0 || frag >= nfrags {
        return Err(Error::corruption("bad fragment indices"));
    }
    Ok(Fragment {
        call_id,
        frag,
        nfrags,
        op: body[16],
        err: body[17],
        body: Bytes::copy_from_slice(&body[18..]),
    })
}

/// Collects fragments of one call until the message is whole.
#[derive(Debug)]
pub struct Reassembly {
    op: u8,
    err: u8,
    nfrags: u16,
    parts: Vec<Option<Bytes>>,
    received: usize,
    bytes: usize,
}

impl Reassembly {
    pub fn new(first: &Fragment) -> Self {
        let mut r = Self {
            op: first.op,
            err: first.err,
            nfrags: first.nfrags,
            parts: vec![None; first.nfrags as usize],
            received: 0,
            bytes: 0,
        };
        r.accept(first);
        r
    }

    /// Returns true once every fragment has arrived.
    pub fn accept(&mut self, frag: &Fragment) -> bool {
        if frag.nfrags != self.nfrags || frag.frag >= self.nfrags {
            return self.is_complete();
        }
        let slot = &mut self.parts[frag.frag as usize];
        if slot.is_none() {
            self.bytes += frag.body.len();
            self.received += 1;
            *slot = Some(frag.body.clone());
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.nfrags as usize
    }

    pub fn oversized(&self) -> bool {
        self.bytes > MAX_MESSAGE_BYTES
    }

    pub fn into_message(self) -> Result<Message> {
        let op = OpCode::from_u8(self.op)
            .ok_or_else(|| Error::corruption("unknown op code on wire"))?;
        let mut payload = Vec::with_capacity(self.bytes);
        for part in self.parts {
            let part = part.ok_or_else(|| Error::corruption("incomplete reassembly"))?;
            payload.extend_from_slice(&part);
        }
        Ok(Message {
            op,
            err: self.err,
            payload: Bytes::from(payload),
        })
    }
}
