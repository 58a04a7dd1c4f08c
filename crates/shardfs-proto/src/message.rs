//! RPC operations and payloads
//!
//! A call is `{op, err, payload bytes}` on both sides; payload encoding
//! is the caller's concern and the transport only moves bytes. The
//! typed request/reply structs here encode with bincode.
//!
//! Every reply carries the server's current encoded partition index for
//! the directory touched, so clients converge by merging.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use shardfs_common::{DirId, Error, LookupStat, Result, Stat};

/// Operation selector carried in every call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Ping = 0,
    Lookup = 1,
    Getattr = 2,
    Mknod = 3,
    Mkdir = 4,
    Unlink = 5,
    Readdir = 6,
    /// Bulk-ingest a shipped split table on the target server.
    InstallTable = 7,
}

impl OpCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Ping),
            1 => Some(Self::Lookup),
            2 => Some(Self::Getattr),
            3 => Some(Self::Mknod),
            4 => Some(Self::Mkdir),
            5 => Some(Self::Unlink),
            6 => Some(Self::Readdir),
            7 => Some(Self::InstallTable),
            _ => None,
        }
    }
}

/// An opaque call or reply
#[derive(Clone, Debug)]
pub struct Message {
    pub op: OpCode,
    /// 0 on success; otherwise an error code from the common error type.
    pub err: u8,
    pub payload: Bytes,
}

impl Message {
    pub fn request<T: Serialize>(op: OpCode, body: &T) -> Result<Message> {
        let payload = bincode::serialize(body)
            .map_err(|e| Error::invalid_argument(format!("encode request: {e}")))?;
        Ok(Message {
            op,
            err: 0,
            payload: Bytes::from(payload),
        })
    }

    pub fn reply<T: Serialize>(op: OpCode, body: &T) -> Result<Message> {
        Self::request(op, body)
    }

    pub fn error_reply(op: OpCode, err: &Error) -> Message {
        Message {
            op,
            err: err.code(),
            payload: Bytes::from(err.to_string().into_bytes()),
        }
    }

    /// Decode the payload, translating a carried error first.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        if self.err != 0 {
            let msg = String::from_utf8_lossy(&self.payload).into_owned();
            return Err(Error::from_code(self.err, msg));
        }
        bincode::deserialize(&self.payload)
            .map_err(|e| Error::corruption(format!("decode payload: {e}")))
    }
}

// ---------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LookupRequest {
    pub dir: DirId,
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LookupReply {
    pub stat: LookupStat,
    /// Encoded partition index of `dir`, for client-side merging.
    pub dir_index: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetattrRequest {
    pub dir: DirId,
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetattrReply {
    pub stat: Stat,
    pub dir_index: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MknodRequest {
    pub dir: DirId,
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MkdirRequest {
    pub dir: DirId,
    pub name: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Reply to any mutating namespace operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeReply {
    pub stat: LookupStat,
    pub dir_index: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnlinkRequest {
    pub dir: DirId,
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnlinkReply {
    pub dir_index: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReaddirRequest {
    pub dir: DirId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirListEntry {
    pub name: String,
    pub inode: u64,
    pub mode: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReaddirReply {
    /// Entries hosted by the answering server only; the client unions
    /// across the servers the index names.
    pub entries: Vec<DirListEntry>,
    pub dir_index: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallTableRequest {
    pub dir: DirId,
    /// Child partition being split out to the receiving server.
    pub partition: u32,
    /// Complete table-file image, ready for level-0 ingest.
    pub table: Vec<u8>,
    /// The sender's post-split index image.
    pub dir_index: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallTableReply {
    pub dir_index: Vec<u8>,
}
