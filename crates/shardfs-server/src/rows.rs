//! Stored row payloads
//!
//! Entry rows keep the original name next to the inode attributes so
//! directory listings can be served from hash-keyed rows.

use serde::{Deserialize, Serialize};
use shardfs_common::Stat;

/// Value of a directory-entry row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRow {
    pub name: String,
    pub stat: Stat,
}

impl EntryRow {
    pub fn new(name: impl Into<String>, stat: Stat) -> Self {
        Self {
            name: name.into(),
            stat,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        bincode::deserialize(data).ok()
    }
}

/// Value of the server superblock row.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct SuperRow {
    /// Next inode number to hand out (low bits; the server id occupies
    /// the high bits of a full inode number).
    pub next_inode: u64,
}

impl SuperRow {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        bincode::deserialize(data).ok()
    }
}

/// Value of a partition bookkeeping row.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub entries: u64,
    pub mtime: u64,
}

impl PartitionMeta {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        bincode::deserialize(data).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardfs_common::MODE_REG;

    #[test]
    fn test_entry_row_roundtrip() {
        let row = EntryRow::new(
            "report.txt",
            Stat {
                inode: 12,
                mode: MODE_REG | 0o644,
                ..Default::default()
            },
        );
        let back = EntryRow::from_bytes(&row.to_bytes()).unwrap();
        assert_eq!(back, row);
    }
}
