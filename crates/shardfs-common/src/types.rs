//! Core identity and attribute types shared across ShardFS components

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Physical metadata server id, in `[0, num_servers)`
pub type ServerId = u16;

/// Inode number, unique per registry
pub type InodeNo = u64;

/// Globally monotonic per-server write sequence number
pub type SequenceNo = u64;

/// 128-bit directory identity, assigned at creation and immutable.
///
/// The pair is (registry id, directory number). Two directories never
/// share an id even across cluster restarts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirId {
    pub registry: u64,
    pub dirno: u64,
}

impl DirId {
    pub fn new(registry: u64, dirno: u64) -> Self {
        Self { registry, dirno }
    }

    /// Deterministic pseudo-random zeroth server for this directory.
    ///
    /// Recomputed from (id, num_servers) whenever the cluster size
    /// changes, so the formula stays total across restarts.
    pub fn zeroth_server(&self, num_servers: u32) -> ServerId {
        debug_assert!(num_servers > 0);
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.registry.to_le_bytes());
        buf[8..].copy_from_slice(&self.dirno.to_le_bytes());
        let h = xxhash_rust::xxh3::xxh3_64(&buf);
        (h % num_servers.max(1) as u64) as ServerId
    }
}

impl fmt::Display for DirId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.registry, self.dirno)
    }
}

/// 128-bit pseudorandom hash of a child name.
///
/// Only the leading bits are inspected for partitioning; the full value
/// keys metadata rows and lease entries.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NameHash(pub [u8; 16]);

impl NameHash {
    /// Hash a child name
    pub fn of(name: &str) -> Self {
        Self(xxhash_rust::xxh3::xxh3_128(name.as_bytes()).to_be_bytes())
    }

    /// Raw bytes, leading bytes first
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for NameHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Display for NameHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// File type and permission bits, POSIX-shaped
pub const MODE_DIR: u32 = 0o040000;
pub const MODE_REG: u32 = 0o100000;

/// Inode attributes stored as the value of a directory-entry row.
///
/// Small files may carry their contents inline; everything else stores
/// only attributes here.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub inode: InodeNo,
    pub size: u64,
    /// File type and access modes
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Absolute time in microseconds
    pub mtime: u64,
    pub ctime: u64,
    /// Server hosting partition zero of this entry, if it is a directory
    pub zeroth_server: u16,
    /// Inline contents for small files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Vec<u8>>,
}

impl Stat {
    pub fn is_dir(&self) -> bool {
        self.mode & MODE_DIR != 0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        bincode::deserialize(data).ok()
    }
}

/// The payload of a lookup reply: the attributes a client may cache
/// under a lease, plus the lease deadline.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupStat {
    pub inode: InodeNo,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Only meaningful when the child is itself a directory
    pub zeroth_server: u16,
    /// Absolute lease deadline, microseconds since the epoch
    pub lease_due: u64,
}

impl LookupStat {
    pub fn from_stat(stat: &Stat, lease_due: u64) -> Self {
        Self {
            inode: stat.inode,
            mode: stat.mode,
            uid: stat.uid,
            gid: stat.gid,
            zeroth_server: stat.zeroth_server,
            lease_due,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & MODE_DIR != 0
    }
}

/// Wall-clock microseconds since the Unix epoch.
///
/// Clocks across the cluster are assumed loosely synchronized within a
/// bound well below the lease duration; see the lease table contract.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_hash_deterministic() {
        let a = NameHash::of("hello");
        let b = NameHash::of("hello");
        let c = NameHash::of("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_zeroth_server_total() {
        // The formula must be total for any cluster size.
        let id = DirId::new(7, 42);
        for n in 1..=64u32 {
            let s = id.zeroth_server(n);
            assert!((s as u32) < n);
        }
        // And stable for a fixed size.
        assert_eq!(id.zeroth_server(8), id.zeroth_server(8));
    }

    #[test]
    fn test_stat_roundtrip() {
        let stat = Stat {
            inode: 99,
            size: 4096,
            mode: MODE_DIR | 0o755,
            uid: 1000,
            gid: 1000,
            mtime: 123_456,
            ctime: 123_456,
            zeroth_server: 3,
            inline_data: None,
        };
        let bytes = stat.to_bytes();
        let back = Stat::from_bytes(&bytes).unwrap();
        assert_eq!(back, stat);
        assert!(back.is_dir());
    }

    #[test]
    fn test_stat_inline_data() {
        let stat = Stat {
            inode: 1,
            size: 5,
            mode: MODE_REG | 0o644,
            inline_data: Some(b"hello".to_vec()),
            ..Default::default()
        };
        let back = Stat::from_bytes(&stat.to_bytes()).unwrap();
        assert_eq!(back.inline_data.as_deref(), Some(&b"hello"[..]));
        assert!(!back.is_dir());
    }
}
