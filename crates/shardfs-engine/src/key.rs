//! Metadata row keys
//!
//! A row key has a 16-byte prefix and a suffix. The prefix packs the
//! parent directory identity and the row type so that one directory's
//! rows of one type are a single contiguous range:
//!
//! ```text
//! [ registry  u64 BE ][ dirno<<8 | row type  u64 BE ][ suffix ]
//! ```
//!
//! Directory-entry rows suffix the 16-byte name hash; partition-metadata
//! rows suffix the partition id. Directory numbers occupy 56 bits.
//!
//! Internally the engine appends an 8-byte sequence tag encoded as
//! `u64::MAX - (seq << 8 | value_type)` big-endian, so plain bytewise
//! comparison orders rows by (user key ascending, sequence descending).

use shardfs_common::{DirId, NameHash, SequenceNo};

/// Row types stored in the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RowType {
    /// File or directory entry with embedded inode attributes
    DirEnt = 1,
    /// A directory's persisted partition index image
    DirIdx = 2,
    /// Per-partition bookkeeping (entry count, mtime)
    DirMeta = 3,
    /// Server-wide bookkeeping (inode allocator)
    Super = 4,
}

/// Whether an internal entry carries a value or a tombstone
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueKind {
    Deletion = 0,
    Value = 1,
}

impl ValueKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Deletion),
            1 => Some(Self::Value),
            _ => None,
        }
    }
}

pub const KEY_PREFIX_LEN: usize = 16;
const SEQ_TAG_LEN: usize = 8;

/// Largest tag byte, used when seeking: positions the cursor at the
/// newest entry visible at a snapshot.
const SEEK_KIND: u64 = 0xff;

fn pack_prefix(dst: &mut Vec<u8>, dir: DirId, row_type: RowType) {
    debug_assert!(dir.dirno < 1 << 56);
    dst.extend_from_slice(&dir.registry.to_be_bytes());
    dst.extend_from_slice(&((dir.dirno << 8) | row_type as u64).to_be_bytes());
}

/// Key of a directory-entry row.
pub fn entry_key(dir: DirId, hash: &NameHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_PREFIX_LEN + 16);
    pack_prefix(&mut key, dir, RowType::DirEnt);
    key.extend_from_slice(hash.as_bytes());
    key
}

/// Key of a directory's persisted partition-index row.
pub fn index_key(dir: DirId) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_PREFIX_LEN);
    pack_prefix(&mut key, dir, RowType::DirIdx);
    key
}

/// Key of a partition's bookkeeping row.
pub fn partition_meta_key(dir: DirId, partition: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_PREFIX_LEN + 8);
    pack_prefix(&mut key, dir, RowType::DirMeta);
    key.extend_from_slice(&(partition as u64).to_be_bytes());
    key
}

/// Key of the server's superblock row.
pub fn super_key() -> Vec<u8> {
    let mut key = Vec::with_capacity(KEY_PREFIX_LEN);
    pack_prefix(&mut key, DirId::new(0, 0), RowType::Super);
    key
}

/// Half-open user-key range covering every entry row of a directory.
pub fn entry_range(dir: DirId) -> (Vec<u8>, Vec<u8>) {
    let mut begin = Vec::with_capacity(KEY_PREFIX_LEN);
    pack_prefix(&mut begin, dir, RowType::DirEnt);
    let mut end = begin.clone();
    // The prefix never ends in 0xff: the low byte is the row type.
    let last = end.len() - 1;
    end[last] += 1;
    (begin, end)
}

/// Parse the directory and row type out of a user key.
pub fn parse_prefix(user_key: &[u8]) -> Option<(DirId, RowType)> {
    if user_key.len() < KEY_PREFIX_LEN {
        return None;
    }
    let registry = u64::from_be_bytes(user_key[..8].try_into().ok()?);
    let packed = u64::from_be_bytes(user_key[8..16].try_into().ok()?);
    let row_type = match (packed & 0xff) as u8 {
        1 => RowType::DirEnt,
        2 => RowType::DirIdx,
        3 => RowType::DirMeta,
        4 => RowType::Super,
        _ => return None,
    };
    Some((DirId::new(registry, packed >> 8), row_type))
}

/// Name hash suffix of an entry-row user key.
pub fn parse_entry_hash(user_key: &[u8]) -> Option<NameHash> {
    if user_key.len() != KEY_PREFIX_LEN + 16 {
        return None;
    }
    let bytes: [u8; 16] = user_key[KEY_PREFIX_LEN..].try_into().ok()?;
    Some(NameHash::from_bytes(bytes))
}

// ---------------------------------------------------------------------
// Internal keys
// ---------------------------------------------------------------------

fn seq_tag(seq: SequenceNo, kind: u64) -> [u8; 8] {
    debug_assert!(seq < 1 << 56);
    (u64::MAX - ((seq << 8) | kind)).to_be_bytes()
}

/// Build the internal key for an entry written at `seq`.
pub fn internal_key(user_key: &[u8], seq: SequenceNo, kind: ValueKind) -> Vec<u8> {
    let mut out = Vec::with_capacity(user_key.len() + SEQ_TAG_LEN);
    out.extend_from_slice(user_key);
    out.extend_from_slice(&seq_tag(seq, kind as u64));
    out
}

/// Build the key that seeks to the newest entry of `user_key` visible at
/// snapshot `seq`.
pub fn lookup_key(user_key: &[u8], seq: SequenceNo) -> Vec<u8> {
    let mut out = Vec::with_capacity(user_key.len() + SEQ_TAG_LEN);
    out.extend_from_slice(user_key);
    out.extend_from_slice(&seq_tag(seq, SEEK_KIND));
    out
}

/// The user-key part of an internal key.
pub fn user_key(internal: &[u8]) -> &[u8] {
    debug_assert!(internal.len() >= SEQ_TAG_LEN);
    &internal[..internal.len() - SEQ_TAG_LEN]
}

/// The (sequence, kind) tag of an internal key. Unknown kind bytes map
/// to None.
pub fn parse_tag(internal: &[u8]) -> Option<(SequenceNo, ValueKind)> {
    if internal.len() < SEQ_TAG_LEN {
        return None;
    }
    let raw = u64::from_be_bytes(internal[internal.len() - SEQ_TAG_LEN..].try_into().ok()?);
    let tag = u64::MAX - raw;
    ValueKind::from_u8((tag & 0xff) as u8).map(|kind| (tag >> 8, kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_roundtrip() {
        let dir = DirId::new(3, 77);
        let hash = NameHash::of("child");
        let key = entry_key(dir, &hash);
        let (d, t) = parse_prefix(&key).unwrap();
        assert_eq!(d, dir);
        assert_eq!(t, RowType::DirEnt);
        assert_eq!(parse_entry_hash(&key).unwrap(), hash);
    }

    #[test]
    fn test_entry_range_covers_only_this_dir() {
        let dir = DirId::new(1, 10);
        let (begin, end) = entry_range(dir);
        let inside = entry_key(dir, &NameHash::of("x"));
        let other = entry_key(DirId::new(1, 11), &NameHash::of("x"));
        let idx = index_key(dir);
        assert!(begin.as_slice() <= inside.as_slice() && inside.as_slice() < end.as_slice());
        assert!(!(begin.as_slice() <= other.as_slice() && other.as_slice() < end.as_slice()));
        // Index rows sort outside the entry range.
        assert!(!(begin.as_slice() <= idx.as_slice() && idx.as_slice() < end.as_slice()));
    }

    #[test]
    fn test_internal_ordering_newest_first() {
        let user = entry_key(DirId::new(0, 1), &NameHash::of("f"));
        let old = internal_key(&user, 5, ValueKind::Value);
        let newer = internal_key(&user, 9, ValueKind::Deletion);
        // Bytewise order puts the higher sequence first.
        assert!(newer < old);

        let (seq, kind) = parse_tag(&newer).unwrap();
        assert_eq!(seq, 9);
        assert_eq!(kind, ValueKind::Deletion);
        assert_eq!(user_key(&newer), user.as_slice());
    }

    #[test]
    fn test_lookup_key_lands_before_visible() {
        let user = entry_key(DirId::new(0, 1), &NameHash::of("f"));
        let seek = lookup_key(&user, 7);
        let at7 = internal_key(&user, 7, ValueKind::Value);
        let at8 = internal_key(&user, 8, ValueKind::Value);
        // Seeking at snapshot 7 must skip sequence 8 and admit 7.
        assert!(at8 < seek);
        assert!(seek <= at7);
    }

    #[test]
    fn test_different_dirs_cluster() {
        let a1 = entry_key(DirId::new(0, 1), &NameHash::of("zz"));
        let a2 = entry_key(DirId::new(0, 1), &NameHash::of("aa"));
        let b = entry_key(DirId::new(0, 2), &NameHash::of("aa"));
        assert!(a1.as_slice() < b.as_slice());
        assert!(a2.as_slice() < b.as_slice());
    }
}
