use shardfs_common::{Error, IndexOptions, NameHash, Result, ServerId};

/// Largest bitmap radix; partitions index into [0, 2^16).
const MAX_RADIX: u32 = 16;

/// Wire header: zeroth_server u16 + radix u16, little-endian.
const HEAD_SIZE: usize = 4;

/// Reverse the bits in a byte with 4 operations.
#[inline]
fn reverse_byte(b: u8) -> u8 {
    (((b as u64 * 0x80200802) & 0x0884422110).wrapping_mul(0x0101010101) >> 32) as u8
}

/// The number of bits necessary to hold the given partition index.
///
/// 0 -> 0, 1 -> 1, 2..3 -> 2, 4..7 -> 3, 128..255 -> 8.
#[inline]
fn radix_of(index: u32) -> u32 {
    if index == 0 {
        0
    } else {
        32 - index.leading_zeros()
    }
}

/// The child produced by subdividing `index` at depth `radix`.
#[inline]
fn child_index(index: u32, radix: u32) -> u32 {
    index + (1 << radix)
}

/// The parent of `index` on the binary-split path: clear the topmost set
/// bit. Partition 0 is its own parent.
#[inline]
fn parent_index(index: u32) -> u32 {
    if index == 0 {
        0
    } else {
        index - (1 << (radix_of(index) - 1))
    }
}

/// Map the leading `n` bits of a name hash to a partition index.
///
/// Bit k of the hash becomes bit k of the index, so deeper hash bits
/// land in higher index positions:
///
/// ```text
/// |<---------------  hash  --------------->|
/// [ - 1st  byte - ][ - 2nd  byte - ][] .. []
/// |<------- n bits -------->|
/// ```
fn index_from_hash(hash: &[u8], n: u32) -> u32 {
    debug_assert!(n <= MAX_RADIX);
    debug_assert!(hash.len() * 8 >= n as usize);
    let mut result: u32 = 0;
    let nbytes = (n / 8) as usize;
    for (i, &b) in hash.iter().take(nbytes).enumerate() {
        result += (reverse_byte(b) as u32) << (i * 8);
    }
    let nbits = n % 8;
    if nbits > 0 {
        result += ((reverse_byte(hash[nbytes]) as u32) & ((1 << nbits) - 1)) << (nbytes * 8);
    }
    result
}

/// Fixed permutation spreading consecutive partition ids across distinct
/// servers: reverse the index bits within the virtual-server radix.
pub fn mixed_permutation(index: u32, num_virtual_servers: u32) -> u32 {
    debug_assert!(num_virtual_servers.is_power_of_two());
    let width = num_virtual_servers.trailing_zeros();
    if width == 0 {
        return 0;
    }
    index.reverse_bits() >> (32 - width)
}

/// A directory's partition index: which partitions are live splits, and
/// the deterministic name -> partition -> server mapping on top.
///
/// Uniquely owned by the server hosting the directory's partition zero;
/// clients and peers hold merge-monotone copies.
#[derive(Clone, Debug)]
pub struct DirIndex {
    zeroth_server: u16,
    radix: u16,
    bitmap: Vec<u8>,
    options: IndexOptions,
}

impl DirIndex {
    /// Create a fresh index with only partition 0 live.
    pub fn new(zeroth_server: ServerId, options: IndexOptions) -> Self {
        let options = options.sanitize();
        let mut index = Self {
            zeroth_server,
            radix: 0,
            bitmap: vec![0u8; 1],
            options,
        };
        index.turn_on(0);
        index
    }

    /// Decode a wire image, validating its invariants.
    pub fn decode(input: &[u8], options: IndexOptions) -> Result<Self> {
        let options = options.sanitize();
        if input.len() < HEAD_SIZE {
            return Err(Error::corruption("partition index too short"));
        }
        let zeroth_server = u16::from_le_bytes([input[0], input[1]]);
        let radix = u16::from_le_bytes([input[2], input[3]]);
        if radix as u32 > MAX_RADIX {
            return Err(Error::corruption("partition index radix out of range"));
        }
        let bitmap = input[HEAD_SIZE..].to_vec();
        let want = bitmap_len(radix as u32);
        if bitmap.len() < want {
            return Err(Error::corruption("partition index bitmap truncated"));
        }
        let index = Self {
            zeroth_server,
            radix,
            bitmap,
            options,
        };
        if !index.is_set(0) {
            return Err(Error::corruption("partition 0 missing from index"));
        }
        if index.options.paranoid_checks {
            if index.radix as u32 != radix_of(index.highest_bit()) {
                return Err(Error::corruption("partition index radix mismatch"));
            }
            index.check_ancestors()?;
        }
        Ok(index)
    }

    /// Wire image of this index: fixed header + variable bitmap.
    pub fn encode(&self) -> Vec<u8> {
        let n = bitmap_len(self.radix as u32);
        let mut out = Vec::with_capacity(HEAD_SIZE + n);
        out.extend_from_slice(&self.zeroth_server.to_le_bytes());
        out.extend_from_slice(&self.radix.to_le_bytes());
        out.extend_from_slice(&self.bitmap[..n]);
        out
    }

    pub fn zeroth_server(&self) -> ServerId {
        self.zeroth_server
    }

    pub fn radix(&self) -> u32 {
        self.radix as u32
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// True iff the bit of the given partition is set.
    pub fn is_set(&self, index: u32) -> bool {
        let i = index as usize;
        if i < self.bitmap.len() * 8 {
            self.bitmap[i / 8] & (1 << (i % 8)) != 0
        } else {
            false
        }
    }

    /// Mark a partition live. The caller is responsible for only setting
    /// bits whose parent partition already exists.
    pub fn set(&mut self, index: u32) {
        debug_assert!(index < self.options.num_virtual_servers);
        debug_assert!(index == 0 || self.is_set(parent_index(index)));
        self.turn_on(index);
    }

    fn turn_on(&mut self, index: u32) {
        let i = index as usize;
        if i >= self.bitmap.len() * 8 {
            let mut new_len = self.bitmap.len().max(1);
            while i >= new_len * 8 {
                new_len *= 2;
            }
            self.bitmap.resize(new_len, 0);
        }
        self.bitmap[i / 8] |= 1 << (i % 8);
        let r = radix_of(index) as u16;
        if self.radix < r {
            self.radix = r;
        }
    }

    /// Index of the deepest live partition.
    pub fn highest_bit(&self) -> u32 {
        for (i, &b) in self.bitmap.iter().enumerate().rev() {
            if b != 0 {
                return (i * 8) as u32 + (7 - b.leading_zeros());
            }
        }
        0
    }

    /// Merge another index of the same directory into this one by
    /// bitwise OR. Returns true iff any new bit was set. Commutative,
    /// associative, and idempotent.
    pub fn merge(&mut self, other: &DirIndex) -> Result<bool> {
        if self.zeroth_server != other.zeroth_server {
            return Err(Error::invalid_argument(
                "cannot merge indices of different directories",
            ));
        }
        if self.bitmap.len() < other.bitmap.len() {
            self.bitmap.resize(other.bitmap.len(), 0);
        }
        let mut changed = false;
        for (i, &b) in other.bitmap.iter().enumerate() {
            let merged = self.bitmap[i] | b;
            if merged != self.bitmap[i] {
                self.bitmap[i] = merged;
                changed = true;
            }
        }
        if other.radix > self.radix {
            self.radix = other.radix;
        }
        Ok(changed)
    }

    /// Merge a wire-encoded index delta, as received piggybacked on an
    /// RPC reply. Returns true iff the merge revealed new partitions.
    pub fn merge_encoded(&mut self, input: &[u8]) -> Result<bool> {
        let other = DirIndex::decode(input, self.options.clone())?;
        self.merge(&other)
    }

    /// The partition responsible for the given name hash: take the
    /// leading `radix` bits, then clear the topmost set bit until a live
    /// partition is reached.
    pub fn partition_of(&self, hash: &NameHash) -> u32 {
        debug_assert!(self.is_set(0));
        let mut i = index_from_hash(hash.as_bytes(), self.radix as u32);
        while !self.is_set(i) {
            i = parent_index(i);
        }
        i
    }

    /// The server responsible for the given partition.
    pub fn server_for_partition(&self, index: u32) -> ServerId {
        let v = self.options.num_virtual_servers;
        let n = self.options.num_servers;
        let spread = mixed_permutation(index, v);
        ((self.zeroth_server as u32 + spread) % n) as ServerId
    }

    /// The server responsible for the given name.
    pub fn select_server(&self, name: &str) -> ServerId {
        self.hash_to_server(&NameHash::of(name))
    }

    /// The server responsible for the given name hash.
    pub fn hash_to_server(&self, hash: &NameHash) -> ServerId {
        self.server_for_partition(self.partition_of(hash))
    }

    /// True if the given partition can be subdivided further. Partitions
    /// that are not live are never splittable.
    pub fn is_splittable(&self, index: u32) -> bool {
        self.child_for_split(index).is_some()
    }

    /// The next child partition a split of `index` would produce, if the
    /// bitmap still has room for one.
    pub fn child_for_split(&self, index: u32) -> Option<u32> {
        if !self.is_set(index) {
            return None;
        }
        let mut r = radix_of(index);
        while r < MAX_RADIX {
            let child = child_index(index, r);
            if child >= self.options.num_virtual_servers {
                return None;
            }
            if !self.is_set(child) {
                return Some(child);
            }
            r += 1;
        }
        None
    }

    /// True if an entry with this hash moves to child partition `child`
    /// when the child's parent splits. Testable locally: the leading
    /// `radix_of(child)` bits of the hash must spell the child exactly.
    pub fn to_be_migrated(child: u32, hash: &NameHash) -> bool {
        index_from_hash(hash.as_bytes(), radix_of(child)) == child
    }

    fn check_ancestors(&self) -> Result<()> {
        let top = self.highest_bit();
        for i in 1..=top {
            if self.is_set(i) && !self.is_set(parent_index(i)) {
                return Err(Error::corruption(format!(
                    "partition {i} live without its parent"
                )));
            }
        }
        Ok(())
    }
}

fn bitmap_len(radix: u32) -> usize {
    (((1usize << radix) + 7) / 8).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardfs_common::IndexOptions;

    fn opts(n: u32, v: u32) -> IndexOptions {
        IndexOptions {
            num_servers: n,
            num_virtual_servers: v,
            paranoid_checks: true,
        }
    }

    #[test]
    fn test_radix_helpers() {
        assert_eq!(radix_of(0), 0);
        assert_eq!(radix_of(1), 1);
        assert_eq!(radix_of(2), 2);
        assert_eq!(radix_of(3), 2);
        assert_eq!(radix_of(7), 3);
        assert_eq!(radix_of(255), 8);

        assert_eq!(child_index(0, 0), 1);
        assert_eq!(child_index(1, 1), 3);
        assert_eq!(child_index(3, 2), 7);
        assert_eq!(child_index(2, 2), 6);

        assert_eq!(parent_index(0), 0);
        assert_eq!(parent_index(1), 0);
        assert_eq!(parent_index(3), 1);
        assert_eq!(parent_index(6), 2);
        assert_eq!(parent_index(129), 1);
    }

    #[test]
    fn test_new_index_only_root() {
        let idx = DirIndex::new(0, opts(4, 1024));
        assert!(idx.is_set(0));
        assert!(!idx.is_set(1));
        assert_eq!(idx.radix(), 0);
        assert_eq!(idx.highest_bit(), 0);
    }

    #[test]
    fn test_split_chain() {
        let mut idx = DirIndex::new(0, opts(4, 1024));
        // First split of the root is partition 1.
        assert_eq!(idx.child_for_split(0), Some(1));
        idx.set(1);
        // The root's next split is partition 2; partition 1 splits to 3.
        assert_eq!(idx.child_for_split(0), Some(2));
        assert_eq!(idx.child_for_split(1), Some(3));
        idx.set(3);
        assert_eq!(idx.radix(), 2);
        assert_eq!(idx.highest_bit(), 3);
    }

    #[test]
    fn test_split_capacity_bound() {
        let mut idx = DirIndex::new(0, opts(2, 2));
        assert_eq!(idx.child_for_split(0), Some(1));
        idx.set(1);
        // V = 2 is exhausted: nothing is splittable anymore.
        assert!(!idx.is_splittable(0));
        assert!(!idx.is_splittable(1));
    }

    #[test]
    fn test_routing_only_live_partitions() {
        let mut idx = DirIndex::new(0, opts(4, 1024));
        idx.set(1);
        idx.set(2);
        for name in ["a", "b", "c", "d", "e", "zebra", "x/y"] {
            let h = NameHash::of(name);
            let p = idx.partition_of(&h);
            assert!(idx.is_set(p), "routed {name} to dead partition {p}");
        }
    }

    #[test]
    fn test_routing_stays_put_after_unrelated_split() {
        // Monotone routing: a name keeps resolving to its partition as
        // long as that partition stays live in the merged index.
        let mut idx = DirIndex::new(0, opts(4, 1024));
        idx.set(1);
        let h = NameHash::of("stable-name");
        let before = idx.partition_of(&h);
        let mut wider = idx.clone();
        // Split a partition the name does not live in.
        let victim = if before == 0 { 1 } else { 0 };
        if let Some(c) = wider.child_for_split(victim) {
            wider.set(c);
        }
        if wider.is_set(before) {
            assert_eq!(wider.partition_of(&h), before);
        }
    }

    #[test]
    fn test_migration_predicate_dichotomy() {
        // After a split, each row stays or moves; never both, never
        // neither.
        let mut idx = DirIndex::new(0, opts(4, 1024));
        let child = idx.child_for_split(0).unwrap();
        for i in 0..500u32 {
            let h = NameHash::of(&format!("file-{i}"));
            let before = idx.partition_of(&h);
            assert_eq!(before, 0);
            let mut post = idx.clone();
            post.set(child);
            let after = post.partition_of(&h);
            if DirIndex::to_be_migrated(child, &h) {
                assert_eq!(after, child);
            } else {
                assert_eq!(after, 0);
            }
        }
        idx.set(child);
    }

    #[test]
    fn test_merge_is_or() {
        let mut a = DirIndex::new(3, opts(4, 1024));
        let mut b = DirIndex::new(3, opts(4, 1024));
        a.set(1);
        b.set(1);
        b.set(3);
        let changed = a.merge(&b).unwrap();
        assert!(changed);
        assert!(a.is_set(3));
        // Re-merging is idempotent.
        assert!(!a.merge(&b).unwrap());
    }

    #[test]
    fn test_merge_rejects_foreign_directory() {
        let mut a = DirIndex::new(0, opts(4, 1024));
        let b = DirIndex::new(1, opts(4, 1024));
        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn test_encode_decode() {
        let mut idx = DirIndex::new(2, opts(4, 1024));
        idx.set(1);
        idx.set(3);
        idx.set(2);
        let img = idx.encode();
        let back = DirIndex::decode(&img, opts(4, 1024)).unwrap();
        assert_eq!(back.zeroth_server(), 2);
        assert_eq!(back.radix(), idx.radix());
        for i in 0..8 {
            assert_eq!(back.is_set(i), idx.is_set(i));
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let o = opts(4, 1024);
        assert!(DirIndex::decode(&[], o.clone()).is_err());
        assert!(DirIndex::decode(&[0, 0], o.clone()).is_err());
        // Header claims radix 3 but carries an empty bitmap.
        let bogus = [0u8, 0, 3, 0];
        assert!(DirIndex::decode(&bogus, o).is_err());
    }

    #[test]
    fn test_decode_rejects_orphan_partition() {
        // Bit 3 live without bit 1 violates the ancestor invariant.
        let mut img = vec![0u8, 0, 2, 0];
        img.push(0b0000_1001);
        assert!(DirIndex::decode(&img, opts(4, 1024)).is_err());
    }

    #[test]
    fn test_server_mapping_in_range() {
        let mut idx = DirIndex::new(3, opts(5, 1024));
        idx.set(1);
        idx.set(2);
        idx.set(3);
        for i in [0u32, 1, 2, 3] {
            assert!(idx.server_for_partition(i) < 5);
        }
    }

    #[test]
    fn test_permutation_spreads_first_splits() {
        // The first few splits of a fresh directory should not pile onto
        // adjacent servers.
        let v = 1024;
        let p0 = mixed_permutation(0, v);
        let p1 = mixed_permutation(1, v);
        let p2 = mixed_permutation(2, v);
        assert_eq!(p0, 0);
        assert_eq!(p1, v / 2);
        assert_eq!(p2, v / 4);
    }

    #[test]
    fn test_select_server_total_across_cluster_sizes() {
        // Rows written under N=4 must still be locatable under N=6.
        for n in [1u32, 4, 6, 16] {
            let idx = DirIndex::new(0, opts(n, 1024));
            for name in ["a", "b", "c"] {
                assert!((idx.select_server(name) as u32) < n);
            }
        }
    }
}
