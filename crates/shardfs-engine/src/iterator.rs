//! Internal iterators
//!
//! Every source of internally-keyed entries (memtable, table file,
//! level) exposes the same cursor shape; the merging iterator fans a set
//! of them into one key-ordered stream at a consistent snapshot.

use shardfs_common::Result;

/// A cursor over internally-keyed entries in ascending key order.
pub trait InternalIterator: Send {
    fn valid(&self) -> bool;
    fn seek_to_first(&mut self) -> Result<()>;
    /// Position at the first entry with key >= target.
    fn seek(&mut self, target: &[u8]) -> Result<()>;
    fn next(&mut self) -> Result<()>;
    /// Current internal key. Requires `valid()`.
    fn key(&self) -> &[u8];
    /// Current value. Requires `valid()`.
    fn value(&self) -> &[u8];
}

/// Merges children into a single ascending stream. Ties on identical
/// internal keys break toward the earlier child, so callers order
/// children newest source first.
pub struct MergingIterator {
    children: Vec<Box<dyn InternalIterator>>,
    current: Option<usize>,
}

impl MergingIterator {
    pub fn new(children: Vec<Box<dyn InternalIterator>>) -> Self {
        Self {
            children,
            current: None,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match smallest {
                None => smallest = Some(i),
                Some(s) => {
                    if child.key() < self.children[s].key() {
                        smallest = Some(i);
                    }
                }
            }
        }
        self.current = smallest;
    }
}

impl InternalIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.seek_to_first()?;
        }
        self.find_smallest();
        Ok(())
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        for child in &mut self.children {
            child.seek(target)?;
        }
        self.find_smallest();
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        let Some(cur) = self.current else {
            return Ok(());
        };
        self.children[cur].next()?;
        self.find_smallest();
        Ok(())
    }

    fn key(&self) -> &[u8] {
        self.children[self.current.expect("iterator not positioned")].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.expect("iterator not positioned")].value()
    }
}

/// An iterator over an in-memory list of (key, value) pairs, used for
/// tests and for small synthesized sources.
pub struct VecIterator {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: usize,
}

impl VecIterator {
    /// `entries` must already be sorted by key.
    pub fn new(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].0 <= w[1].0));
        let pos = entries.len();
        Self { entries, pos }
    }
}

impl InternalIterator for VecIterator {
    fn valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    fn seek_to_first(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.pos = self
            .entries
            .partition_point(|(k, _)| k.as_slice() < target);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if self.pos < self.entries.len() {
            self.pos += 1;
        }
        Ok(())
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.pos].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.pos].1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(pairs: &[(&str, &str)]) -> Box<dyn InternalIterator> {
        Box::new(VecIterator::new(
            pairs
                .iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
                .collect(),
        ))
    }

    fn drain(iter: &mut dyn InternalIterator) -> Vec<String> {
        let mut out = Vec::new();
        while iter.valid() {
            out.push(String::from_utf8(iter.key().to_vec()).unwrap());
            iter.next().unwrap();
        }
        out
    }

    #[test]
    fn test_merge_interleaves() {
        let mut merged = MergingIterator::new(vec![
            src(&[("a", "1"), ("d", "1"), ("e", "1")]),
            src(&[("b", "2"), ("c", "2")]),
        ]);
        merged.seek_to_first().unwrap();
        assert_eq!(drain(&mut merged), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_merge_tie_prefers_first_child() {
        let mut merged = MergingIterator::new(vec![src(&[("k", "new")]), src(&[("k", "old")])]);
        merged.seek_to_first().unwrap();
        assert_eq!(merged.value(), b"new");
        merged.next().unwrap();
        assert_eq!(merged.value(), b"old");
    }

    #[test]
    fn test_merge_seek() {
        let mut merged = MergingIterator::new(vec![
            src(&[("a", ""), ("c", "")]),
            src(&[("b", ""), ("d", "")]),
        ]);
        merged.seek(b"b").unwrap();
        assert_eq!(drain(&mut merged), vec!["b", "c", "d"]);
    }
}
