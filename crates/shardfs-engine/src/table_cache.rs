//! Cache of open table files
//!
//! Opening a table reads its footer, index, and filter; this bounded
//! cache keeps hot handles alive keyed by file number.

use crate::filenames::table_file;
use crate::storage::Storage;
use crate::table::Table;
use lru::LruCache;
use parking_lot::Mutex;
use shardfs_common::{EngineOptions, Result};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

pub struct TableCache {
    storage: Arc<dyn Storage>,
    dir: PathBuf,
    options: EngineOptions,
    cache: Mutex<LruCache<u64, Arc<Table>>>,
}

impl TableCache {
    pub fn new(storage: Arc<dyn Storage>, dir: PathBuf, options: EngineOptions) -> Self {
        let cap = NonZeroUsize::new(options.table_cache_size.max(1)).unwrap();
        Self {
            storage,
            dir,
            options,
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn get(&self, file_number: u64, file_size: u64) -> Result<Arc<Table>> {
        if let Some(table) = self.cache.lock().get(&file_number) {
            return Ok(table.clone());
        }
        let path = table_file(&self.dir, file_number);
        let file = self.storage.new_random_access(&path)?;
        let table = Table::open(file, file_size, &self.options)?;
        self.cache.lock().put(file_number, table.clone());
        Ok(table)
    }

    /// Drop a handle once its file leaves the live version.
    pub fn evict(&self, file_number: u64) {
        self.cache.lock().pop(&file_number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;
    use crate::table::TableBuilder;
    use std::path::Path;

    #[test]
    fn test_cache_returns_same_handle() {
        let storage = MemStorage::new();
        let options = EngineOptions::default();
        let dir = Path::new("/db");
        let path = table_file(dir, 5);
        {
            let mut b = TableBuilder::new(storage.new_writable(&path).unwrap(), options.clone());
            b.add(b"k", b"v").unwrap();
            b.finish().unwrap();
        }
        let size = storage.file_size(&path).unwrap();
        let cache = TableCache::new(storage, dir.to_path_buf(), options);
        let a = cache.get(5, size).unwrap();
        let b = cache.get(5, size).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        cache.evict(5);
        let c = cache.get(5, size).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
