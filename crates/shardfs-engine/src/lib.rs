//! ShardFS Engine - log-structured metadata store
//!
//! A per-server LSM tree tuned for filesystem metadata rows: a
//! block-checksummed write-ahead log, a skip-list memtable, prefix-
//! compressed table files with Bloom filters, a version manifest, and
//! level compaction with seek-triggered victims. Directory splits
//! bulk-ingest pre-built tables straight into level 0.

pub mod batch;
pub mod bloom;
pub mod block;
pub mod coding;
pub mod db;
pub mod filenames;
pub mod filter_block;
pub mod iterator;
pub mod key;
pub mod log;
pub mod memtable;
pub mod readonly;
pub mod snapshot;
pub mod storage;
pub mod table;
pub mod table_cache;
pub mod version;
pub mod version_set;

pub use batch::WriteBatch;
pub use db::{Engine, EngineIterator};
pub use key::{entry_key, entry_range, index_key, partition_meta_key, super_key, RowType, ValueKind};
pub use readonly::ReadonlyEngine;
pub use snapshot::Snapshot;
pub use storage::{FsStorage, MemStorage, Storage};
pub use table::{Table, TableBuilder};
