//! ShardFS Server - directory control and RPC service
//!
//! Each metadata server owns a local engine, a lease table, and the
//! control blocks of the directories it hosts partitions for. Splits
//! of overflowing partitions ship level-0-ready tables to the child's
//! server and propagate the new partition index by gossip on replies.

pub mod dir_control;
pub mod rows;
pub mod service;

pub use dir_control::{DirControl, DirTable};
pub use rows::{EntryRow, PartitionMeta, SuperRow};
pub use service::MetaServer;
