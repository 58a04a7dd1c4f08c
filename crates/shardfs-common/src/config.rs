//! Configuration types for ShardFS
//!
//! Every component takes an explicit options struct with enumerated
//! fields. Out-of-range numeric options are clamped to documented bounds
//! at construction time via `sanitize()` rather than rejected.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Upper bound on physical and virtual servers
pub const MAX_SERVERS: u32 = 65_536;

/// Directory partition scale options
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexOptions {
    /// Number of physical servers. May change between cluster restarts;
    /// the index rebalances itself. Valid values are [1, 65536].
    pub num_servers: u32,
    /// Number of virtual servers (partitions). Fixed for the lifetime of
    /// a directory. Valid values are [num_servers, 65536].
    pub num_virtual_servers: u32,
    /// Aggressively validate decoded indices and stop early on errors
    pub paranoid_checks: bool,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            num_servers: 1,
            num_virtual_servers: 1024,
            paranoid_checks: false,
        }
    }
}

impl IndexOptions {
    /// Clamp all fields to their documented bounds
    pub fn sanitize(mut self) -> Self {
        self.num_servers = self.num_servers.clamp(1, MAX_SERVERS);
        self.num_virtual_servers = self
            .num_virtual_servers
            .clamp(self.num_servers, MAX_SERVERS)
            .next_power_of_two();
        self
    }
}

/// Lookup-lease table options
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseOptions {
    /// Lease TTL upper bound, microseconds. Writers blocked on a locked
    /// lease wait at most this long.
    pub max_lease_duration: u64,
    /// Lease table capacity
    pub max_num_leases: usize,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            max_lease_duration: 1_000_000, // 1 s
            max_num_leases: 4096,
        }
    }
}

impl LeaseOptions {
    pub fn sanitize(mut self) -> Self {
        self.max_lease_duration = self.max_lease_duration.clamp(1_000, 60_000_000);
        self.max_num_leases = self.max_num_leases.clamp(16, 1 << 24);
        self
    }
}

/// Metadata key-value engine options
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Memtable size before rotation, bytes
    pub write_buffer_size: usize,
    /// Approximate uncompressed size of a table data block
    pub block_size: usize,
    /// Number of keys between restart points for delta encoding
    pub block_restart_interval: usize,
    /// Bloom filter bits per key; 0 disables the filter block
    pub filter_bits_per_key: usize,
    /// Per-level size ratio; level k holds level_factor^k * base bytes
    pub level_factor: u64,
    /// L0 file count that starts slowing writers down
    pub l0_soft_limit: usize,
    /// L0 file count that stalls writers entirely
    pub l0_hard_limit: usize,
    /// Read-mostly mode: never schedule background compaction
    pub disable_compaction: bool,
    /// Extra validation on decode paths
    pub paranoid_checks: bool,
    /// Table-handle cache capacity (open table files)
    pub table_cache_size: usize,
    /// Sync the WAL on every write batch
    pub sync_writes: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            write_buffer_size: 4 * 1024 * 1024,
            block_size: 4 * 1024,
            block_restart_interval: 16,
            filter_bits_per_key: 10,
            level_factor: 10,
            l0_soft_limit: 8,
            l0_hard_limit: 12,
            disable_compaction: false,
            paranoid_checks: false,
            table_cache_size: 500,
            sync_writes: true,
        }
    }
}

impl EngineOptions {
    pub fn sanitize(mut self) -> Self {
        self.write_buffer_size = self.write_buffer_size.clamp(64 * 1024, 1 << 30);
        self.block_size = self.block_size.clamp(1024, 4 * 1024 * 1024);
        self.block_restart_interval = self.block_restart_interval.clamp(1, 128);
        self.filter_bits_per_key = self.filter_bits_per_key.min(32);
        self.level_factor = self.level_factor.clamp(2, 64);
        self.l0_soft_limit = self.l0_soft_limit.clamp(2, 256);
        self.l0_hard_limit = self.l0_hard_limit.max(self.l0_soft_limit + 1);
        self.table_cache_size = self.table_cache_size.clamp(16, 1 << 20);
        self
    }
}

/// RPC transport options
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetOptions {
    /// Client-side call deadline, milliseconds
    pub rpc_timeout_ms: u64,
    /// Maximum UDP payload carried per request datagram
    pub udp_max_snd_msgsz: usize,
    /// Maximum UDP payload accepted per response datagram
    pub udp_max_rcv_msgsz: usize,
    /// RPC progress (I/O) threads per server
    pub io_threads: usize,
    /// Handler callback threads per server
    pub worker_threads: usize,
}

impl Default for NetOptions {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 5_000,
            udp_max_snd_msgsz: 1432,
            udp_max_rcv_msgsz: 1432,
            io_threads: 2,
            worker_threads: 4,
        }
    }
}

impl NetOptions {
    pub fn sanitize(mut self) -> Self {
        self.rpc_timeout_ms = self.rpc_timeout_ms.clamp(10, 600_000);
        self.udp_max_snd_msgsz = self.udp_max_snd_msgsz.clamp(512, 65_000);
        self.udp_max_rcv_msgsz = self.udp_max_rcv_msgsz.clamp(512, 65_000);
        self.io_threads = self.io_threads.clamp(1, 64);
        self.worker_threads = self.worker_threads.clamp(1, 256);
        self
    }
}

/// Per-server configuration for the metadata service
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// This server's id in [0, num_servers)
    pub server_id: u16,
    /// Data directory for the local engine
    pub data_dir: PathBuf,
    /// Partition entry count that triggers a split
    pub split_threshold: u64,
    /// Directory-control table capacity
    pub max_num_dirs: usize,
    pub index: IndexOptions,
    pub lease: LeaseOptions,
    pub engine: EngineOptions,
    pub net: NetOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            server_id: 0,
            data_dir: PathBuf::from("./shardfs-data"),
            split_threshold: 2_000,
            max_num_dirs: 4096,
            index: IndexOptions::default(),
            lease: LeaseOptions::default(),
            engine: EngineOptions::default(),
            net: NetOptions::default(),
        }
    }
}

impl ServerOptions {
    pub fn sanitize(mut self) -> Self {
        self.index = self.index.sanitize();
        self.lease = self.lease.sanitize();
        self.engine = self.engine.sanitize();
        self.net = self.net.sanitize();
        self.split_threshold = self.split_threshold.max(16);
        self.max_num_dirs = self.max_num_dirs.clamp(16, 1 << 24);
        self
    }
}
