//! ShardFS Client - cached routing and lookup leases
//!
//! The client routes each operation by hashing the name against its
//! cached partition index for the directory, answers repeat lookups
//! from its own lease table while leases are fresh, and merges the
//! index image piggybacked on every reply. A stale route costs one
//! extra hop: the touched server forwards and the merged reply steers
//! the next call directly.

use parking_lot::Mutex;
use shardfs_common::{
    now_micros, DirId, Error, IndexOptions, LeaseOptions, LookupStat, NameHash, NetOptions,
    Result, Stat,
};
use shardfs_index::DirIndex;
use shardfs_lease::{LeaseKey, LeaseLookup, SyncLeaseTable};
use shardfs_proto::{
    ChangeReply, DirListEntry, GetattrReply, GetattrRequest, LookupReply, LookupRequest, Message,
    MkdirRequest, MknodRequest, OpCode, ReaddirReply, ReaddirRequest, UdpClient, UnlinkReply,
    UnlinkRequest,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::debug;

pub struct ClientOptions {
    pub index: IndexOptions,
    pub lease: LeaseOptions,
    pub net: NetOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            index: IndexOptions::default(),
            lease: LeaseOptions::default(),
            net: NetOptions::default(),
        }
    }
}

pub struct MetaClient {
    options: ClientOptions,
    servers: Vec<SocketAddr>,
    rpc: UdpClient,
    /// Merge-monotone copies of directory partition indices.
    indices: Mutex<HashMap<DirId, DirIndex>>,
    /// Client-side lookup leases.
    leases: SyncLeaseTable,
}

impl MetaClient {
    pub fn new(servers: Vec<SocketAddr>, options: ClientOptions) -> Self {
        let rpc = UdpClient::new(options.net.clone());
        let leases = SyncLeaseTable::client(options.lease.clone());
        Self {
            options,
            servers,
            rpc,
            indices: Mutex::new(HashMap::new()),
            leases,
        }
    }

    fn index_for(&self, dir: DirId, zeroth_hint: Option<u16>) -> DirIndex {
        let mut indices = self.indices.lock();
        indices
            .entry(dir)
            .or_insert_with(|| {
                let zeroth = zeroth_hint
                    .unwrap_or_else(|| dir.zeroth_server(self.options.index.num_servers));
                DirIndex::new(zeroth, self.options.index.clone())
            })
            .clone()
    }

    /// Fold a reply's index image into the cache.
    fn merge_index(&self, dir: DirId, image: &[u8]) {
        if image.is_empty() {
            return;
        }
        let mut indices = self.indices.lock();
        match indices.get_mut(&dir) {
            Some(index) => {
                if let Err(e) = index.merge_encoded(image) {
                    debug!(dir = %dir, "ignoring bad index delta: {e}");
                }
            }
            None => {
                if let Ok(index) = DirIndex::decode(image, self.options.index.clone()) {
                    indices.insert(dir, index);
                }
            }
        }
    }

    fn addr_of(&self, server: u16) -> Result<SocketAddr> {
        self.servers
            .get(server as usize)
            .copied()
            .ok_or_else(|| Error::invalid_argument(format!("no address for server {server}")))
    }

    /// Route a call for (dir, name); on timeout retry once on the
    /// directory's refreshed index, since the partition may have moved.
    fn call_routed(&self, dir: DirId, name: &str, request: &Message) -> Result<Message> {
        let hash = NameHash::of(name);
        let mut last_err = None;
        for _attempt in 0..2 {
            let index = self.index_for(dir, None);
            let addr = self.addr_of(index.hash_to_server(&hash))?;
            match self.rpc.call(addr, request.clone()) {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_retryable() => {
                    debug!(dir = %dir, "retrying after transport loss: {e}");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::disconnected("rpc failed")))
    }

    /// Resolve one name. Served from the local lease table while the
    /// lease is fresh; otherwise one RPC.
    pub fn lookup(&self, dir: DirId, name: &str) -> Result<LookupStat> {
        let key = LeaseKey::new(dir, NameHash::of(name));
        if let LeaseLookup::Hit(stat) = self.leases.lookup(key, now_micros()) {
            // The deadline is the server's; the table never extends it.
            return Ok(stat);
        }

        let request = Message::request(
            OpCode::Lookup,
            &LookupRequest {
                dir,
                name: name.to_string(),
            },
        )?;
        let reply = self.call_routed(dir, name, &request)?;
        let body: LookupReply = reply.decode()?;
        self.merge_index(dir, &body.dir_index);
        self.leases.insert_with_due(key, body.stat.clone(), now_micros());
        Ok(body.stat)
    }

    pub fn getattr(&self, dir: DirId, name: &str) -> Result<Stat> {
        let request = Message::request(
            OpCode::Getattr,
            &GetattrRequest {
                dir,
                name: name.to_string(),
            },
        )?;
        let reply = self.call_routed(dir, name, &request)?;
        let body: GetattrReply = reply.decode()?;
        self.merge_index(dir, &body.dir_index);
        Ok(body.stat)
    }

    pub fn mknod(&self, dir: DirId, name: &str, mode: u32, uid: u32, gid: u32) -> Result<LookupStat> {
        let request = Message::request(
            OpCode::Mknod,
            &MknodRequest {
                dir,
                name: name.to_string(),
                mode,
                uid,
                gid,
            },
        )?;
        let reply = self.call_routed(dir, name, &request)?;
        let body: ChangeReply = reply.decode()?;
        self.merge_index(dir, &body.dir_index);
        self.leases.insert_with_due(
            LeaseKey::new(dir, NameHash::of(name)),
            body.stat.clone(),
            now_micros(),
        );
        Ok(body.stat)
    }

    /// Create a subdirectory; the returned stat's inode is the new
    /// directory's number and its zeroth server anchors its index.
    pub fn mkdir(&self, dir: DirId, name: &str, mode: u32, uid: u32, gid: u32) -> Result<LookupStat> {
        let request = Message::request(
            OpCode::Mkdir,
            &MkdirRequest {
                dir,
                name: name.to_string(),
                mode,
                uid,
                gid,
            },
        )?;
        let reply = self.call_routed(dir, name, &request)?;
        let body: ChangeReply = reply.decode()?;
        self.merge_index(dir, &body.dir_index);
        self.leases.insert_with_due(
            LeaseKey::new(dir, NameHash::of(name)),
            body.stat.clone(),
            now_micros(),
        );
        Ok(body.stat)
    }

    pub fn unlink(&self, dir: DirId, name: &str) -> Result<()> {
        let request = Message::request(
            OpCode::Unlink,
            &UnlinkRequest {
                dir,
                name: name.to_string(),
            },
        )?;
        let reply = self.call_routed(dir, name, &request)?;
        let body: UnlinkReply = reply.decode()?;
        self.merge_index(dir, &body.dir_index);
        self.leases.erase(LeaseKey::new(dir, NameHash::of(name)));
        Ok(())
    }

    /// List a directory: union of the listings of every server the
    /// cached index names, de-duplicated by name (a row may transiently
    /// exist on two servers mid-split; any copy serves).
    pub fn readdir(&self, dir: DirId) -> Result<Vec<DirListEntry>> {
        let request = Message::request(OpCode::Readdir, &ReaddirRequest { dir })?;
        let index = self.index_for(dir, None);
        let mut servers: Vec<u16> = (0..=index.highest_bit())
            .filter(|&i| index.is_set(i))
            .map(|i| index.server_for_partition(i))
            .collect();
        servers.sort_unstable();
        servers.dedup();

        let mut seen = HashMap::new();
        for server in servers {
            let addr = self.addr_of(server)?;
            let reply = self.rpc.call(addr, request.clone())?;
            let body: ReaddirReply = reply.decode()?;
            self.merge_index(dir, &body.dir_index);
            for entry in body.entries {
                seen.entry(entry.name.clone()).or_insert(entry);
            }
        }
        let mut entries: Vec<DirListEntry> = seen.into_values().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// The client's current view of a directory's partition index.
    pub fn cached_index(&self, dir: DirId) -> Option<DirIndex> {
        self.indices.lock().get(&dir).cloned()
    }

    /// Which server the client would route this name to right now.
    pub fn route_of(&self, dir: DirId, name: &str) -> u16 {
        self.index_for(dir, None).select_server(name)
    }
}
