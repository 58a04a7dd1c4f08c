//! The metadata service
//!
//! Handlers route by the directory's partition index, answer lookups
//! through the lease table, write through the local engine, and
//! piggyback the current index image on every reply so clients
//! converge by merging. Overflowing partitions split to their mapped
//! server by shipping a level-0-ready table.

use crate::dir_control::{DirControl, DirTable};
use crate::rows::{EntryRow, PartitionMeta, SuperRow};
use parking_lot::Mutex;
use shardfs_common::{
    now_micros, DirId, Error, LookupStat, NameHash, Result, ServerOptions, Stat, MODE_DIR,
    MODE_REG,
};
use shardfs_engine::storage::BufferFile;
use shardfs_engine::{
    entry_key, entry_range, filenames, index_key, key as row_key, partition_meta_key, super_key,
    Engine, Storage, TableBuilder, WriteBatch,
};
use shardfs_index::DirIndex;
use shardfs_lease::{LeaseKey, LeaseLookup, SyncLeaseTable};
use shardfs_proto::{
    ChangeReply, DirListEntry, GetattrReply, GetattrRequest, Handler, InstallTableReply,
    InstallTableRequest, LookupReply, LookupRequest, Message, MkdirRequest, MknodRequest, OpCode,
    ReaddirReply, ReaddirRequest, UdpClient, UdpServer, UnlinkReply, UnlinkRequest,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Inode numbers carry the allocating server in their high bits.
const INODE_SERVER_SHIFT: u32 = 48;

pub struct MetaServer {
    options: ServerOptions,
    storage: Arc<dyn Storage>,
    engine: Engine,
    leases: SyncLeaseTable,
    dirs: DirTable,
    /// Peer addresses indexed by server id; installed after every
    /// server has bound its socket.
    peers: Mutex<Vec<SocketAddr>>,
    rpc: UdpClient,
    /// Low bits of the next inode; persisted in the superblock row with
    /// every create.
    inode_alloc: Mutex<u64>,
}

impl MetaServer {
    pub fn new(
        options: ServerOptions,
        storage: Arc<dyn Storage>,
        peers: Vec<SocketAddr>,
    ) -> Result<Arc<MetaServer>> {
        let options = options.sanitize();
        if (options.server_id as u32) >= options.index.num_servers {
            return Err(Error::invalid_argument(format!(
                "server id {} outside cluster of {}",
                options.server_id, options.index.num_servers
            )));
        }
        let engine = Engine::open(
            storage.clone(),
            options.data_dir.clone(),
            options.engine.clone(),
        )?;
        let next_inode = engine
            .get(&super_key(), None)?
            .and_then(|v| SuperRow::from_bytes(&v))
            .map(|s| s.next_inode)
            .unwrap_or(1);
        info!(
            server = options.server_id,
            servers = options.index.num_servers,
            next_inode,
            "metadata server ready"
        );
        Ok(Arc::new(MetaServer {
            leases: SyncLeaseTable::new(options.lease.clone()),
            dirs: DirTable::new(options.max_num_dirs),
            rpc: UdpClient::new(options.net.clone()),
            inode_alloc: Mutex::new(next_inode),
            options,
            storage,
            engine,
            peers: Mutex::new(peers),
        }))
    }

    /// Install the cluster's address table once every server is bound.
    pub fn set_peers(&self, peers: Vec<SocketAddr>) {
        *self.peers.lock() = peers;
    }

    /// Start serving RPCs on `bind`.
    pub fn serve(self: &Arc<Self>, bind: SocketAddr) -> Result<UdpServer> {
        UdpServer::start(bind, self.options.net.clone(), self.clone())
    }

    pub fn server_id(&self) -> u16 {
        self.options.server_id
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The authoritative-as-known index image for a directory.
    pub fn index_image(&self, dir: DirId) -> Result<Vec<u8>> {
        Ok(self.load_dir(dir)?.index_snapshot().encode())
    }

    // -----------------------------------------------------------------
    // Directory control
    // -----------------------------------------------------------------

    fn load_dir(&self, id: DirId) -> Result<Arc<DirControl>> {
        self.dirs.get_or_load(id, || {
            let index = match self.engine.get(&index_key(id), None)? {
                Some(image) => DirIndex::decode(&image, self.options.index.clone())?,
                None => DirIndex::new(
                    id.zeroth_server(self.options.index.num_servers),
                    self.options.index.clone(),
                ),
            };
            // Rebuild per-partition counts from the hosted rows.
            let (begin, end) = entry_range(id);
            let mut counts: HashMap<u32, u64> = HashMap::new();
            for (k, _) in self.engine.scan(&begin, &end, None)? {
                if let Some(hash) = row_key::parse_entry_hash(&k) {
                    *counts.entry(index.partition_of(&hash)).or_insert(0) += 1;
                }
            }
            Ok(DirControl::new(id, index, counts))
        })
    }

    fn persist_index(&self, id: DirId, index: &DirIndex) -> Result<()> {
        self.engine.put(&index_key(id), &index.encode())?;
        Ok(())
    }

    /// True when this server hosts the partition the hash routes to.
    fn owns(&self, index: &DirIndex, hash: &NameHash) -> bool {
        index.hash_to_server(hash) == self.options.server_id
    }

    fn peer_addr(&self, server: u16) -> Result<SocketAddr> {
        self.peers
            .lock()
            .get(server as usize)
            .copied()
            .ok_or_else(|| Error::invalid_argument(format!("no address for server {server}")))
    }

    fn forward(&self, owner: u16, request: &Message) -> Result<Message> {
        let addr = self.peer_addr(owner)?;
        debug!(owner, "forwarding misrouted request");
        self.rpc.call(addr, request.clone())
    }

    fn allocate_inode(&self, batch: &mut WriteBatch) -> u64 {
        let mut alloc = self.inode_alloc.lock();
        let n = *alloc;
        *alloc += 1;
        batch.put(&super_key(), &SuperRow { next_inode: *alloc }.to_bytes());
        ((self.options.server_id as u64) << INODE_SERVER_SHIFT) | n
    }

    // -----------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------

    fn handle_lookup(&self, raw: &Message) -> Result<Message> {
        let req: LookupRequest = raw.decode()?;
        let dc = self.load_dir(req.dir)?;
        let index = dc.index_snapshot();
        let hash = NameHash::of(&req.name);
        if !self.owns(&index, &hash) {
            return self.forward(index.hash_to_server(&hash), raw);
        }

        let key = LeaseKey::new(req.dir, hash);
        let stat = match self.leases.lookup_waiting(key, now_micros) {
            LeaseLookup::Hit(stat) => stat,
            LeaseLookup::Locked { until } => {
                // Still locked after one wait: tell the caller "not
                // yet" so it retries rather than piling up here.
                return Err(Error::disconnected(format!(
                    "name is being modified (until {until})"
                )));
            }
            LeaseLookup::Miss => {
                let row = self
                    .engine
                    .get(&entry_key(req.dir, &hash), None)?
                    .and_then(|v| EntryRow::from_bytes(&v))
                    .ok_or_else(|| Error::not_found(req.name.clone()))?;
                self.leases
                    .insert(key, LookupStat::from_stat(&row.stat, 0), now_micros())
            }
        };
        Message::reply(
            OpCode::Lookup,
            &LookupReply {
                stat,
                dir_index: index.encode(),
            },
        )
    }

    fn handle_getattr(&self, raw: &Message) -> Result<Message> {
        let req: GetattrRequest = raw.decode()?;
        let dc = self.load_dir(req.dir)?;
        let index = dc.index_snapshot();
        let hash = NameHash::of(&req.name);
        if !self.owns(&index, &hash) {
            return self.forward(index.hash_to_server(&hash), raw);
        }
        let row = self
            .engine
            .get(&entry_key(req.dir, &hash), None)?
            .and_then(|v| EntryRow::from_bytes(&v))
            .ok_or_else(|| Error::not_found(req.name.clone()))?;
        Message::reply(
            OpCode::Getattr,
            &GetattrReply {
                stat: row.stat,
                dir_index: index.encode(),
            },
        )
    }

    fn handle_create(&self, raw: &Message, as_dir: bool) -> Result<Message> {
        let (dir, name, mode, uid, gid, op) = if as_dir {
            let req: MkdirRequest = raw.decode()?;
            (req.dir, req.name, req.mode, req.uid, req.gid, OpCode::Mkdir)
        } else {
            let req: MknodRequest = raw.decode()?;
            (req.dir, req.name, req.mode, req.uid, req.gid, OpCode::Mknod)
        };
        let dc = self.load_dir(dir)?;
        let hash = NameHash::of(&name);
        {
            let state = dc.lock();
            if !self.owns(&state.index, &hash) {
                let owner = state.index.hash_to_server(&hash);
                drop(state);
                return self.forward(owner, raw);
            }
        }

        // Take the lease for writing and wait out any shared holders so
        // no client observes the change before its cached lease expired.
        let key = LeaseKey::new(dir, hash);
        let grant = self.leases.writer_acquire(key, now_micros())?;
        let wait = grant.wait_duration(now_micros());
        if !wait.is_zero() {
            debug!(name = %name, ?wait, "writer waiting out shared lease");
            std::thread::sleep(wait);
        }

        let mut state = dc.lock();
        // The partition may have split away while the writer waited.
        if !self.owns(&state.index, &hash) {
            let owner = state.index.hash_to_server(&hash);
            drop(state);
            self.leases.writer_abort(key);
            return self.forward(owner, raw);
        }
        let ekey = entry_key(dir, &hash);
        if self.engine.get(&ekey, None)?.is_some() {
            self.leases.writer_abort(key);
            return Err(Error::already_exists(name));
        }

        let mut batch = WriteBatch::new();
        let inode = self.allocate_inode(&mut batch);
        let now = now_micros();
        let stat = Stat {
            inode,
            size: 0,
            mode: mode | if as_dir { MODE_DIR } else { MODE_REG },
            uid,
            gid,
            mtime: now,
            ctime: now,
            zeroth_server: if as_dir {
                DirId::new(0, inode).zeroth_server(self.options.index.num_servers)
            } else {
                0
            },
            inline_data: None,
        };
        batch.put(&ekey, &EntryRow::new(name.clone(), stat.clone()).to_bytes());

        let partition = state.index.partition_of(&hash);
        let count = state.counts.get(&partition).copied().unwrap_or(0) + 1;
        batch.put(
            &partition_meta_key(dir, partition),
            &PartitionMeta {
                entries: count,
                mtime: now,
            }
            .to_bytes(),
        );
        self.engine.write(batch)?;
        state.counts.insert(partition, count);

        let published =
            self.leases
                .writer_commit(key, LookupStat::from_stat(&stat, 0), now_micros())?;

        if count > self.options.split_threshold {
            if let Err(e) = self.maybe_split(&dc, &mut state, partition) {
                // The split retries on a later overflow; rows stay put.
                warn!(dir = %dir, partition, "split attempt failed: {e}");
            }
        }

        Message::reply(
            op,
            &ChangeReply {
                stat: published,
                dir_index: state.index.encode(),
            },
        )
    }

    fn handle_unlink(&self, raw: &Message) -> Result<Message> {
        let req: UnlinkRequest = raw.decode()?;
        let dc = self.load_dir(req.dir)?;
        let hash = NameHash::of(&req.name);
        {
            let state = dc.lock();
            if !self.owns(&state.index, &hash) {
                let owner = state.index.hash_to_server(&hash);
                drop(state);
                return self.forward(owner, raw);
            }
        }

        let key = LeaseKey::new(req.dir, hash);
        let grant = self.leases.writer_acquire(key, now_micros())?;
        let wait = grant.wait_duration(now_micros());
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }

        let mut state = dc.lock();
        if !self.owns(&state.index, &hash) {
            let owner = state.index.hash_to_server(&hash);
            drop(state);
            self.leases.writer_abort(key);
            return self.forward(owner, raw);
        }
        let ekey = entry_key(req.dir, &hash);
        if self.engine.get(&ekey, None)?.is_none() {
            self.leases.writer_abort(key);
            return Err(Error::not_found(req.name.clone()));
        }
        self.engine.delete(&ekey)?;
        state.uncount_entry(&hash);
        self.leases.writer_commit_erase(key)?;

        Message::reply(
            OpCode::Unlink,
            &UnlinkReply {
                dir_index: state.index.encode(),
            },
        )
    }

    fn handle_readdir(&self, raw: &Message) -> Result<Message> {
        let req: ReaddirRequest = raw.decode()?;
        let dc = self.load_dir(req.dir)?;
        let index = dc.index_snapshot();
        let (begin, end) = entry_range(req.dir);
        let snapshot = self.engine.snapshot();
        let mut entries = Vec::new();
        for (_, v) in self.engine.scan(&begin, &end, Some(&snapshot))? {
            if let Some(row) = EntryRow::from_bytes(&v) {
                entries.push(DirListEntry {
                    name: row.name,
                    inode: row.stat.inode,
                    mode: row.stat.mode,
                });
            }
        }
        Message::reply(
            OpCode::Readdir,
            &ReaddirReply {
                entries,
                dir_index: index.encode(),
            },
        )
    }

    fn handle_install_table(&self, raw: &Message) -> Result<Message> {
        let req: InstallTableRequest = raw.decode()?;
        let dc = self.load_dir(req.dir)?;

        if !req.table.is_empty() {
            // Stage the shipped image next to the engine and ingest it.
            // The temp name is reclaimed on restart if we crash between
            // the write and the ingest.
            let staging = filenames::temp_file(
                &self.options.data_dir,
                500_000 + (req.dir.dirno % 100_000) * 64 + req.partition as u64 % 64,
            );
            {
                let mut file = self.storage.new_writable(&staging)?;
                file.append(&req.table)?;
                file.sync()?;
            }
            self.engine.ingest_table_file(&staging)?;
        }

        let mut state = dc.lock();
        state.index.merge_encoded(&req.dir_index)?;
        let image = state.index.encode();
        self.persist_index(req.dir, &state.index)?;

        // Rebuild counts: the ingested rows belong to partitions this
        // server now hosts.
        let (begin, end) = entry_range(req.dir);
        let mut counts: HashMap<u32, u64> = HashMap::new();
        for (k, _) in self.engine.scan(&begin, &end, None)? {
            if let Some(hash) = row_key::parse_entry_hash(&k) {
                *counts.entry(state.index.partition_of(&hash)).or_insert(0) += 1;
            }
        }
        state.counts = counts;
        info!(dir = %req.dir, partition = req.partition, "installed split partition");

        Message::reply(OpCode::InstallTable, &InstallTableReply { dir_index: image })
    }

    // -----------------------------------------------------------------
    // Splits
    // -----------------------------------------------------------------

    /// Split the overflowing partition, shipping the migrating rows to
    /// the child's server. Every step is idempotent: an interrupted
    /// split restarts from scratch on the next overflow, duplicate rows
    /// on the target resolve by highest sequence, and the source's
    /// deletes are gated on the target's acknowledgement.
    fn maybe_split(
        &self,
        dc: &Arc<DirControl>,
        state: &mut crate::dir_control::DirState,
        parent: u32,
    ) -> Result<()> {
        if state.splitting {
            return Ok(());
        }
        let Some(child) = state.index.child_for_split(parent) else {
            return Ok(());
        };
        state.splitting = true;
        let result = self.run_split(dc.id, state, parent, child);
        state.splitting = false;
        result
    }

    fn run_split(
        &self,
        dir: DirId,
        state: &mut crate::dir_control::DirState,
        parent: u32,
        child: u32,
    ) -> Result<()> {
        let mut post = state.index.clone();
        post.set(child);
        let target = post.server_for_partition(child);
        info!(dir = %dir, parent, child, target, "splitting overflowing partition");

        // Collect the rows the migration predicate sends to the child.
        let (begin, end) = entry_range(dir);
        let snapshot = self.engine.snapshot();
        let mut moved: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for (k, v) in self.engine.scan(&begin, &end, Some(&snapshot))? {
            if let Some(hash) = row_key::parse_entry_hash(&k) {
                if state.index.partition_of(&hash) == parent
                    && DirIndex::to_be_migrated(child, &hash)
                {
                    moved.push((k, v));
                }
            }
        }

        // Build a level-0-ready table image of the moved rows.
        let (file, buffer) = BufferFile::new();
        let mut builder = TableBuilder::new(file, self.options.engine.clone());
        for (k, v) in &moved {
            // Shipped rows restart at sequence 1 on the target; later
            // local writes there shadow them.
            builder.add(
                &row_key::internal_key(k, 1, shardfs_engine::ValueKind::Value),
                v,
            )?;
        }
        builder.finish()?;
        let table = std::mem::take(&mut *buffer.lock());

        if target == self.options.server_id {
            // The permutation kept the child local: ingest in place.
            if !moved.is_empty() {
                let staging = filenames::temp_file(&self.options.data_dir, 400_000 + child as u64);
                {
                    let mut f = self.storage.new_writable(&staging)?;
                    f.append(&table)?;
                    f.sync()?;
                }
                self.engine.ingest_table_file(&staging)?;
            }
        } else {
            let addr = self.peer_addr(target)?;
            let request = Message::request(
                OpCode::InstallTable,
                &InstallTableRequest {
                    dir,
                    partition: child,
                    table,
                    dir_index: post.encode(),
                },
            )?;
            let reply = self.rpc.call(addr, request)?;
            let ack: InstallTableReply = reply.decode()?;
            post.merge_encoded(&ack.dir_index)?;
        }

        // The target acknowledged: commit the child bit locally and
        // drop the migrated rows.
        state.index.merge(&post)?;
        self.persist_index(dir, &state.index)?;
        if target != self.options.server_id && !moved.is_empty() {
            let mut batch = WriteBatch::new();
            for (k, _) in &moved {
                batch.delete(k);
            }
            self.engine.write(batch)?;
        }

        // Refresh the bookkeeping under the post-split mapping.
        let mut counts: HashMap<u32, u64> = HashMap::new();
        for (k, _) in self.engine.scan(&begin, &end, None)? {
            if let Some(hash) = row_key::parse_entry_hash(&k) {
                *counts.entry(state.index.partition_of(&hash)).or_insert(0) += 1;
            }
        }
        state.counts = counts;
        info!(dir = %dir, parent, child, moved = moved.len(), "split committed");
        Ok(())
    }
}

impl Handler for MetaServer {
    fn handle(&self, peer: SocketAddr, request: Message) -> Message {
        let op = request.op;
        let result = match op {
            OpCode::Ping => Message::reply(OpCode::Ping, &()),
            OpCode::Lookup => self.handle_lookup(&request),
            OpCode::Getattr => self.handle_getattr(&request),
            OpCode::Mknod => self.handle_create(&request, false),
            OpCode::Mkdir => self.handle_create(&request, true),
            OpCode::Unlink => self.handle_unlink(&request),
            OpCode::Readdir => self.handle_readdir(&request),
            OpCode::InstallTable => self.handle_install_table(&request),
        };
        match result {
            Ok(reply) => reply,
            Err(e) => {
                debug!(%peer, ?op, "request failed: {e}");
                Message::error_reply(op, &e)
            }
        }
    }
}
