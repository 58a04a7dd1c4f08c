//! UDP datagram transport
//!
//! The default transport: client-side deadlines, no connection state.
//! A server runs a small fixed pool of I/O threads that reassemble
//! requests and a worker pool that runs handler callbacks; I/O threads
//! never block on handlers (they hand off through a queue).

use crate::message::Message;
use crate::wire::{decode_fragment, encode_fragments, Fragment, Reassembly};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use shardfs_common::{Error, NetOptions, Result};
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Partial reassemblies older than this are abandoned.
const REASSEMBLY_TTL: Duration = Duration::from_secs(10);

/// A server-side callback: one request in, one reply out.
pub trait Handler: Send + Sync {
    fn handle(&self, peer: SocketAddr, request: Message) -> Message;
}

impl<F> Handler for F
where
    F: Fn(SocketAddr, Message) -> Message + Send + Sync,
{
    fn handle(&self, peer: SocketAddr, request: Message) -> Message {
        self(peer, request)
    }
}

// ---------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------

/// Connectionless client; every call uses a fresh ephemeral socket so
/// concurrent calls never interleave.
pub struct UdpClient {
    options: NetOptions,
    next_call_id: AtomicU64,
}

impl UdpClient {
    pub fn new(options: NetOptions) -> Self {
        Self {
            options: options.sanitize(),
            next_call_id: AtomicU64::new(1),
        }
    }

    /// Send `request` and wait for the reply within the configured
    /// deadline. Times out as `Disconnected`; the server may have moved
    /// partitions, so callers retry on a refreshed partition index.
    pub fn call(&self, addr: SocketAddr, request: Message) -> Result<Message> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        let deadline = Instant::now() + Duration::from_millis(self.options.rpc_timeout_ms);

        for datagram in encode_fragments(call_id, &request, self.options.udp_max_snd_msgsz)? {
            socket.send_to(&datagram, addr)?;
        }

        let mut buf = vec![0u8; self.options.udp_max_rcv_msgsz.max(2048)];
        let mut pending: Option<Reassembly> = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::disconnected(format!("rpc to {addr} timed out")));
            }
            socket.set_read_timeout(Some(remaining))?;
            let (n, from) = match socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Err(Error::disconnected(format!("rpc to {addr} timed out")));
                }
                Err(e) => return Err(e.into()),
            };
            if from != addr {
                trace!(%from, "ignoring datagram from unexpected peer");
                continue;
            }
            let frag = match decode_fragment(&buf[..n]) {
                Ok(f) => f,
                Err(e) => {
                    debug!("dropping bad reply datagram: {e}");
                    continue;
                }
            };
            if frag.call_id != call_id {
                continue;
            }
            let complete = match pending.as_mut() {
                None => {
                    let r = Reassembly::new(&frag);
                    let complete = r.is_complete();
                    pending = Some(r);
                    complete
                }
                Some(r) => r.accept(&frag),
            };
            if complete {
                return pending
                    .take()
                    .expect("reassembly present when complete")
                    .into_message();
            }
        }
    }

    pub fn options(&self) -> &NetOptions {
        &self.options
    }
}

// ---------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------

struct PendingRequest {
    reassembly: Reassembly,
    started: Instant,
}

/// UDP RPC server: `io_threads` receive and reassemble, `worker_threads`
/// run the handler and send replies.
pub struct UdpServer {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    io_handles: Vec<std::thread::JoinHandle<()>>,
    worker_handles: Vec<std::thread::JoinHandle<()>>,
}

impl UdpServer {
    pub fn start(
        bind: SocketAddr,
        options: NetOptions,
        handler: Arc<dyn Handler>,
    ) -> Result<UdpServer> {
        let options = options.sanitize();
        let socket = UdpSocket::bind(bind)?;
        let local_addr = socket.local_addr()?;
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx): (
            Sender<(SocketAddr, u64, Message)>,
            Receiver<(SocketAddr, u64, Message)>,
        ) = bounded(1024);
        let partial: Arc<Mutex<HashMap<(SocketAddr, u64), PendingRequest>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let mut io_handles = Vec::new();
        for i in 0..options.io_threads {
            let socket = socket.try_clone()?;
            let shutdown = shutdown.clone();
            let tx = tx.clone();
            let partial = partial.clone();
            let max_rcv = options.udp_max_rcv_msgsz.max(2048);
            let handle = std::thread::Builder::new()
                .name(format!("shardfs-rpc-io-{i}"))
                .spawn(move || io_loop(socket, shutdown, tx, partial, max_rcv))
                .map_err(|e| Error::io(format!("cannot spawn io thread: {e}")))?;
            io_handles.push(handle);
        }
        drop(tx);

        let mut worker_handles = Vec::new();
        for i in 0..options.worker_threads {
            let socket = socket.try_clone()?;
            let rx = rx.clone();
            let handler = handler.clone();
            let max_snd = options.udp_max_snd_msgsz;
            let handle = std::thread::Builder::new()
                .name(format!("shardfs-rpc-worker-{i}"))
                .spawn(move || worker_loop(socket, rx, handler, max_snd))
                .map_err(|e| Error::io(format!("cannot spawn worker thread: {e}")))?;
            worker_handles.push(handle);
        }

        debug!(%local_addr, "rpc server listening");
        Ok(UdpServer {
            local_addr,
            shutdown,
            io_handles,
            worker_handles,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.io_handles.drain(..) {
            let _ = handle.join();
        }
        // The channel disconnects once every I/O sender is gone.
        for handle in self.worker_handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn io_loop(
    socket: UdpSocket,
    shutdown: Arc<AtomicBool>,
    tx: Sender<(SocketAddr, u64, Message)>,
    partial: Arc<Mutex<HashMap<(SocketAddr, u64), PendingRequest>>>,
    max_rcv: usize,
) {
    let mut buf = vec![0u8; max_rcv];
    while !shutdown.load(Ordering::Acquire) {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                warn!("rpc receive error: {e}");
                continue;
            }
        };
        let frag = match decode_fragment(&buf[..n]) {
            Ok(f) => f,
            Err(e) => {
                debug!(%from, "dropping bad request datagram: {e}");
                continue;
            }
        };
        if let Some(message) = absorb_fragment(&partial, from, frag) {
            let call_id = message.0;
            if tx.send((from, call_id, message.1)).is_err() {
                return;
            }
        }
    }
}

/// Fold a fragment into the partial-request map; returns the whole
/// message once reassembly completes.
fn absorb_fragment(
    partial: &Mutex<HashMap<(SocketAddr, u64), PendingRequest>>,
    from: SocketAddr,
    frag: Fragment,
) -> Option<(u64, Message)> {
    let mut map = partial.lock();
    // Abandon stale partial calls (lost fragments never complete).
    if map.len() > 64 {
        let now = Instant::now();
        map.retain(|_, p| now.duration_since(p.started) < REASSEMBLY_TTL);
    }
    let call_id = frag.call_id;
    let key = (from, call_id);
    let complete = match map.get_mut(&key) {
        Some(pending) => pending.reassembly.accept(&frag),
        None => {
            let pending = PendingRequest {
                reassembly: Reassembly::new(&frag),
                started: Instant::now(),
            };
            let complete = pending.reassembly.is_complete();
            if !complete {
                map.insert(key, pending);
                return None;
            }
            return pending.reassembly.into_message().ok().map(|m| (call_id, m));
        }
    };
    if !complete {
        if map.get(&key).is_some_and(|p| p.reassembly.oversized()) {
            map.remove(&key);
        }
        return None;
    }
    let pending = map.remove(&key)?;
    pending.reassembly.into_message().ok().map(|m| (call_id, m))
}

fn worker_loop(
    socket: UdpSocket,
    rx: Receiver<(SocketAddr, u64, Message)>,
    handler: Arc<dyn Handler>,
    max_snd: usize,
) {
    for (peer, call_id, request) in rx {
        let reply = handler.handle(peer, request);
        match encode_fragments(call_id, &reply, max_snd) {
            Ok(datagrams) => {
                for d in datagrams {
                    if let Err(e) = socket.send_to(&d, peer) {
                        debug!(%peer, "reply send failed: {e}");
                        break;
                    }
                }
            }
            Err(e) => warn!("cannot encode reply: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::OpCode;
    use bytes::Bytes;

    fn echo_handler() -> Arc<dyn Handler> {
        Arc::new(|_peer: SocketAddr, req: Message| Message {
            op: req.op,
            err: 0,
            payload: req.payload,
        })
    }

    fn msg(payload: Vec<u8>) -> Message {
        Message {
            op: OpCode::Ping,
            err: 0,
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn test_echo_roundtrip() {
        let mut server = UdpServer::start(
            "127.0.0.1:0".parse().unwrap(),
            NetOptions::default(),
            echo_handler(),
        )
        .unwrap();
        let client = UdpClient::new(NetOptions::default());
        let reply = client
            .call(server.local_addr(), msg(b"ping-body".to_vec()))
            .unwrap();
        assert_eq!(&reply.payload[..], b"ping-body");
        server.shutdown();
    }

    #[test]
    fn test_large_payload_roundtrip() {
        let mut server = UdpServer::start(
            "127.0.0.1:0".parse().unwrap(),
            NetOptions::default(),
            echo_handler(),
        )
        .unwrap();
        let client = UdpClient::new(NetOptions::default());
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let reply = client
            .call(server.local_addr(), msg(payload.clone()))
            .unwrap();
        assert_eq!(&reply.payload[..], &payload[..]);
        server.shutdown();
    }

    #[test]
    fn test_timeout_is_disconnected() {
        let client = UdpClient::new(NetOptions {
            rpc_timeout_ms: 50,
            ..Default::default()
        });
        // An address nothing listens on.
        let err = client
            .call("127.0.0.1:1".parse().unwrap(), msg(b"x".to_vec()))
            .unwrap_err();
        assert!(err.is_retryable(), "got {err:?}");
    }

    #[test]
    fn test_concurrent_calls() {
        let mut server = UdpServer::start(
            "127.0.0.1:0".parse().unwrap(),
            NetOptions::default(),
            echo_handler(),
        )
        .unwrap();
        let addr = server.local_addr();
        let mut handles = Vec::new();
        for t in 0..8u32 {
            handles.push(std::thread::spawn(move || {
                let client = UdpClient::new(NetOptions::default());
                for i in 0..20u32 {
                    let body = format!("t{t}-i{i}").into_bytes();
                    let reply = client.call(addr, msg(body.clone())).unwrap();
                    assert_eq!(&reply.payload[..], &body[..]);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        server.shutdown();
    }
}
