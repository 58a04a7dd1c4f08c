//! ShardFS Protocol - RPC messages and transport
//!
//! One opaque call shape (`{op, err, payload}`) moved over UDP
//! datagrams with client-side deadlines. Payloads are bincode-encoded
//! typed structs; large messages fragment across datagrams and
//! reassemble by call id.

pub mod message;
pub mod udp;
pub mod wire;

pub use message::{
    ChangeReply, DirListEntry, GetattrReply, GetattrRequest, InstallTableReply,
    InstallTableRequest, LookupReply, LookupRequest, Message, MkdirRequest, MknodRequest, OpCode,
    ReaddirReply, ReaddirRequest, UnlinkReply, UnlinkRequest,
};
pub use udp::{Handler, UdpClient, UdpServer};
