//! Lookup-lease table
//!
//! A capacity-bounded cache of directory-lookup leases with a three-
//! state coherence protocol:
//!
//! - **Free**: the entry holds cold metadata; it may be evicted and
//!   carries no coherence guarantee.
//! - **Shared**: held by any number of clients; each lookup extends the
//!   expiration. An expired Shared lease counts as free because every
//!   client has already discarded it.
//! - **Locked**: a write is pending. The expiration is frozen and no
//!   lookup may extend it; the writer applies its change only after the
//!   frozen deadline passes, which under loosely synchronized clocks
//!   guarantees every lease holder has observed expiry.
//!
//! Pinned entries are excluded from eviction; eviction takes the least
//! recently used entry that is unpinned and free (or expired).

mod table;

pub use table::{
    LeaseKey, LeaseLookup, LeaseState, LeaseStats, LeaseTable, SyncLeaseTable, WriterGrant,
};
