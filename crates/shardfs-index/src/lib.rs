//! Directory partition index
//!
//! Each directory's entries are spread over a set of partitions described
//! by a compact bitmap: bit `i` set means partition `i` is a live split.
//! The index is self-describing (no external metadata is needed to route
//! a name), monotone (bits are never cleared in normal operation), and
//! mergeable (two observers reconcile by bitwise OR), which is what lets
//! it propagate by gossip piggybacked on RPC replies.
//!
//! Wire image:
//! ```text
//! +---------------+-------+-----------------------+
//! | zeroth_server | radix | bitmap                |
//! | u16 LE        | u16 LE| ceil(2^radix / 8) B   |
//! +---------------+-------+-----------------------+
//! ```

mod dir_index;

pub use dir_index::{mixed_permutation, DirIndex};
