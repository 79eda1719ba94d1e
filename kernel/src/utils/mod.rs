//! Small shared structures
//!
//! The general-purpose hash table used by the IPC registries, and the
//! string hashes for named-channel lookup.

pub mod hash;

pub use hash::{str_hash_djb2, str_hash_sdbm, HashTable};
