//! Named channels
//!
//! A string name → channel cookie layer over the IPC registry, so
//! servers can be found without prearranged cookies. Names are hashed
//! with sdbm, which has better avalanche than djb2; that matters because
//! the table probes on the raw hash rather than bucketing collisions.

use crate::error::{IpcError, KernelResult};
use crate::mm::fba::FixedBlockAllocator;
use crate::utils::{str_hash_sdbm, HashTable};

use super::channel::IpcRegistry;

/// Longest name considered significant.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 255;

const INITIAL_PAGE_COUNT: u64 = 2;

pub struct NamedChannelRegistry {
    channels: &'static IpcRegistry,
    names: HashTable,
}

impl NamedChannelRegistry {
    pub fn new(
        fba: &'static FixedBlockAllocator,
        channels: &'static IpcRegistry,
    ) -> KernelResult<Self> {
        Ok(Self {
            channels,
            names: HashTable::create(fba, INITIAL_PAGE_COUNT)?,
        })
    }

    /// Bind `name` to an existing channel. Fails if the channel does not
    /// exist or the name is taken.
    pub fn register(&self, cookie: u64, name: &[u8]) -> KernelResult<()> {
        if !self.channels.exists(cookie) {
            return Err(IpcError::ChannelNotFound { cookie }.into());
        }

        let name_hash = str_hash_sdbm(name, MAX_CHANNEL_NAME_LENGTH);
        if self.names.insert(name_hash, cookie as *mut u8) {
            Ok(())
        } else {
            Err(IpcError::NameExists.into())
        }
    }

    /// The cookie bound to `name`, if any.
    pub fn find(&self, name: &[u8]) -> Option<u64> {
        let name_hash = str_hash_sdbm(name, MAX_CHANNEL_NAME_LENGTH);
        self.names.lookup(name_hash).map(|value| value as u64)
    }

    /// Unbind `name`, returning the cookie it named.
    pub fn deregister(&self, name: &[u8]) -> KernelResult<u64> {
        let name_hash = str_hash_sdbm(name, MAX_CHANNEL_NAME_LENGTH);
        self.names
            .remove(name_hash)
            .map(|value| value as u64)
            .ok_or_else(|| IpcError::NameNotFound.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::channel::tests::test_registry;
    use crate::mm::fba::tests::test_fba;
    use std::boxed::Box;

    fn named() -> (&'static NamedChannelRegistry, &'static IpcRegistry) {
        let channels = test_registry();
        let named = Box::leak(Box::new(
            NamedChannelRegistry::new(test_fba(16), channels).unwrap(),
        ));
        (named, channels)
    }

    #[test]
    fn register_find_deregister_round_trip() {
        let (named, channels) = named();
        let cookie = channels.create().unwrap();

        named.register(cookie, b"system:vfs").unwrap();
        assert_eq!(named.find(b"system:vfs"), Some(cookie));

        assert_eq!(named.deregister(b"system:vfs").unwrap(), cookie);
        assert_eq!(named.find(b"system:vfs"), None);
    }

    #[test]
    fn register_requires_live_channel() {
        let (named, _channels) = named();
        assert!(named.register(0xdead_beef, b"ghost").is_err());
    }

    #[test]
    fn duplicate_names_are_refused() {
        let (named, channels) = named();
        let first = channels.create().unwrap();
        let second = channels.create().unwrap();

        named.register(first, b"printer").unwrap();
        assert!(named.register(second, b"printer").is_err());
        assert_eq!(named.find(b"printer"), Some(first));
    }

    #[test]
    fn unknown_name_finds_nothing() {
        let (named, _channels) = named();
        assert_eq!(named.find(b"no-such-service"), None);
        assert!(named.deregister(b"no-such-service").is_err());
    }

    #[test]
    fn names_are_nul_terminated_like_c_strings() {
        let (named, channels) = named();
        let cookie = channels.create().unwrap();

        named.register(cookie, b"console\0trailing").unwrap();
        assert_eq!(named.find(b"console"), Some(cookie));
    }
}
