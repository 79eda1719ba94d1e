//! Inter-process communication
//!
//! Synchronous rendezvous channels: one pending send per task, blocked
//! until a receiver drains it and replies. Channels are named to
//! userspace by capability cookies; a string-keyed registry layers
//! human-readable names on top.

pub mod channel;
pub mod named;

use spin::Once;

use crate::error::{KernelError, KernelResult};
pub use channel::{IpcChannel, IpcMessage, IpcRegistry, MAX_IPC_BUFFER_SIZE};
pub use named::NamedChannelRegistry;

static IPC_REGISTRY: Once<&'static IpcRegistry> = Once::new();
static NAMED_CHANNELS: Once<&'static NamedChannelRegistry> = Once::new();

pub fn set_registry(registry: &'static IpcRegistry) {
    IPC_REGISTRY.call_once(|| registry);
}

pub fn registry() -> KernelResult<&'static IpcRegistry> {
    IPC_REGISTRY
        .get()
        .copied()
        .ok_or(KernelError::NotInitialized {
            subsystem: "ipc registry",
        })
}

pub fn set_named_channels(named: &'static NamedChannelRegistry) {
    NAMED_CHANNELS.call_once(|| named);
}

pub fn named_channels() -> KernelResult<&'static NamedChannelRegistry> {
    NAMED_CHANNELS
        .get()
        .copied()
        .ok_or(KernelError::NotInitialized {
            subsystem: "named channels",
        })
}
