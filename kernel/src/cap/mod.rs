//! Capabilities
//!
//! Kernel objects are referenced from userspace by unpredictable 64-bit
//! cookies. The map resolves cookie → object; the token module generates
//! the cookies themselves.

pub mod map;
pub mod token;

use spin::Once;

use crate::error::{KernelError, KernelResult};
use map::CapabilityMap;

pub use token::{capability_cookie, Capability, CapabilityType};

static CAPABILITY_MAP: Once<&'static CapabilityMap> = Once::new();

/// Bind the boot-created global capability map.
pub fn set_capability_map(map: &'static CapabilityMap) {
    CAPABILITY_MAP.call_once(|| map);
}

pub fn capability_map() -> KernelResult<&'static CapabilityMap> {
    CAPABILITY_MAP
        .get()
        .copied()
        .ok_or(KernelError::NotInitialized {
            subsystem: "capability map",
        })
}
