//! Memory management
//!
//! Layered bottom-up: the physical page allocator over the bootloader map,
//! the recursive virtual-memory mapper, then the fixed-block and slab
//! allocators every other kernel structure draws from.

pub mod address_space;
pub mod fba;
pub mod frame_allocator;
pub mod recursive;
pub mod refcount;
pub mod region_tree;
pub mod slab;
pub mod vmm;

use spin::Once;

use crate::error::{KernelError, KernelResult};
use fba::FixedBlockAllocator;
use frame_allocator::PhysicalRegion;
use refcount::RefCountMap;
use slab::SlabAllocator;

/// Only 4 KiB pages in the paths the core manages.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Everything at or above here is kernel space.
pub const KERNEL_SPACE_START: usize = 0xffff_8000_0000_0000;

/// Exclusive upper bound for user memory regions.
pub const USERSPACE_LIMIT: usize = 0x8000_0000_0000_0000;

pub type PhysAddr = u64;
pub type VirtAddr = usize;

#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[inline]
pub const fn is_page_aligned(value: usize) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// Bootloader memory map entry kinds the allocator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
    BootloaderReclaimable,
    /// Kernel image and boot-loaded modules.
    ExecutableAndModules,
    Framebuffer,
    Unknown,
}

/// One entry of the (already validated) bootloader memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryKind,
}

/// The allocator stack handed around the task/process layer: the boot
/// singletons on a running kernel, per-test instances under test.
#[derive(Clone, Copy)]
pub struct KernelEnv {
    pub region: &'static PhysicalRegion,
    pub fba: &'static FixedBlockAllocator,
    pub slab: &'static SlabAllocator,
    pub refcounts: &'static RefCountMap,
}

/// The boot-created allocator stack.
pub fn kernel_env() -> KernelResult<KernelEnv> {
    Ok(KernelEnv {
        region: physical_region()?,
        fba: kernel_fba()?,
        slab: kernel_slab()?,
        refcounts: refcount_map()?,
    })
}

static PHYSICAL_REGION: Once<&'static PhysicalRegion> = Once::new();
static KERNEL_FBA: Once<&'static FixedBlockAllocator> = Once::new();
static KERNEL_SLAB: Once<&'static SlabAllocator> = Once::new();
static REFCOUNT_MAP: Once<&'static RefCountMap> = Once::new();

/// Bind the boot-created physical region singleton.
pub fn set_physical_region(region: &'static PhysicalRegion) {
    PHYSICAL_REGION.call_once(|| region);
}

pub fn physical_region() -> KernelResult<&'static PhysicalRegion> {
    PHYSICAL_REGION
        .get()
        .copied()
        .ok_or(KernelError::NotInitialized {
            subsystem: "physical region",
        })
}

pub fn set_kernel_fba(fba: &'static FixedBlockAllocator) {
    KERNEL_FBA.call_once(|| fba);
}

pub fn kernel_fba() -> KernelResult<&'static FixedBlockAllocator> {
    KERNEL_FBA.get().copied().ok_or(KernelError::NotInitialized {
        subsystem: "fixed block allocator",
    })
}

pub fn set_kernel_slab(slab: &'static SlabAllocator) {
    KERNEL_SLAB.call_once(|| slab);
}

pub fn kernel_slab() -> KernelResult<&'static SlabAllocator> {
    KERNEL_SLAB.get().copied().ok_or(KernelError::NotInitialized {
        subsystem: "slab allocator",
    })
}

pub fn set_refcount_map(map: &'static RefCountMap) {
    REFCOUNT_MAP.call_once(|| map);
}

pub fn refcount_map() -> KernelResult<&'static RefCountMap> {
    REFCOUNT_MAP.get().copied().ok_or(KernelError::NotInitialized {
        subsystem: "refcount map",
    })
}
