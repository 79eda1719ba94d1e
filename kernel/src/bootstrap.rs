//! Kernel core bring-up
//!
//! The platform layer hands over a validated memory map and the firmware
//! addresses; this module builds the allocator stack in dependency order
//! (physical region → fixed blocks → slab → refcount map), brings up
//! per-CPU state for the boot CPU, and mints the syscall capabilities
//! destined for the supervisor's initial stack.

use spin::Once;

use crate::cap::map::CapabilityMap;
use crate::error::{KernelError, KernelResult};
use crate::ipc::channel::IpcRegistry;
use crate::ipc::named::NamedChannelRegistry;
use crate::mm::fba::{FixedBlockAllocator, BLOCKS_PER_BITMAP_PAGE};
use crate::mm::frame_allocator::{MemoryExtent, PhysicalRegion};
use crate::mm::refcount::RefCountMap;
use crate::mm::slab::SlabAllocator;
use crate::mm::MemoryMapEntry;
use crate::syscall::{install_syscall_capabilities, SyscallId};

/// Default kernel-virtual window for the fixed-block allocator.
pub const KERNEL_FBA_BEGIN: usize = 0xffff_a000_0000_0000;

/// Default window size: 1 GiB of 4 KiB blocks.
pub const KERNEL_FBA_SIZE_BLOCKS: u64 = 8 * BLOCKS_PER_BITMAP_PAGE;

/// Everything the platform layer must deliver for core init.
pub struct BootConfig {
    pub memory_map: &'static [MemoryMapEntry],
    /// Physical memory below this is left alone.
    pub managed_base: u64,
    /// Backing for the free-extent stack; must fit a fully fragmented
    /// region.
    pub extent_buffer: &'static mut [MemoryExtent],
    pub reclaim_exec_mods: bool,
    pub fba_begin: usize,
    pub fba_size_blocks: u64,
    /// Validated ACPI RSDT (the core only passes it on).
    pub rsdt_phys: u64,
    pub framebuffer_phys: u64,
    pub cpu_id: u64,
    pub lapic_id: u64,
}

static REGION: Once<PhysicalRegion> = Once::new();
static FBA: Once<FixedBlockAllocator> = Once::new();
static SLAB: Once<SlabAllocator> = Once::new();
static REFCOUNTS: Once<RefCountMap> = Once::new();
static CAPS: Once<CapabilityMap> = Once::new();
static IPC: Once<IpcRegistry> = Once::new();
static NAMED: Once<NamedChannelRegistry> = Once::new();
static FIRMWARE: Once<(u64, u64)> = Once::new();

/// Physical address of the RSDT the bootloader validated, once boot has
/// recorded it.
pub fn firmware_rsdt_phys() -> Option<u64> {
    FIRMWARE.get().map(|&(rsdt, _)| rsdt).filter(|&p| p != 0)
}

pub fn framebuffer_phys() -> Option<u64> {
    FIRMWARE.get().map(|&(_, fb)| fb).filter(|&p| p != 0)
}

/// Bring the kernel core up on the boot CPU. Returns the syscall
/// capability pairs for the supervisor's initial stack.
///
/// Allocation failure for the allocators themselves panics: there is no
/// kernel to fall back to at this point.
pub fn kernel_init(config: BootConfig) -> KernelResult<[(SyscallId, u64); 26]> {
    crate::klog::init();
    log::info!("cinder core starting on cpu {}", config.cpu_id);

    let BootConfig {
        memory_map,
        managed_base,
        extent_buffer,
        reclaim_exec_mods,
        fba_begin,
        fba_size_blocks,
        rsdt_phys,
        framebuffer_phys,
        cpu_id,
        lapic_id,
    } = config;

    let region = REGION.call_once(|| {
        PhysicalRegion::init(memory_map, managed_base, extent_buffer, reclaim_exec_mods)
    });
    crate::mm::set_physical_region(region);
    log::info!(
        "physical memory: {} KiB managed, {} KiB free",
        region.total_size() / 1024,
        region.free_bytes() / 1024
    );

    let fba = FBA.call_once(|| {
        FixedBlockAllocator::init(region, fba_begin, fba_size_blocks)
            .expect("fixed-block allocator init failed")
    });
    crate::mm::set_kernel_fba(fba);

    let slab = SLAB.call_once(|| SlabAllocator::new(fba));
    crate::mm::set_kernel_slab(slab);

    let refcounts = REFCOUNTS
        .call_once(|| RefCountMap::new(fba, slab).expect("refcount map init failed"));
    crate::mm::set_refcount_map(refcounts);

    let env = crate::mm::kernel_env()?;

    // SAFETY: first init on this CPU, allocators are up.
    unsafe {
        crate::smp::percpu::init_this_cpu(cpu_id, lapic_id)?;
    }

    if !crate::mm::address_space::address_space_init(env) {
        return Err(KernelError::OutOfMemory);
    }

    let caps =
        CAPS.call_once(|| CapabilityMap::new(fba).expect("capability map init failed"));
    crate::cap::set_capability_map(caps);

    let ipc = IPC.call_once(|| {
        IpcRegistry::new(fba, slab).expect("ipc registry init failed")
    });
    crate::ipc::set_registry(ipc);

    let named = NAMED.call_once(|| {
        NamedChannelRegistry::new(fba, ipc).expect("named channel init failed")
    });
    crate::ipc::set_named_channels(named);

    FIRMWARE.call_once(|| (rsdt_phys, framebuffer_phys));

    let pairs =
        install_syscall_capabilities(caps, slab).ok_or(KernelError::OutOfMemory)?;

    log::info!("kernel core initialized, {} syscalls installed", pairs.len());
    Ok(pairs)
}

/// Hosted builds: bring the whole core up once, over leaked buffers, so
/// tests can exercise the boot path and the syscall surface end to end.
#[cfg(not(target_os = "none"))]
pub fn init_hosted_test_kernel() {
    use std::boxed::Box;
    use std::sync::Once as StdOnce;
    use std::vec::Vec;

    static INIT: StdOnce = StdOnce::new();

    INIT.call_once(|| {
        use crate::mm::vmm::PageTable;
        use crate::mm::{MemoryKind, PAGE_SIZE};

        // A window of real, page-aligned memory stands in for the FBA's
        // reserved virtual range.
        let mut window = Vec::new();
        window.resize_with(512, PageTable::zeroed);
        let fba_begin = Box::leak(window.into_boxed_slice()).as_mut_ptr() as usize;

        let memory_map = Box::leak(Box::new([MemoryMapEntry {
            base: 0x10_0000,
            length: 2048 * PAGE_SIZE as u64,
            kind: MemoryKind::Usable,
        }]));

        let mut extents = Vec::new();
        extents.resize(2100, MemoryExtent::EMPTY);
        let extent_buffer = Box::leak(extents.into_boxed_slice());

        let config = BootConfig {
            memory_map,
            managed_base: 0,
            extent_buffer,
            reclaim_exec_mods: false,
            fba_begin,
            fba_size_blocks: BLOCKS_PER_BITMAP_PAGE,
            rsdt_phys: 0x7fe_0000,
            framebuffer_phys: 0xfd00_0000,
            cpu_id: 0,
            lapic_id: 0,
        };

        kernel_init(config).expect("hosted kernel init");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosted_boot_brings_every_singleton_up() {
        init_hosted_test_kernel();

        assert!(crate::mm::physical_region().is_ok());
        assert!(crate::mm::kernel_fba().is_ok());
        assert!(crate::mm::kernel_slab().is_ok());
        assert!(crate::mm::refcount_map().is_ok());
        assert!(crate::cap::capability_map().is_ok());
        assert!(crate::ipc::registry().is_ok());
        assert!(crate::ipc::named_channels().is_ok());
        assert_eq!(firmware_rsdt_phys(), Some(0x7fe_0000));
        assert_eq!(framebuffer_phys(), Some(0xfd00_0000));
    }

    #[test]
    fn boot_allocators_actually_allocate() {
        init_hosted_test_kernel();

        let fba = crate::mm::kernel_fba().unwrap();
        let block = fba.alloc_block().unwrap();
        fba.free_block(block);

        let slab = crate::mm::kernel_slab().unwrap();
        let obj = slab.alloc_block().unwrap();
        // SAFETY: fresh block from this slab.
        unsafe { slab.free(obj) };
    }
}
