//! Virtual memory mapper
//!
//! Maps and unmaps 4 KiB pages through the recursive page-table window, in
//! the current address space or in an "other" space bridged through the
//! secondary recursive slot. Missing intermediate tables are created from
//! the physical region.
//!
//! The hosted build substitutes a bookkeeping model of the page tables
//! (per-thread maps of virt → entry) so allocator and process code can be
//! unit-tested without an MMU.

use bitflags::bitflags;

bitflags! {
    /// Page-table entry flags. Bits 12–51 of an entry hold the physical
    /// page number; bit 9 is software-available and records copy-on-write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const COPY_ON_WRITE = 1 << 9;
        const NO_EXEC = 1 << 63;
    }
}

/// Mask of the physical-page-number bits in an entry.
pub const ENTRY_ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

/// One 512-entry page table, at any level.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [u64; 512],
}

impl PageTable {
    pub const fn zeroed() -> Self {
        Self { entries: [0; 512] }
    }
}

const _: () = assert!(core::mem::size_of::<PageTable>() == crate::mm::PAGE_SIZE);

/// Kernel-virtual base of the per-CPU scratch pages, one page per CPU.
pub const PER_CPU_TEMP_PAGE_BASE: usize = 0xffff_ffff_8200_0000;

/// The scratch-page address for a CPU. Callers must hold a no-preemption
/// window while a mapping is installed there.
#[cfg(target_os = "none")]
pub fn per_cpu_temp_page_addr(cpu_id: u64) -> usize {
    PER_CPU_TEMP_PAGE_BASE + cpu_id as usize * crate::mm::PAGE_SIZE
}

#[cfg(target_os = "none")]
mod imp {
    use super::{PageFlags, PageTable, ENTRY_ADDRESS_MASK};
    use crate::arch;
    use crate::error::{KernelError, KernelResult};
    use crate::mm::recursive::{
        self, pd_index, pdpt_index, pml4_index, pt_index, RECURSIVE_ENTRY,
    };
    use crate::mm::{self, KERNEL_SPACE_START, PhysAddr, VirtAddr};

    /// The current address space's PML4, through the recursive window.
    pub fn find_pml4() -> *mut PageTable {
        recursive::pml4_address() as *mut PageTable
    }

    /// The PML4 of the space currently bridged into the OTHER slot.
    pub fn other_space_pml4() -> *mut PageTable {
        recursive::pdpt_address(recursive::RECURSIVE_ENTRY_OTHER) as *mut PageTable
    }

    /// Ensure the PDPT/PD/PT covering `virt` exist under the recursive
    /// slot `slot`, creating zeroed tables as needed.
    ///
    /// Returns the virtual address of the PTE slot for `virt`.
    unsafe fn ensure_tables(slot: usize, virt: VirtAddr) -> KernelResult<*mut u64> {
        let region = mm::physical_region()?;

        let l1 = pml4_index(virt);
        let l2 = pdpt_index(virt);
        let l3 = pd_index(virt);

        // (entry address, table-to-create address) per level, top down.
        let levels = [
            (
                recursive::table_address(slot, slot, slot, slot, l1 << 3),
                recursive::table_address(slot, slot, slot, l1, 0),
            ),
            (
                recursive::table_address(slot, slot, slot, l1, l2 << 3),
                recursive::table_address(slot, slot, l1, l2, 0),
            ),
            (
                recursive::table_address(slot, slot, l1, l2, l3 << 3),
                recursive::table_address(slot, l1, l2, l3, 0),
            ),
        ];

        for (entry_addr, table_addr) in levels {
            let entry_ptr = entry_addr as *mut u64;

            // SAFETY: recursive addresses are valid while the slot maps a
            // live PML4; caller guarantees that.
            let entry = unsafe { core::ptr::read_volatile(entry_ptr) };

            if entry & PageFlags::PRESENT.bits() == 0 {
                let table_phys = region.alloc().ok_or(KernelError::OutOfMemory)?;

                let mut flags = PageFlags::PRESENT | PageFlags::WRITE;
                if virt < KERNEL_SPACE_START {
                    flags |= PageFlags::USER;
                }

                // SAFETY: entry_ptr as above; the new table becomes
                // addressable at table_addr once the entry is written.
                unsafe {
                    core::ptr::write_volatile(entry_ptr, table_phys | flags.bits());
                    arch::invalidate_page(table_addr);

                    let table = table_addr as *mut PageTable;
                    for i in 0..512 {
                        core::ptr::write_volatile((*table).entries.as_mut_ptr().add(i), 0);
                    }
                }
            }
        }

        let l4 = pt_index(virt);
        Ok(recursive::table_address(slot, l1, l2, l3, l4 << 3) as *mut u64)
    }

    unsafe fn map_page_at_slot(
        slot: usize,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
    ) -> KernelResult<()> {
        // SAFETY: caller contract of map_page / map_page_in.
        let pte = unsafe { ensure_tables(slot, virt) }?;

        // SAFETY: ensure_tables returned a live PTE slot.
        unsafe {
            core::ptr::write_volatile(pte, (phys & ENTRY_ADDRESS_MASK) | flags.bits());
        }
        arch::invalidate_page(virt);
        Ok(())
    }

    /// Map `virt` → `phys` in the current address space.
    ///
    /// Panics if a page table cannot be allocated: this path is used while
    /// bringing the kernel allocators up, before any caller could recover.
    ///
    /// # Safety
    /// `virt` must not alias live kernel data, and `phys` must be a frame
    /// the caller owns.
    pub unsafe fn map_page(virt: VirtAddr, phys: PhysAddr, flags: PageFlags) {
        // SAFETY: per caller contract.
        if unsafe { map_page_at_slot(RECURSIVE_ENTRY, virt, phys, flags) }.is_err() {
            panic!("out of physical memory creating page tables for {virt:#x}");
        }
    }

    /// `map_page` with `phys` masked down to its page base.
    ///
    /// # Safety
    /// As for `map_page`.
    pub unsafe fn map_page_containing(virt: VirtAddr, phys: PhysAddr, flags: PageFlags) {
        // SAFETY: per caller contract.
        unsafe { map_page(virt, phys & ENTRY_ADDRESS_MASK, flags) }
    }

    /// Map `virt` → `phys` in the address space bridged into the OTHER
    /// recursive slot. Table-allocation failure bubbles up.
    ///
    /// # Safety
    /// `other_pml4` must be the OTHER-slot alias of a PML4 whose own OTHER
    /// entry is self-referential for the duration of the call.
    pub unsafe fn map_page_in(
        other_pml4: *mut PageTable,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
    ) -> KernelResult<()> {
        let slot = recursive::pml4_virt_to_recursive_entry(other_pml4 as usize);
        // SAFETY: per caller contract.
        unsafe { map_page_at_slot(slot, virt, phys, flags) }
    }

    /// Clear the PTE for `virt` and invalidate the TLB entry.
    ///
    /// # Safety
    /// Nothing may rely on the mapping after this returns.
    pub unsafe fn unmap_page(virt: VirtAddr) {
        let pte = recursive::pte_address(virt) as *mut u64;
        // SAFETY: the PTE slot is addressable whenever the page was mapped.
        unsafe { core::ptr::write_volatile(pte, 0) };
        arch::invalidate_page(virt);
    }

    /// The raw PTE for `virt` (flags included), or 0 unless every level is
    /// present. 4 KiB mappings only; large pages deliberately read as 0.
    pub fn virt_to_pt_entry(virt: VirtAddr) -> u64 {
        // SAFETY: each level is only dereferenced after its parent entry
        // proved present, so the recursive address is backed.
        unsafe {
            let pml4e = core::ptr::read_volatile(recursive::pml4e_address(virt) as *const u64);
            if pml4e & 1 == 0 {
                return 0;
            }
            let pdpte = core::ptr::read_volatile(recursive::pdpte_address(virt) as *const u64);
            if pdpte & 1 == 0 {
                return 0;
            }
            let pde = core::ptr::read_volatile(recursive::pde_address(virt) as *const u64);
            if pde & 1 == 0 {
                return 0;
            }
            let pte = core::ptr::read_volatile(recursive::pte_address(virt) as *const u64);
            if pte & 1 == 0 {
                return 0;
            }
            pte
        }
    }

    /// Physical base of the page mapping `virt`, if mapped.
    pub fn virt_to_phys_page(virt: VirtAddr) -> Option<PhysAddr> {
        match virt_to_pt_entry(virt) {
            0 => None,
            pte => Some(pte & ENTRY_ADDRESS_MASK),
        }
    }

    /// Full physical translation of `virt`, if mapped.
    pub fn virt_to_phys(virt: VirtAddr) -> Option<PhysAddr> {
        virt_to_phys_page(virt).map(|page| page | (virt as u64 & 0xfff))
    }

    /// Like `virt_to_phys_page`, but walking the address space bridged
    /// into the OTHER recursive slot.
    ///
    /// # Safety
    /// As for `map_page_in`.
    pub unsafe fn virt_to_phys_page_in(
        other_pml4: *mut PageTable,
        virt: VirtAddr,
    ) -> Option<PhysAddr> {
        let slot = recursive::pml4_virt_to_recursive_entry(other_pml4 as usize);
        let l1 = pml4_index(virt);
        let l2 = pdpt_index(virt);
        let l3 = pd_index(virt);
        let l4 = pt_index(virt);

        let entries = [
            recursive::table_address(slot, slot, slot, slot, l1 << 3),
            recursive::table_address(slot, slot, slot, l1, l2 << 3),
            recursive::table_address(slot, slot, l1, l2, l3 << 3),
            recursive::table_address(slot, l1, l2, l3, l4 << 3),
        ];

        let mut leaf = 0;
        for entry_addr in entries {
            // SAFETY: each level is only read after its parent proved
            // present; the bridge is live per the caller contract.
            leaf = unsafe { core::ptr::read_volatile(entry_addr as *const u64) };
            if leaf & PageFlags::PRESENT.bits() == 0 {
                return None;
            }
        }

        Some(leaf & ENTRY_ADDRESS_MASK)
    }
}

#[cfg(not(target_os = "none"))]
mod hosted {
    use core::cell::RefCell;

    use std::boxed::Box;
    use std::collections::HashMap;

    use super::{PageFlags, PageTable, ENTRY_ADDRESS_MASK};
    use crate::error::KernelResult;
    use crate::mm::{PhysAddr, VirtAddr, PAGE_SIZE};

    std::thread_local! {
        static CURRENT_SPACE: RefCell<HashMap<usize, u64>> = RefCell::new(HashMap::new());
        static OTHER_SPACES: RefCell<HashMap<usize, HashMap<usize, u64>>> =
            RefCell::new(HashMap::new());
        static CURRENT_PML4: RefCell<Option<*mut PageTable>> = const { RefCell::new(None) };
        static OTHER_PML4: RefCell<Option<*mut PageTable>> = const { RefCell::new(None) };
        static TEMP_PAGE: RefCell<Option<*mut u8>> = const { RefCell::new(None) };
    }

    fn leak_table() -> *mut PageTable {
        Box::into_raw(Box::new(PageTable::zeroed()))
    }

    pub fn find_pml4() -> *mut PageTable {
        CURRENT_PML4.with(|c| *c.borrow_mut().get_or_insert_with(leak_table))
    }

    pub fn other_space_pml4() -> *mut PageTable {
        OTHER_PML4.with(|c| *c.borrow_mut().get_or_insert_with(leak_table))
    }

    pub fn per_cpu_temp_page_addr(_cpu_id: u64) -> usize {
        TEMP_PAGE.with(|c| {
            *c.borrow_mut()
                .get_or_insert_with(|| leak_table().cast::<u8>())
        }) as usize
    }

    /// # Safety
    /// Trivially safe on the hosted build; kept unsafe to match the real
    /// mapper.
    pub unsafe fn map_page(virt: VirtAddr, phys: PhysAddr, flags: PageFlags) {
        CURRENT_SPACE.with(|s| {
            s.borrow_mut().insert(
                virt & !(PAGE_SIZE - 1),
                (phys & ENTRY_ADDRESS_MASK) | flags.bits(),
            )
        });
    }

    /// # Safety
    /// As for `map_page`.
    pub unsafe fn map_page_containing(virt: VirtAddr, phys: PhysAddr, flags: PageFlags) {
        // SAFETY: hosted bookkeeping only.
        unsafe { map_page(virt, phys & ENTRY_ADDRESS_MASK, flags) }
    }

    /// # Safety
    /// As for `map_page`.
    pub unsafe fn map_page_in(
        other_pml4: *mut PageTable,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
    ) -> KernelResult<()> {
        OTHER_SPACES.with(|s| {
            s.borrow_mut()
                .entry(other_pml4 as usize)
                .or_default()
                .insert(virt, (phys & ENTRY_ADDRESS_MASK) | flags.bits())
        });
        Ok(())
    }

    /// # Safety
    /// As for `map_page`.
    pub unsafe fn unmap_page(virt: VirtAddr) {
        CURRENT_SPACE.with(|s| s.borrow_mut().remove(&(virt & !(PAGE_SIZE - 1))));
    }

    pub fn virt_to_pt_entry(virt: VirtAddr) -> u64 {
        CURRENT_SPACE.with(|s| {
            s.borrow()
                .get(&(virt & !(PAGE_SIZE - 1)))
                .copied()
                .filter(|pte| pte & PageFlags::PRESENT.bits() != 0)
                .unwrap_or(0)
        })
    }

    pub fn virt_to_phys_page(virt: VirtAddr) -> Option<PhysAddr> {
        match virt_to_pt_entry(virt) {
            0 => None,
            pte => Some(pte & ENTRY_ADDRESS_MASK),
        }
    }

    pub fn virt_to_phys(virt: VirtAddr) -> Option<PhysAddr> {
        virt_to_phys_page(virt).map(|page| page | (virt as u64 & 0xfff))
    }

    /// # Safety
    /// As for `map_page`.
    pub unsafe fn virt_to_phys_page_in(
        other_pml4: *mut PageTable,
        virt: VirtAddr,
    ) -> Option<PhysAddr> {
        test_entry_in(other_pml4, virt)
            .filter(|pte| pte & PageFlags::PRESENT.bits() != 0)
            .map(|pte| pte & ENTRY_ADDRESS_MASK)
    }

    /// Test hook: the raw entry recorded for `virt` in a bridged space.
    pub fn test_entry_in(other_pml4: *mut PageTable, virt: VirtAddr) -> Option<u64> {
        OTHER_SPACES.with(|s| {
            s.borrow()
                .get(&(other_pml4 as usize))
                .and_then(|space| space.get(&virt).copied())
        })
    }

    /// Test hook: reset this thread's mapping model.
    pub fn test_reset_spaces() {
        CURRENT_SPACE.with(|s| s.borrow_mut().clear());
        OTHER_SPACES.with(|s| s.borrow_mut().clear());
    }
}

#[cfg(target_os = "none")]
pub use imp::*;

#[cfg(not(target_os = "none"))]
pub use hosted::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PAGE_SIZE;

    #[test]
    fn mapping_round_trip() {
        test_reset_spaces();

        unsafe {
            map_page(0x40_0000, 0x1234_5000, PageFlags::PRESENT | PageFlags::WRITE);
        }

        assert_eq!(virt_to_phys_page(0x40_0000), Some(0x1234_5000));
        assert_eq!(virt_to_phys(0x40_0123), Some(0x1234_5123));

        unsafe { unmap_page(0x40_0000) };
        assert_eq!(virt_to_phys_page(0x40_0000), None);
    }

    #[test]
    fn map_page_containing_masks_offset() {
        test_reset_spaces();

        unsafe {
            map_page_containing(0x80_0000, 0x9999_9abc, PageFlags::PRESENT);
        }
        assert_eq!(virt_to_phys_page(0x80_0000), Some(0x9999_9000));
    }

    #[test]
    fn non_present_entries_translate_to_nothing() {
        test_reset_spaces();

        unsafe {
            map_page(0xc0_0000, 0x5000, PageFlags::COPY_ON_WRITE);
        }
        // Entry recorded but not PRESENT: the walk reports unmapped.
        assert_eq!(virt_to_pt_entry(0xc0_0000), 0);
        assert_eq!(virt_to_phys_page(0xc0_0000), None);
    }

    #[test]
    fn scratch_page_is_page_aligned_and_stable() {
        let a = per_cpu_temp_page_addr(0);
        let b = per_cpu_temp_page_addr(0);
        assert_eq!(a, b);
        assert_eq!(a % PAGE_SIZE, 0);
    }
}
