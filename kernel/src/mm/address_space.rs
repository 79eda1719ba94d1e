//! Address-space lifecycle
//!
//! Creating a process address space: a fresh PML4 is bridged into the
//! OTHER recursive slot, kernel space is copied verbatim, requested user
//! regions are mapped copy-on-write with their share counts bumped, and
//! the initial stack is built with the caller's values laid in through
//! the per-CPU scratch page. The scratch-page copy runs inside a
//! no-preemption window: being migrated mid-copy would leave the scratch
//! mapping pointing at another CPU's idea of the page.

use crate::arch;
use crate::mm::recursive::{FIRST_KERNEL_PML4E, RECURSIVE_ENTRY, RECURSIVE_ENTRY_OTHER};
use crate::mm::vmm::{self, PageFlags, PageTable};
use crate::mm::{KernelEnv, KERNEL_SPACE_START, PAGE_SIZE};
use crate::sched::{sched_lock_this_cpu, sched_unlock_this_cpu};
use crate::smp::percpu;
use crate::sync::RawSpinLock;

/// Hard cap on initial stack values (the process-creation ABI feeds
/// these from capability and argv arrays).
pub const MAX_STACK_VALUE_COUNT: usize = 64;

/// Physical frames kept aside from the top of the new stack for the
/// value copy: argv data may run to 32 pages, plus one for capabilities.
pub const INIT_STACK_ARG_PAGES_COUNT: usize = 33;

/// A user region shared copy-on-write into the new space.
#[derive(Debug, Clone, Copy)]
pub struct AddressSpaceRegion {
    pub start: usize,
    pub len_bytes: usize,
}

// One creation at a time: the OTHER recursive slot is global state.
static ADDRESS_SPACE_LOCK: RawSpinLock = RawSpinLock::new();

/// Pre-populate every vacant kernel-half PML4 slot with a zeroed PDPT,
/// so kernel space is structurally identical in every address space and
/// later spaces can copy the entries verbatim.
pub fn address_space_init(env: KernelEnv) -> bool {
    let pml4 = vmm::find_pml4();

    for i in FIRST_KERNEL_PML4E..512 {
        // SAFETY: the current PML4 is live through the recursive window.
        unsafe {
            if (*pml4).entries[i] & PageFlags::PRESENT.bits() != 0 {
                continue;
            }

            let Some(new_pdpt) = env.region.alloc() else {
                return false;
            };

            (*pml4).entries[i] =
                new_pdpt | (PageFlags::PRESENT | PageFlags::WRITE).bits();

            let vaddr = crate::mm::recursive::pdpt_address(i);
            arch::invalidate_page(vaddr);

            #[cfg(target_os = "none")]
            {
                let table = vaddr as *mut PageTable;
                for j in 0..512 {
                    core::ptr::write_volatile((*table).entries.as_mut_ptr().add(j), 0);
                }
            }
        }
    }

    true
}

struct CreateState<'a> {
    env: KernelEnv,
    new_pml4_phys: u64,
    new_pml4_virt: *mut PageTable,
    regions: &'a [AddressSpaceRegion],
    /// How far the COW mapping got, for unwinding.
    cow_done: (usize, usize),
    stack_vaddr: usize,
    /// How many stack pages were mapped, from the top down.
    stack_pages_done: usize,
    stack_page_count: usize,
}

impl CreateState<'_> {
    /// Give back everything acquired so far: COW share counts, stack
    /// frames, and the PML4 page itself.
    unsafe fn unwind(&self) {
        // SAFETY: the bridge is still up; mapped pages translate.
        unsafe {
            let (regions_done, pages_done) = self.cow_done;
            for (index, region) in self.regions.iter().enumerate().take(regions_done + 1) {
                let pages = region.len_bytes / PAGE_SIZE;
                let limit = if index == regions_done { pages_done } else { pages };
                for page in 0..limit {
                    let virt = region.start + page * PAGE_SIZE;
                    if let Some(phys) =
                        vmm::virt_to_phys_page_in(self.new_pml4_virt, virt)
                    {
                        self.env.refcounts.decrement(phys);
                    }
                }
            }

            let stack_top = self.stack_vaddr + self.stack_page_count * PAGE_SIZE;
            for page in 0..self.stack_pages_done {
                let virt = stack_top - (page + 1) * PAGE_SIZE;
                if let Some(phys) = vmm::virt_to_phys_page_in(self.new_pml4_virt, virt) {
                    self.env.region.free(phys);
                }
            }

            self.env.region.free(self.new_pml4_phys);
        }
    }
}

/// Build a new address space and return its PML4's physical address.
///
/// Kernel space is shared, the given user regions are mapped COW from
/// the current space, and an initial stack of `init_stack_len` bytes at
/// `init_stack_vaddr` is allocated with `stack_values` laid out at its
/// top. Page-table pages are kernel-owned; stack frames become the new
/// process's once it is wrapped in a `Process`.
pub fn address_space_create(
    env: KernelEnv,
    init_stack_vaddr: usize,
    init_stack_len: usize,
    regions: &[AddressSpaceRegion],
    stack_values: &[u64],
) -> Option<u64> {
    let init_stack_vaddr = init_stack_vaddr & !(PAGE_SIZE - 1);
    let init_stack_end = init_stack_vaddr + init_stack_len;

    // The syscall layer validates userspace arguments too; these checks
    // also cover kernel-internal callers.
    if init_stack_vaddr >= KERNEL_SPACE_START || init_stack_end > KERNEL_SPACE_START {
        return None;
    }

    if stack_values.len() > init_stack_len / core::mem::size_of::<u64>()
        || stack_values.len() > MAX_STACK_VALUE_COUNT
    {
        return None;
    }

    for region in regions {
        if region.start >= KERNEL_SPACE_START
            || region.start + region.len_bytes > KERNEL_SPACE_START
            || region.start & (PAGE_SIZE - 1) != 0
            || region.len_bytes & (PAGE_SIZE - 1) != 0
        {
            return None;
        }
    }

    // NOTE: pagetable memory is not process-owned.
    let new_pml4_phys = env.region.alloc()?;

    let lock_flags = ADDRESS_SPACE_LOCK.lock_irqsave();

    let current_pml4 = vmm::find_pml4();
    let new_pml4_virt = vmm::other_space_pml4();

    let mut state = CreateState {
        env,
        new_pml4_phys,
        new_pml4_virt,
        regions,
        cow_done: (0, 0),
        stack_vaddr: init_stack_vaddr,
        stack_pages_done: 0,
        stack_page_count: init_stack_len / PAGE_SIZE,
    };

    // SAFETY: the address-space lock serializes every user of the OTHER
    // slot; tables are reached through live recursive mappings.
    unsafe {
        // Bridge the new table into the OTHER slot.
        let saved_other = (*current_pml4).entries[RECURSIVE_ENTRY_OTHER];
        (*current_pml4).entries[RECURSIVE_ENTRY_OTHER] =
            new_pml4_phys | (PageFlags::PRESENT | PageFlags::WRITE).bits();
        arch::invalidate_page(new_pml4_virt as usize);

        let restore = |state: &CreateState<'_>| {
            // SAFETY: bridge teardown under the address-space lock.
            unsafe {
                (*current_pml4).entries[RECURSIVE_ENTRY_OTHER] = saved_other;
            }
            arch::invalidate_page(state.new_pml4_virt as usize);
        };

        // Userspace starts empty.
        for i in 0..RECURSIVE_ENTRY {
            (*new_pml4_virt).entries[i] = 0;
        }

        // The new table needs both recursive slots live while it is
        // being edited from this side of the bridge: mapping functions
        // reach its lower tables through its own OTHER slot.
        (*new_pml4_virt).entries[RECURSIVE_ENTRY] =
            new_pml4_phys | (PageFlags::PRESENT | PageFlags::WRITE).bits();
        (*new_pml4_virt).entries[RECURSIVE_ENTRY_OTHER] =
            new_pml4_phys | (PageFlags::PRESENT | PageFlags::WRITE).bits();

        // Kernel space is identical in every address space.
        for i in FIRST_KERNEL_PML4E..512 {
            (*new_pml4_virt).entries[i] = (*current_pml4).entries[i];
        }

        // Map the shared regions copy-on-write. Pages missing from the
        // current space are skipped, not errors.
        for (index, region) in regions.iter().enumerate() {
            let pages = region.len_bytes / PAGE_SIZE;
            for page in 0..pages {
                let virt = region.start + page * PAGE_SIZE;
                state.cow_done = (index, page);

                let Some(shared_phys) = vmm::virt_to_phys_page(virt) else {
                    continue;
                };

                if vmm::map_page_in(
                    new_pml4_virt,
                    virt,
                    shared_phys,
                    PageFlags::PRESENT | PageFlags::USER | PageFlags::COPY_ON_WRITE,
                )
                .is_err()
                {
                    state.unwind();
                    restore(&state);
                    ADDRESS_SPACE_LOCK.unlock_irqrestore(lock_flags);
                    return None;
                }

                env.refcounts.increment(shared_phys);
            }
        }
        state.cow_done = (regions.len(), 0);

        // Initial stack, allocated top-down so the frames we need for
        // the value copy are the first `INIT_STACK_ARG_PAGES_COUNT`.
        let mut top_phys_stack_pages = [0u64; INIT_STACK_ARG_PAGES_COUNT];

        for page in 0..state.stack_page_count {
            let virt = init_stack_end - (page + 1) * PAGE_SIZE;

            let Some(stack_page) = env.region.alloc() else {
                state.unwind();
                restore(&state);
                ADDRESS_SPACE_LOCK.unlock_irqrestore(lock_flags);
                return None;
            };

            if page < INIT_STACK_ARG_PAGES_COUNT {
                top_phys_stack_pages[page] = stack_page;
            }

            if vmm::map_page_in(
                new_pml4_virt,
                virt,
                stack_page,
                PageFlags::PRESENT | PageFlags::WRITE | PageFlags::USER,
            )
            .is_err()
            {
                env.region.free(stack_page);
                state.unwind();
                restore(&state);
                ADDRESS_SPACE_LOCK.unlock_irqrestore(lock_flags);
                return None;
            }

            state.stack_pages_done = page + 1;
        }

        // Copy the initial values in through this CPU's scratch page,
        // descending from the stack top and remapping at each page
        // boundary. No preemption from here to the unmap: the scratch
        // mapping is per-CPU state.
        if !stack_values.is_empty() && state.stack_page_count > 0 {
            sched_lock_this_cpu();

            let temp_page = vmm::per_cpu_temp_page_addr(percpu::current().cpu_id);
            let mut cursor = temp_page as *mut u64;

            for i in (0..stack_values.len()).rev() {
                if cursor == temp_page as *mut u64 {
                    let phys = top_phys_stack_pages[i >> 9];
                    vmm::map_page(
                        temp_page,
                        phys,
                        PageFlags::PRESENT | PageFlags::WRITE,
                    );
                    cursor = (temp_page + PAGE_SIZE) as *mut u64;
                }

                cursor = cursor.sub(1);
                core::ptr::write_volatile(cursor, stack_values[i]);
            }

            vmm::unmap_page(temp_page);
            sched_unlock_this_cpu();
        }

        // Drop the bridge: the new space's own OTHER slot goes back to
        // empty, and ours goes back to whatever it held.
        (*new_pml4_virt).entries[RECURSIVE_ENTRY_OTHER] = 0;
        restore(&state);

        ADDRESS_SPACE_LOCK.unlock_irqrestore(lock_flags);
    }

    Some(new_pml4_phys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame_allocator::MemoryExtent;
    use crate::mm::frame_allocator::PhysicalRegion;
    use crate::mm::{MemoryKind, MemoryMapEntry};
    use crate::process::tests::test_env;
    use std::boxed::Box;

    const STACK_BASE: usize = 0x7fff_0000_0000;

    #[test]
    fn create_maps_stack_and_copies_values() {
        crate::mm::vmm::test_reset_spaces();
        let env = test_env();

        let free_before = env.region.free_bytes();
        let values = [0xAAu64, 0xBB, 0xCC];

        let pml4 = address_space_create(env, STACK_BASE, 4 * PAGE_SIZE, &[], &values)
            .expect("address space create");

        // One PML4 plus four stack pages came out of the region.
        assert_eq!(
            env.region.free_bytes(),
            free_before - 5 * PAGE_SIZE as u64
        );

        // Every stack page is mapped user-writable in the new space.
        let other = vmm::other_space_pml4();
        for page in 0..4 {
            let virt = STACK_BASE + page * PAGE_SIZE;
            let entry = vmm::test_entry_in(other, virt).expect("stack page mapped");
            let flags = PageFlags::from_bits_truncate(entry);
            assert!(flags.contains(PageFlags::PRESENT | PageFlags::WRITE | PageFlags::USER));
        }

        // The values were written descending from the stack top through
        // the scratch window.
        let temp = vmm::per_cpu_temp_page_addr(0) as *const u64;
        unsafe {
            assert_eq!(*temp.add(509), 0xAA);
            assert_eq!(*temp.add(510), 0xBB);
            assert_eq!(*temp.add(511), 0xCC);
        }

        // The scratch mapping was torn down afterwards.
        assert_eq!(vmm::virt_to_phys_page(vmm::per_cpu_temp_page_addr(0)), None);

        assert_ne!(pml4, 0);
    }

    #[test]
    fn create_marks_shared_regions_copy_on_write() {
        crate::mm::vmm::test_reset_spaces();
        let env = test_env();

        // A page mapped in the "current" space to share.
        let shared_virt = 0x4000_0000usize;
        let shared_phys = 0xabc000u64;
        unsafe {
            vmm::map_page(
                shared_virt,
                shared_phys,
                PageFlags::PRESENT | PageFlags::WRITE | PageFlags::USER,
            );
        }

        let regions = [AddressSpaceRegion {
            start: shared_virt,
            len_bytes: 2 * PAGE_SIZE,
        }];

        address_space_create(env, STACK_BASE, PAGE_SIZE, &regions, &[]).unwrap();

        // The present page went in COW with its share count bumped; the
        // absent second page was skipped.
        let other = vmm::other_space_pml4();
        let entry = vmm::test_entry_in(other, shared_virt).unwrap();
        let flags = PageFlags::from_bits_truncate(entry);
        assert!(flags.contains(PageFlags::PRESENT | PageFlags::USER | PageFlags::COPY_ON_WRITE));
        assert!(!flags.contains(PageFlags::WRITE));
        assert_eq!(entry & vmm::ENTRY_ADDRESS_MASK, shared_phys);

        assert_eq!(env.refcounts.count(shared_phys), 1);
        assert!(vmm::test_entry_in(other, shared_virt + PAGE_SIZE).is_none());
    }

    #[test]
    fn create_rejects_kernel_space_arguments() {
        let env = test_env();
        let free_before = env.region.free_bytes();

        assert!(address_space_create(env, KERNEL_SPACE_START, PAGE_SIZE, &[], &[]).is_none());

        let bad_region = [AddressSpaceRegion {
            start: 0x1234,
            len_bytes: PAGE_SIZE,
        }];
        assert!(address_space_create(env, STACK_BASE, PAGE_SIZE, &bad_region, &[]).is_none());

        let too_many = [0u64; MAX_STACK_VALUE_COUNT + 1];
        assert!(
            address_space_create(env, STACK_BASE, PAGE_SIZE * 2, &[], &too_many).is_none()
        );

        // Nothing was allocated by any refused call.
        assert_eq!(env.region.free_bytes(), free_before);
    }

    #[test]
    fn allocation_failure_unwinds_cleanly() {
        crate::mm::vmm::test_reset_spaces();
        let mut env = test_env();

        // A region with only three frames: PML4 plus two stack pages,
        // one short of the four requested.
        let map = [MemoryMapEntry {
            base: 0x500000,
            length: 3 * PAGE_SIZE as u64,
            kind: MemoryKind::Usable,
        }];
        let mut buf = std::vec::Vec::new();
        buf.resize(16, MemoryExtent::EMPTY);
        let small: &'static PhysicalRegion = Box::leak(Box::new(PhysicalRegion::init(
            &map,
            0,
            Box::leak(buf.into_boxed_slice()),
            false,
        )));
        env.region = small;

        let free_before = small.free_bytes();
        assert!(address_space_create(env, STACK_BASE, 4 * PAGE_SIZE, &[], &[]).is_none());

        // Everything acquired on the way down was given back.
        assert_eq!(small.free_bytes(), free_before);
        assert!(small.check_free_invariant());
    }
}
