//! Process-owned physical pages
//!
//! Tracks every physical page a process owns in fixed-block-backed
//! blocks of entries. Shared pages participate in the refcount map:
//! removal decrements the share count and only frees the frame when this
//! process was the last holder. None of these lock-internally-taking
//! functions are reentrant.

use core::ptr::{self, NonNull};

use crate::mm::frame_allocator::PhysicalRegion;
use crate::mm::{KernelEnv, PhysAddr, PAGE_SIZE};
use crate::process::Process;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProcessPageEntry {
    pub region: *const PhysicalRegion,
    pub addr: PhysAddr,
}

pub const PAGES_PER_BLOCK: usize =
    (PAGE_SIZE - core::mem::size_of::<ProcessPageBlockHeader>()) / core::mem::size_of::<ProcessPageEntry>();

#[repr(C)]
pub struct ProcessPageBlockHeader {
    next: *mut ProcessPageBlock,
    count: u16,
    _pad: [u16; 3],
}

/// One fixed block of owned-page entries.
#[repr(C)]
pub struct ProcessPageBlock {
    header: ProcessPageBlockHeader,
    entries: [ProcessPageEntry; PAGES_PER_BLOCK],
}

const _: () = assert!(core::mem::size_of::<ProcessPageBlock>() <= PAGE_SIZE);

/// Head record, stored in its own fixed block.
#[repr(C)]
pub struct ProcessPages {
    head: *mut ProcessPageBlock,
}

/// Record `phys` as owned by `process`. A shared page's refcount is
/// incremented first; failure there (or any allocation failure) records
/// nothing.
pub fn add_owned_page(
    env: KernelEnv,
    process: NonNull<Process>,
    region: &'static PhysicalRegion,
    phys: PhysAddr,
    shared: bool,
) -> bool {
    // SAFETY: process and meminfo are live; page list is under pages_lock.
    unsafe {
        let meminfo = (*process.as_ptr()).meminfo;
        let lock = (*meminfo).pages_lock.as_ref();
        let flags = lock.lock_irqsave();

        if (*meminfo).pages.is_null() {
            let Some(block) = env.fba.alloc_block() else {
                lock.unlock_irqrestore(flags);
                return false;
            };
            let pages = block.as_ptr() as *mut ProcessPages;
            (*pages).head = ptr::null_mut();
            (*meminfo).pages = pages;
        }

        if shared && env.refcounts.increment(phys) == 0 {
            lock.unlock_irqrestore(flags);
            return false;
        }

        let pages = (*meminfo).pages;

        let mut block = (*pages).head;
        while !block.is_null() && (*block).header.count as usize >= PAGES_PER_BLOCK {
            block = (*block).header.next;
        }

        if block.is_null() {
            let Some(new_block) = env.fba.alloc_block() else {
                if shared {
                    env.refcounts.decrement(phys);
                }
                lock.unlock_irqrestore(flags);
                return false;
            };
            block = new_block.as_ptr() as *mut ProcessPageBlock;
            (*block).header.count = 0;
            (*block).header.next = (*pages).head;
            (*pages).head = block;
        }

        let slot = (*block).header.count as usize;
        (*block).entries[slot] = ProcessPageEntry { region, addr: phys };
        (*block).header.count += 1;

        lock.unlock_irqrestore(flags);
        true
    }
}

/// Forget `phys`: decrement its share count, free the frame if this was
/// the last holder, and compact the entry block (empty blocks go back to
/// the block allocator).
pub fn remove_owned_page(env: KernelEnv, process: NonNull<Process>, phys: PhysAddr) -> bool {
    // SAFETY: process and meminfo are live; page list is under pages_lock.
    unsafe {
        let meminfo = (*process.as_ptr()).meminfo;
        if (*meminfo).pages.is_null() {
            return false;
        }

        let lock = (*meminfo).pages_lock.as_ref();
        let flags = lock.lock_irqsave();

        let pages = (*meminfo).pages;
        let mut block = (*pages).head;
        let mut prev: *mut ProcessPageBlock = ptr::null_mut();

        while !block.is_null() {
            for i in 0..(*block).header.count as usize {
                if (*block).entries[i].addr != phys {
                    continue;
                }

                let entry = (*block).entries[i];
                let prev_refs = env.refcounts.decrement(phys);

                if prev_refs <= 1 {
                    (*entry.region.cast_mut()).free(phys);
                }

                (*block).header.count -= 1;
                (*block).entries[i] = (*block).entries[(*block).header.count as usize];

                if (*block).header.count == 0 {
                    if prev.is_null() {
                        (*pages).head = (*block).header.next;
                    } else {
                        (*prev).header.next = (*block).header.next;
                    }
                    env.fba.free_block(NonNull::new_unchecked(block as *mut u8));
                }

                lock.unlock_irqrestore(flags);
                return true;
            }
            prev = block;
            block = (*block).header.next;
        }

        lock.unlock_irqrestore(flags);
        false
    }
}

/// Release everything the process still owns (process teardown).
pub fn release_owned_pages(env: KernelEnv, process: NonNull<Process>) {
    // SAFETY: process and meminfo are live; page list is under pages_lock.
    unsafe {
        let meminfo = (*process.as_ptr()).meminfo;
        if (*meminfo).pages.is_null() {
            return;
        }

        let lock = (*meminfo).pages_lock.as_ref();
        let flags = lock.lock_irqsave();

        let pages = (*meminfo).pages;
        let mut block = (*pages).head;

        while !block.is_null() {
            for i in 0..(*block).header.count as usize {
                let entry = (*block).entries[i];
                let prev_refs = env.refcounts.decrement(entry.addr);

                if prev_refs <= 1 {
                    (*entry.region.cast_mut()).free(entry.addr);
                }
            }
            let next = (*block).header.next;
            env.fba.free_block(NonNull::new_unchecked(block as *mut u8));
            block = next;
        }

        env.fba
            .free_block(NonNull::new_unchecked(pages as *mut u8));
        (*meminfo).pages = ptr::null_mut();

        lock.unlock_irqrestore(flags);
    }
}

/// Allocate a page from `region` and record it as process-owned. The
/// page is freed again if recording fails.
pub fn process_page_alloc(
    env: KernelEnv,
    process: NonNull<Process>,
    region: &'static PhysicalRegion,
) -> Option<PhysAddr> {
    let addr = region.alloc()?;

    if !add_owned_page(env, process, region, addr, false) {
        region.free(addr);
        return None;
    }

    Some(addr)
}

/// Free a process-owned page.
pub fn process_page_free(env: KernelEnv, process: NonNull<Process>, phys: PhysAddr) -> bool {
    remove_owned_page(env, process, phys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::tests::test_env;
    use crate::process::{process_create, process_destroy};

    #[test]
    fn page_alloc_records_ownership() {
        let env = test_env();
        let process = process_create(env, 0).unwrap();

        let free_before = env.region.free_bytes();
        let page = process_page_alloc(env, process, env.region).unwrap();
        assert_eq!(env.region.free_bytes(), free_before - PAGE_SIZE as u64);

        assert!(process_page_free(env, process, page));
        assert_eq!(env.region.free_bytes(), free_before);

        unsafe { process_destroy(env, process) };
    }

    #[test]
    fn destroy_releases_owned_pages() {
        let env = test_env();
        let process = process_create(env, 0).unwrap();

        let free_before = env.region.free_bytes();
        for _ in 0..4 {
            process_page_alloc(env, process, env.region).unwrap();
        }
        assert!(env.region.free_bytes() < free_before);

        unsafe { process_destroy(env, process) };
        assert_eq!(env.region.free_bytes(), free_before);
    }

    #[test]
    fn shared_pages_follow_the_refcount() {
        let env = test_env();
        let a = process_create(env, 0).unwrap();
        let b = process_create(env, 0).unwrap();

        // A allocates the page; B maps it shared (the COW path).
        let page = process_page_alloc(env, a, env.region).unwrap();
        assert_eq!(env.refcounts.increment(page), 1);
        assert!(add_owned_page(env, b, env.region, page, true));
        assert_eq!(env.refcounts.count(page), 2);

        let free_before = env.region.free_bytes();

        // B goes away: count drops, page survives.
        unsafe { process_destroy(env, b) };
        assert_eq!(env.refcounts.count(page), 1);
        assert_eq!(env.region.free_bytes(), free_before);

        // A goes away: count reaches zero, frame returns to the region.
        unsafe { process_destroy(env, a) };
        assert_eq!(env.refcounts.count(page), 0);
        assert_eq!(env.region.free_bytes(), free_before + PAGE_SIZE as u64);
    }

    #[test]
    fn remove_of_untracked_page_is_refused() {
        let env = test_env();
        let process = process_create(env, 0).unwrap();
        assert!(!process_page_free(env, process, 0xdead_0000));
        unsafe { process_destroy(env, process) };
    }
}
