//! Shared-page reference counts
//!
//! Chained hashtable from physical page address to sharer count, backing
//! copy-on-write. Buckets are pointer arrays striped across fixed blocks
//! (tracked by a slab-allocated block list so the array can outgrow one
//! page); entries are slab objects. An entry exists only while its count
//! is non-zero.

use core::ptr;

use crate::error::{KernelError, KernelResult};
use crate::mm::fba::FixedBlockAllocator;
use crate::mm::slab::SlabAllocator;
use crate::mm::{PhysAddr, PAGE_SIZE};
use crate::sync::SpinLock;

const INITIAL_SIZE: u64 = 1024;
const PTRS_PER_BLOCK: u64 = (PAGE_SIZE / core::mem::size_of::<*mut Entry>()) as u64;

#[repr(C)]
struct Entry {
    phys: PhysAddr,
    refs: u32,
    _pad: u32,
    next: *mut Entry,
    _reserved: [u64; 5],
}

const _: () = assert!(core::mem::size_of::<Entry>() == 64);

#[repr(C)]
struct BlockNode {
    block: *mut u8,
    next: *mut BlockNode,
    used: u64,
    _reserved: [u64; 5],
}

const _: () = assert!(core::mem::size_of::<BlockNode>() == 64);

struct MapInner {
    size: u64,
    num_entries: u64,
    block_list: *mut BlockNode,
}

/// Map of `physical page -> reference count`.
pub struct RefCountMap {
    fba: &'static FixedBlockAllocator,
    slab: &'static SlabAllocator,
    inner: SpinLock<MapInner>,
}

#[inline]
fn hash_address(addr: PhysAddr, size: u64) -> u64 {
    let golden_ratio: u64 = 0x9E37_79B9_7F4A_7C15;
    (addr.wrapping_mul(golden_ratio) >> 32) % size
}

impl RefCountMap {
    pub fn new(
        fba: &'static FixedBlockAllocator,
        slab: &'static SlabAllocator,
    ) -> KernelResult<Self> {
        let map = Self {
            fba,
            slab,
            inner: SpinLock::new(MapInner {
                size: INITIAL_SIZE,
                num_entries: 0,
                block_list: ptr::null_mut(),
            }),
        };

        {
            let mut inner = map.inner.lock_irqsave();
            if !map.alloc_bucket_array(&mut inner, INITIAL_SIZE) {
                return Err(KernelError::OutOfMemory);
            }
        }

        Ok(map)
    }

    /// Push a fresh zeroed bucket block onto `list`.
    fn add_block(&self, list: &mut *mut BlockNode) -> Option<*mut BlockNode> {
        let node = self.slab.alloc_zeroed::<BlockNode>()?;
        let block = match self.fba.alloc_block() {
            Some(block) => block,
            None => {
                // SAFETY: node was just allocated and is unpublished.
                unsafe { self.slab.free(node) };
                return None;
            }
        };

        // SAFETY: fresh block, fresh node.
        unsafe {
            ptr::write_bytes(block.as_ptr(), 0, PAGE_SIZE);
            let node = node.as_ptr();
            (*node).block = block.as_ptr();
            (*node).next = *list;
            (*node).used = PTRS_PER_BLOCK * core::mem::size_of::<*mut Entry>() as u64;
            *list = node;
            Some(node)
        }
    }

    /// Allocate enough blocks onto `inner.block_list` for `size` bucket
    /// slots, freeing anything partially built on failure.
    fn alloc_bucket_array(&self, inner: &mut MapInner, size: u64) -> bool {
        let blocks_needed = size.div_ceil(PTRS_PER_BLOCK);

        for _ in 0..blocks_needed {
            if self.add_block(&mut inner.block_list).is_none() {
                self.free_blocks(inner);
                return false;
            }
        }

        inner.size = size;
        true
    }

    fn free_blocks(&self, inner: &mut MapInner) {
        while !inner.block_list.is_null() {
            let node = inner.block_list;
            // SAFETY: block_list nodes are live slab objects we own.
            unsafe {
                inner.block_list = (*node).next;
                if let Some(block) = ptr::NonNull::new((*node).block) {
                    self.fba.free_block(block);
                }
                self.slab.free(ptr::NonNull::new_unchecked(node));
            }
        }
    }

    /// The bucket slot for index `idx`, page-then-offset through the block
    /// list.
    fn bucket_ptr(inner: &MapInner, idx: u64) -> *mut *mut Entry {
        let block_idx = idx / PTRS_PER_BLOCK;
        let offset = idx % PTRS_PER_BLOCK;

        let mut cursor = inner.block_list;
        for _ in 0..block_idx {
            if cursor.is_null() {
                return ptr::null_mut();
            }
            // SAFETY: cursor is a live block node.
            cursor = unsafe { (*cursor).next };
        }

        if cursor.is_null() {
            return ptr::null_mut();
        }

        // SAFETY: cursor live; offset < PTRS_PER_BLOCK keeps us in-page.
        unsafe { ((*cursor).block as *mut *mut Entry).add(offset as usize) }
    }

    fn resize(&self, inner: &mut MapInner) -> bool {
        let new_size = inner.size * 2;

        let mut new_inner = MapInner {
            size: new_size,
            num_entries: inner.num_entries,
            block_list: ptr::null_mut(),
        };

        if !self.alloc_bucket_array(&mut new_inner, new_size) {
            return false;
        }

        // Rehash every live entry into the new buckets.
        for i in 0..inner.size {
            let bucket = Self::bucket_ptr(inner, i);
            // SAFETY: bucket slots are valid for the whole old array.
            let mut entry = unsafe { *bucket };

            while !entry.is_null() {
                // SAFETY: chain entries are live slab objects.
                unsafe {
                    let next = (*entry).next;
                    let new_idx = hash_address((*entry).phys, new_size);
                    let new_bucket = Self::bucket_ptr(&new_inner, new_idx);
                    (*entry).next = *new_bucket;
                    *new_bucket = entry;
                    entry = next;
                }
            }
        }

        self.free_blocks(inner);
        inner.size = new_inner.size;
        inner.block_list = new_inner.block_list;
        true
    }

    /// Bump the count for `addr`, creating the entry at 1. Returns the new
    /// count, or 0 on allocation failure.
    pub fn increment(&self, addr: PhysAddr) -> u32 {
        let mut inner = self.inner.lock_irqsave();

        let idx = hash_address(addr, inner.size);
        let bucket = Self::bucket_ptr(&inner, idx);
        // SAFETY: bucket slot valid for the live array.
        let mut entry = unsafe { *bucket };

        while !entry.is_null() {
            // SAFETY: chain entries are live.
            unsafe {
                if (*entry).phys == addr {
                    (*entry).refs += 1;
                    return (*entry).refs;
                }
                entry = (*entry).next;
            }
        }

        if 4 * inner.num_entries >= 3 * inner.size && !self.resize(&mut inner) {
            return 0;
        }

        let idx = hash_address(addr, inner.size);
        let bucket = Self::bucket_ptr(&inner, idx);

        let new_entry = match self.slab.alloc_zeroed::<Entry>() {
            Some(entry) => entry.as_ptr(),
            None => return 0,
        };

        // SAFETY: fresh entry; bucket slot valid.
        unsafe {
            (*new_entry).phys = addr;
            (*new_entry).refs = 1;
            (*new_entry).next = *bucket;
            *bucket = new_entry;
        }
        inner.num_entries += 1;

        1
    }

    /// Drop the count for `addr`, returning the pre-decrement count. When
    /// the count reaches zero the entry is unlinked and freed and 0 is
    /// returned. Unknown addresses return 0.
    pub fn decrement(&self, addr: PhysAddr) -> u32 {
        let mut inner = self.inner.lock_irqsave();

        let idx = hash_address(addr, inner.size);
        let bucket = Self::bucket_ptr(&inner, idx);
        // SAFETY: bucket slot valid for the live array.
        let mut entry = unsafe { *bucket };
        let mut prev: *mut Entry = ptr::null_mut();

        while !entry.is_null() {
            // SAFETY: chain entries are live.
            unsafe {
                if (*entry).phys == addr {
                    (*entry).refs -= 1;

                    if (*entry).refs == 0 {
                        if prev.is_null() {
                            *bucket = (*entry).next;
                        } else {
                            (*prev).next = (*entry).next;
                        }
                        self.slab.free(ptr::NonNull::new_unchecked(entry));
                        inner.num_entries -= 1;
                        return 0;
                    }

                    return (*entry).refs;
                }
                prev = entry;
                entry = (*entry).next;
            }
        }

        0
    }

    /// Current count for `addr` (0 when untracked).
    pub fn count(&self, addr: PhysAddr) -> u32 {
        let inner = self.inner.lock_irqsave();

        let idx = hash_address(addr, inner.size);
        let bucket = Self::bucket_ptr(&inner, idx);
        // SAFETY: bucket slot valid for the live array.
        let mut entry = unsafe { *bucket };

        while !entry.is_null() {
            // SAFETY: chain entries are live.
            unsafe {
                if (*entry).phys == addr {
                    return (*entry).refs;
                }
                entry = (*entry).next;
            }
        }

        0
    }

    /// Live entry count (test visibility).
    pub fn entries(&self) -> u64 {
        self.inner.lock_irqsave().num_entries
    }

    /// Current bucket-array size (test visibility).
    pub fn table_size(&self) -> u64 {
        self.inner.lock_irqsave().size
    }
}

// SAFETY: all pointer structure is guarded by the inner spinlock.
unsafe impl Send for RefCountMap {}
unsafe impl Sync for RefCountMap {}
