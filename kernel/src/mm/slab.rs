//! Slab allocator
//!
//! Fixed 64-byte objects carved out of fixed-block pages, kept on an
//! intrusive free list. Every core kernel record (task, process, IPC
//! message, mutex, region node…) is sized to fit one slab block.

use core::ptr::NonNull;

use crate::mm::fba::FixedBlockAllocator;
use crate::mm::PAGE_SIZE;
use crate::sync::SpinLock;

/// All slab objects are this size.
pub const SLAB_BLOCK_SIZE: usize = 64;

const BLOCKS_PER_PAGE: usize = PAGE_SIZE / SLAB_BLOCK_SIZE;

struct FreeBlock {
    next: *mut FreeBlock,
}

struct SlabInner {
    free_head: *mut FreeBlock,
}

/// 64-byte object allocator layered on the fixed-block allocator.
pub struct SlabAllocator {
    fba: &'static FixedBlockAllocator,
    inner: SpinLock<SlabInner>,
}

impl SlabAllocator {
    pub const fn new(fba: &'static FixedBlockAllocator) -> Self {
        Self {
            fba,
            inner: SpinLock::new(SlabInner {
                free_head: core::ptr::null_mut(),
            }),
        }
    }

    /// Allocate one zeroed 64-byte block.
    pub fn alloc_block(&self) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock_irqsave();

        if inner.free_head.is_null() {
            // Carve a fresh page into blocks, newest at the head.
            let page = self.fba.alloc_block()?;

            for i in (0..BLOCKS_PER_PAGE).rev() {
                // SAFETY: the page is exclusively ours and block-aligned.
                unsafe {
                    let block = page.as_ptr().add(i * SLAB_BLOCK_SIZE) as *mut FreeBlock;
                    (*block).next = inner.free_head;
                    inner.free_head = block;
                }
            }
        }

        let block = inner.free_head;
        // SAFETY: free_head is non-null here and points into a carved page.
        unsafe {
            inner.free_head = (*block).next;
            core::ptr::write_bytes(block as *mut u8, 0, SLAB_BLOCK_SIZE);
        }

        NonNull::new(block as *mut u8)
    }

    /// Allocate a zeroed slab block typed as `T`.
    ///
    /// `T` must fit a slab block; the core's record types are all sized to
    /// exactly 64 bytes.
    pub fn alloc_zeroed<T>(&self) -> Option<NonNull<T>> {
        assert!(core::mem::size_of::<T>() <= SLAB_BLOCK_SIZE);
        assert!(core::mem::align_of::<T>() <= SLAB_BLOCK_SIZE);
        self.alloc_block().map(NonNull::cast)
    }

    /// Allocate a slab block and move `value` into it.
    pub fn alloc_init<T>(&self, value: T) -> Option<NonNull<T>> {
        let ptr = self.alloc_zeroed::<T>()?;
        // SAFETY: freshly allocated, correctly sized and aligned for T.
        unsafe { ptr.as_ptr().write(value) };
        Some(ptr)
    }

    /// Return a block to the head of the free list.
    ///
    /// # Safety
    /// `ptr` must come from this allocator and not be freed twice; any `T`
    /// it held must already be dropped or trivially droppable.
    pub unsafe fn free<T>(&self, ptr: NonNull<T>) {
        let mut inner = self.inner.lock_irqsave();
        let block = ptr.as_ptr() as *mut FreeBlock;
        // SAFETY: per contract, block is an idle slab block we own.
        unsafe {
            (*block).next = inner.free_head;
        }
        inner.free_head = block;
    }

    /// Number of blocks currently on the free list (test visibility).
    pub fn free_count(&self) -> usize {
        let inner = self.inner.lock_irqsave();
        let mut count = 0;
        let mut cursor = inner.free_head;
        while !cursor.is_null() {
            count += 1;
            // SAFETY: the free list only links idle blocks.
            cursor = unsafe { (*cursor).next };
        }
        count
    }
}

// SAFETY: the free list is only touched under the spinlock.
unsafe impl Send for SlabAllocator {}
unsafe impl Sync for SlabAllocator {}
