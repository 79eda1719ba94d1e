//! Fixed-block allocator
//!
//! Hands out 4 KiB kernel pages from a reserved virtual window. A bitmap
//! prefix at the bottom of the window tracks block usage; the pages backing
//! the bitmap are themselves marked in use. Every other kernel allocator
//! (slab, hash tables, capability map) draws from here.

use core::ptr::NonNull;

use crate::error::{KernelError, KernelResult};
use crate::mm::frame_allocator::PhysicalRegion;
use crate::mm::vmm::{self, PageFlags};
use crate::mm::{is_page_aligned, VirtAddr, PAGE_SIZE};
use crate::sync::SpinLock;

/// One page of bitmap covers this many blocks (512 words × 64 bits), so
/// window sizes are constrained to a whole number of bitmap pages.
pub const BLOCKS_PER_BITMAP_PAGE: u64 = 512 * 64;

struct FbaInner {
    begin: VirtAddr,
    size_blocks: u64,
    bitmap_pages: u64,
}

impl FbaInner {
    #[inline]
    fn bitmap_words(&self) -> u64 {
        self.size_blocks / 64
    }

    /// # Safety
    /// `word` must be below `bitmap_words()` and the bitmap pages mapped.
    unsafe fn word_ptr(&self, word: u64) -> *mut u64 {
        (self.begin as *mut u64).wrapping_add(word as usize)
    }

    unsafe fn bit_is_set(&self, idx: u64) -> bool {
        // SAFETY: caller keeps idx < size_blocks.
        unsafe { *self.word_ptr(idx / 64) & (1 << (idx % 64)) != 0 }
    }

    unsafe fn set_bit(&self, idx: u64) {
        // SAFETY: caller keeps idx < size_blocks.
        unsafe { *self.word_ptr(idx / 64) |= 1 << (idx % 64) }
    }

    unsafe fn clear_bit(&self, idx: u64) {
        // SAFETY: caller keeps idx < size_blocks.
        unsafe { *self.word_ptr(idx / 64) &= !(1 << (idx % 64)) }
    }

    #[inline]
    fn block_addr(&self, idx: u64) -> VirtAddr {
        self.begin + idx as usize * PAGE_SIZE
    }
}

/// Bitmap-indexed allocator of 4 KiB kernel pages from a fixed window.
pub struct FixedBlockAllocator {
    region: &'static PhysicalRegion,
    inner: SpinLock<FbaInner>,
}

impl FixedBlockAllocator {
    /// Set up the allocator over `[begin, begin + size_blocks * 4 KiB)`.
    ///
    /// `begin` must be page aligned and `size_blocks` a multiple of
    /// `BLOCKS_PER_BITMAP_PAGE` so the bitmap is a whole number of pages.
    /// The bitmap pages are allocated, mapped, zeroed, and marked in use.
    pub fn init(
        region: &'static PhysicalRegion,
        begin: VirtAddr,
        size_blocks: u64,
    ) -> KernelResult<Self> {
        if !is_page_aligned(begin) {
            return Err(KernelError::InvalidAddress { addr: begin });
        }

        if size_blocks % BLOCKS_PER_BITMAP_PAGE != 0 {
            return Err(KernelError::InvalidArgument { name: "size_blocks" });
        }

        let bitmap_pages = size_blocks / BLOCKS_PER_BITMAP_PAGE;
        let bitmap_end = begin + (bitmap_pages as usize * PAGE_SIZE);

        let mut virt = begin;
        while virt < bitmap_end {
            let phys = region.alloc().ok_or(KernelError::OutOfMemory)?;

            // SAFETY: the window is reserved for this allocator; nothing
            // else maps into it.
            unsafe {
                vmm::map_page(virt, phys, PageFlags::PRESENT | PageFlags::WRITE);
                core::ptr::write_bytes(virt as *mut u8, 0, PAGE_SIZE);
            }
            virt += PAGE_SIZE;
        }

        let inner = FbaInner {
            begin,
            size_blocks,
            bitmap_pages,
        };

        for i in 0..bitmap_pages {
            // SAFETY: bitmap pages were just mapped.
            unsafe { inner.set_bit(i) };
        }

        Ok(Self {
            region,
            inner: SpinLock::new(inner),
        })
    }

    /// Allocate one mapped kernel page; returns its virtual address.
    pub fn alloc_block(&self) -> Option<NonNull<u8>> {
        let inner = self.inner.lock_irqsave();

        for word in 0..inner.bitmap_words() {
            // SAFETY: word < bitmap_words, bitmap mapped since init.
            let value = unsafe { *inner.word_ptr(word) };
            if value == u64::MAX {
                continue;
            }

            let bit = (!value).trailing_zeros() as u64;
            let idx = word * 64 + bit;

            let phys = self.region.alloc()?;

            // SAFETY: idx is free and in range; the block page is ours.
            unsafe {
                inner.set_bit(idx);
                vmm::map_page(
                    inner.block_addr(idx),
                    phys,
                    PageFlags::PRESENT | PageFlags::WRITE,
                );
            }

            return NonNull::new(inner.block_addr(idx) as *mut u8);
        }

        None
    }

    /// Allocate `count` virtually contiguous blocks (linear scan for a run
    /// of clear bits). Returns the first block's address.
    pub fn alloc_blocks(&self, count: u64) -> Option<NonNull<u8>> {
        if count == 0 {
            return None;
        }
        if count == 1 {
            return self.alloc_block();
        }

        let inner = self.inner.lock_irqsave();

        let mut run_start = 0u64;
        let mut run_len = 0u64;

        for idx in 0..inner.size_blocks {
            // SAFETY: idx < size_blocks.
            if unsafe { inner.bit_is_set(idx) } {
                run_len = 0;
                continue;
            }

            if run_len == 0 {
                run_start = idx;
            }
            run_len += 1;

            if run_len == count {
                // Back the whole run before publishing any of it.
                for i in 0..count {
                    let block = run_start + i;
                    match self.region.alloc() {
                        Some(phys) => {
                            // SAFETY: block is free and in range.
                            unsafe {
                                inner.set_bit(block);
                                vmm::map_page(
                                    inner.block_addr(block),
                                    phys,
                                    PageFlags::PRESENT | PageFlags::WRITE,
                                );
                            }
                        }
                        None => {
                            // Unwind the partially-built run.
                            for j in 0..i {
                                let built = run_start + j;
                                let addr = inner.block_addr(built);
                                let phys = vmm::virt_to_phys_page(addr);
                                // SAFETY: built blocks were mapped above.
                                unsafe {
                                    vmm::unmap_page(addr);
                                    inner.clear_bit(built);
                                }
                                if let Some(phys) = phys {
                                    self.region.free(phys);
                                }
                            }
                            return None;
                        }
                    }
                }

                return NonNull::new(inner.block_addr(run_start) as *mut u8);
            }
        }

        None
    }

    /// Return one block: clear its bit, unmap it, free the frame.
    pub fn free_block(&self, block: NonNull<u8>) {
        self.free_blocks(block, 1);
    }

    /// Return `count` contiguous blocks starting at `block`.
    pub fn free_blocks(&self, block: NonNull<u8>, count: u64) {
        let addr = block.as_ptr() as usize;
        let inner = self.inner.lock_irqsave();

        if !is_page_aligned(addr) || addr < inner.begin {
            debug_assert!(false, "freeing a bad block address");
            return;
        }

        let first = ((addr - inner.begin) / PAGE_SIZE) as u64;
        if first < inner.bitmap_pages || first + count > inner.size_blocks {
            debug_assert!(false, "freeing outside the block window");
            return;
        }

        for idx in first..first + count {
            let virt = inner.block_addr(idx);
            let phys = vmm::virt_to_phys_page(virt);

            // SAFETY: idx is in range; the block belongs to this window.
            unsafe {
                vmm::unmap_page(virt);
                inner.clear_bit(idx);
            }

            if let Some(phys) = phys {
                self.region.free(phys);
            }
        }
    }

    /// Bottom of the block window.
    pub fn window_base(&self) -> VirtAddr {
        self.inner.lock_irqsave().begin
    }

    /// Whether block `idx` is currently marked in use.
    pub fn block_in_use(&self, idx: u64) -> bool {
        let inner = self.inner.lock_irqsave();
        if idx >= inner.size_blocks {
            return false;
        }
        // SAFETY: bounds checked above.
        unsafe { inner.bit_is_set(idx) }
    }
}

// SAFETY: all interior mutation happens under the spinlock, and the window
// itself is only touched through owned blocks.
unsafe impl Send for FixedBlockAllocator {}
unsafe impl Sync for FixedBlockAllocator {}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mm::frame_allocator::MemoryExtent;
    use crate::mm::vmm::PageTable;
    use crate::mm::{MemoryKind, MemoryMapEntry};
    use std::boxed::Box;

    /// A page-aligned, writable virtual window for hosted FBA instances.
    pub fn test_window(pages: usize) -> VirtAddr {
        let mut v = std::vec::Vec::new();
        v.resize_with(pages, PageTable::zeroed);
        Box::leak(v.into_boxed_slice()).as_mut_ptr() as usize
    }

    pub fn test_region(pages: u64) -> &'static PhysicalRegion {
        let map = [MemoryMapEntry {
            base: 0x100_0000,
            length: pages * PAGE_SIZE as u64,
            kind: MemoryKind::Usable,
        }];
        let mut buf = std::vec::Vec::new();
        buf.resize(pages as usize + 8, MemoryExtent::EMPTY);
        let buffer = Box::leak(buf.into_boxed_slice());
        Box::leak(Box::new(PhysicalRegion::init(&map, 0, buffer, false)))
    }

    /// An FBA over a fresh window; the window only needs to back the
    /// blocks a test actually touches.
    pub fn test_fba(window_pages: usize) -> &'static FixedBlockAllocator {
        let region = test_region(window_pages as u64 * 2);
        let begin = test_window(window_pages);
        Box::leak(Box::new(
            FixedBlockAllocator::init(region, begin, BLOCKS_PER_BITMAP_PAGE).unwrap(),
        ))
    }

    #[test]
    fn init_rejects_bad_arguments() {
        let region = test_region(8);
        assert!(matches!(
            FixedBlockAllocator::init(region, 0x123, BLOCKS_PER_BITMAP_PAGE),
            Err(KernelError::InvalidAddress { .. })
        ));

        let begin = test_window(4);
        assert!(matches!(
            FixedBlockAllocator::init(region, begin, 100),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn bitmap_pages_are_marked_in_use() {
        let fba = test_fba(64);
        // One bitmap page for 0x8000 blocks.
        assert!(fba.block_in_use(0));
        assert!(!fba.block_in_use(1));
    }

    #[test]
    fn alloc_returns_first_free_block_after_bitmap() {
        let fba = test_fba(64);

        let a = fba.alloc_block().unwrap();
        assert_eq!(a.as_ptr() as usize, fba.window_base() + PAGE_SIZE);
        assert!(fba.block_in_use(1));

        let b = fba.alloc_block().unwrap();
        assert_eq!(b.as_ptr() as usize, fba.window_base() + 2 * PAGE_SIZE);
    }

    #[test]
    fn freed_blocks_are_reused_lowest_first() {
        let fba = test_fba(64);

        let a = fba.alloc_block().unwrap();
        let _b = fba.alloc_block().unwrap();

        fba.free_block(a);
        assert!(!fba.block_in_use(1));

        let c = fba.alloc_block().unwrap();
        assert_eq!(c.as_ptr(), a.as_ptr());
    }

    #[test]
    fn blocks_are_writable_through_the_window() {
        let fba = test_fba(64);
        let block = fba.alloc_block().unwrap();

        // SAFETY: freshly allocated block backed by the test window.
        unsafe {
            core::ptr::write_bytes(block.as_ptr(), 0xA5, PAGE_SIZE);
            assert_eq!(*block.as_ptr().add(PAGE_SIZE - 1), 0xA5);
        }
    }

    #[test]
    fn alloc_blocks_finds_contiguous_run() {
        let fba = test_fba(64);

        let single = fba.alloc_block().unwrap();
        let run = fba.alloc_blocks(4).unwrap();

        assert_eq!(
            run.as_ptr() as usize,
            single.as_ptr() as usize + PAGE_SIZE
        );
        for idx in 2..6 {
            assert!(fba.block_in_use(idx));
        }

        fba.free_blocks(run, 4);
        for idx in 2..6 {
            assert!(!fba.block_in_use(idx));
        }
    }

    #[test]
    fn alloc_blocks_skips_fragmented_gaps() {
        let fba = test_fba(64);

        let a = fba.alloc_block().unwrap(); // idx 1
        let b = fba.alloc_block().unwrap(); // idx 2
        let _c = fba.alloc_block().unwrap(); // idx 3
        fba.free_block(b);

        // A two-block run cannot use the single free slot at idx 2.
        let run = fba.alloc_blocks(2).unwrap();
        assert_eq!(run.as_ptr() as usize, a.as_ptr() as usize + 3 * PAGE_SIZE);
    }

    #[test]
    fn exhausted_region_fails_cleanly() {
        // Region with only enough frames for the bitmap plus two blocks.
        let region = test_region(3);
        let begin = test_window(16);
        let fba = FixedBlockAllocator::init(region, begin, BLOCKS_PER_BITMAP_PAGE).unwrap();

        assert!(fba.alloc_block().is_some());
        assert!(fba.alloc_block().is_some());
        assert!(fba.alloc_block().is_none());
    }
}
