//! x86_64 CPU primitives
//!
//! Everything the portable core needs from the CPU: the interrupt flag,
//! TLB invalidation, the cycle counter, hardware entropy, and the GS-based
//! per-CPU pointer. The context switch itself lives in platform assembly
//! (it depends on the exact `Task` layout) and is only declared here.

pub mod lapic;

use core::arch::asm;

use x86_64::instructions::{hlt, interrupts, random::RdRand, tlb};
use x86_64::registers::model_specific::GsBase;
use x86_64::VirtAddr;

#[inline]
pub fn disable_interrupts() {
    interrupts::disable();
}

#[inline]
pub fn enable_interrupts() {
    interrupts::enable();
}

#[inline]
pub fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}

/// Disable interrupts, returning the prior IF state for `local_irq_restore`.
#[inline]
pub fn local_irq_save() -> u64 {
    let enabled = interrupts::are_enabled();
    interrupts::disable();
    enabled as u64
}

/// Restore the interrupt state saved by `local_irq_save`.
///
/// # Safety
/// `flags` must come from a matching `local_irq_save` on this CPU.
#[inline]
pub unsafe fn local_irq_restore(flags: u64) {
    if flags != 0 {
        interrupts::enable();
    }
}

/// Invalidate the TLB entry for one virtual address on this CPU.
#[inline]
pub fn invalidate_page(virt: usize) {
    tlb::flush(VirtAddr::new(virt as u64));
}

#[inline]
pub fn read_cycle_counter() -> u64 {
    // SAFETY: rdtsc is unprivileged with CR4.TSD clear, which we never set.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// One quad of hardware entropy, if the CPU has RDRAND.
#[inline]
pub fn hardware_entropy() -> Option<u64> {
    RdRand::new().and_then(|r| r.get_u64())
}

#[inline]
pub fn halt() {
    hlt();
}

/// Point GS at this CPU's state record. The record's first slot must hold
/// its own address so `per_cpu_base` is a single GS-relative load.
///
/// # Safety
/// `base` must be the address of a live, page-sized per-CPU record.
pub unsafe fn set_per_cpu_base(base: *mut u8) {
    GsBase::write(VirtAddr::new(base as u64));
}

#[inline]
pub fn per_cpu_base() -> *mut u8 {
    let ptr: *mut u8;
    // SAFETY: gs:0 is the self-pointer installed by set_per_cpu_base.
    unsafe {
        asm!("mov {}, gs:[0]", out(reg) ptr, options(nostack, pure, readonly));
    }
    ptr
}

extern "C" {
    /// Save the current task's context and resume `next`. Implemented in
    /// platform assembly against the fixed `Task` layout.
    pub fn task_switch(next: *mut crate::sched::task::Task);
}
