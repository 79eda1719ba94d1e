//! RISC-V 64 CPU primitives (nascent port)
//!
//! Mirrors the x86_64 surface. The per-CPU pointer lives in `tp`; there is
//! no hardware entropy source assumed, and the NMI broadcast has no
//! equivalent transport yet.

use core::arch::asm;

use riscv::register::sstatus;

#[inline]
pub fn disable_interrupts() {
    // SAFETY: clearing SIE only masks supervisor interrupts.
    unsafe { sstatus::clear_sie() };
}

#[inline]
pub fn enable_interrupts() {
    // SAFETY: handlers are installed before the first enable at boot.
    unsafe { sstatus::set_sie() };
}

#[inline]
pub fn interrupts_enabled() -> bool {
    sstatus::read().sie()
}

#[inline]
pub fn local_irq_save() -> u64 {
    let enabled = interrupts_enabled();
    disable_interrupts();
    enabled as u64
}

/// # Safety
/// `flags` must come from a matching `local_irq_save` on this hart.
#[inline]
pub unsafe fn local_irq_restore(flags: u64) {
    if flags != 0 {
        enable_interrupts();
    }
}

#[inline]
pub fn invalidate_page(virt: usize) {
    // SAFETY: sfence.vma with an address operand only invalidates that page.
    unsafe {
        asm!("sfence.vma {}, zero", in(reg) virt, options(nostack));
    }
}

#[inline]
pub fn read_cycle_counter() -> u64 {
    riscv::register::cycle::read64()
}

#[inline]
pub fn hardware_entropy() -> Option<u64> {
    None
}

#[inline]
pub fn halt() {
    riscv::asm::wfi();
}

/// # Safety
/// `base` must be the address of a live, page-sized per-CPU record.
pub unsafe fn set_per_cpu_base(base: *mut u8) {
    // SAFETY: tp is reserved for the per-hart pointer in kernel mode.
    unsafe {
        asm!("mv tp, {}", in(reg) base, options(nostack));
    }
}

#[inline]
pub fn per_cpu_base() -> *mut u8 {
    let ptr: *mut u8;
    // SAFETY: tp holds the per-hart record address set at bring-up.
    unsafe {
        asm!("mv {}, tp", out(reg) ptr, options(nostack, pure, readonly));
    }
    ptr
}

extern "C" {
    /// Platform assembly context switch (see `task_switch.S`).
    pub fn task_switch(next: *mut crate::sched::task::Task);
}
