//! Hosted CPU mocks for the unit-test build
//!
//! Each test thread models one CPU: the interrupt flag and per-CPU pointer
//! are thread-local, the cycle counter is a shared monotonic counter, and
//! entropy is a deterministic generator. TLB and NMI operations record the
//! fact that they happened so tests can assert on them.

use core::cell::Cell;
use core::sync::atomic::{AtomicU64, Ordering};

std::thread_local! {
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
    static PER_CPU: Cell<*mut u8> = const { Cell::new(core::ptr::null_mut()) };
}

static CYCLES: AtomicU64 = AtomicU64::new(0x1000);
static ENTROPY_STATE: AtomicU64 = AtomicU64::new(0x243F_6A88_85A3_08D3);
static TLB_INVALIDATIONS: AtomicU64 = AtomicU64::new(0);
static NMI_BROADCASTS: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn disable_interrupts() {
    IRQ_ENABLED.with(|f| f.set(false));
}

#[inline]
pub fn enable_interrupts() {
    IRQ_ENABLED.with(|f| f.set(true));
}

#[inline]
pub fn interrupts_enabled() -> bool {
    IRQ_ENABLED.with(|f| f.get())
}

#[inline]
pub fn local_irq_save() -> u64 {
    let enabled = interrupts_enabled();
    disable_interrupts();
    enabled as u64
}

/// # Safety
/// Trivially safe on the hosted build; kept unsafe to match the real arch.
#[inline]
pub unsafe fn local_irq_restore(flags: u64) {
    if flags != 0 {
        enable_interrupts();
    }
}

#[inline]
pub fn invalidate_page(_virt: usize) {
    TLB_INVALIDATIONS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn read_cycle_counter() -> u64 {
    CYCLES.fetch_add(7, Ordering::Relaxed)
}

/// Deterministic entropy (splitmix64) so cookie tests are reproducible.
pub fn hardware_entropy() -> Option<u64> {
    let mut z = ENTROPY_STATE.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    Some(z ^ (z >> 31))
}

#[inline]
pub fn halt() {
    std::thread::yield_now();
}

/// # Safety
/// Trivially safe on the hosted build; kept unsafe to match the real arch.
pub unsafe fn set_per_cpu_base(base: *mut u8) {
    PER_CPU.with(|p| p.set(base));
}

#[inline]
pub fn per_cpu_base() -> *mut u8 {
    PER_CPU.with(|p| p.get())
}

/// # Safety
/// Trivially safe on the hosted build; kept unsafe to match the real arch.
pub unsafe fn nmi_broadcast_all_except_self() {
    NMI_BROADCASTS.fetch_add(1, Ordering::Relaxed);
}

/// Hosted no-op: tests drive task state directly rather than switching.
///
/// # Safety
/// Trivially safe on the hosted build; kept unsafe to match the real arch.
pub unsafe fn task_switch(_next: *mut crate::sched::task::Task) {}

pub fn test_tlb_invalidation_count() -> u64 {
    TLB_INVALIDATIONS.load(Ordering::Relaxed)
}

pub fn test_nmi_broadcast_count() -> u64 {
    NMI_BROADCASTS.load(Ordering::Relaxed)
}
