//! Per-CPU state
//!
//! One page-sized, cache-line-aligned record per CPU, reached through the
//! arch's fast per-CPU base register. The first slot holds the record's
//! own address so the lookup is a single indirect load.
//!
//! The record is private to its CPU except for the scheduler lock, which
//! remote CPUs take only to queue a task here (IPWI path), and the sleep
//! queue drained by this CPU's timer tick.

use core::cell::{Cell, UnsafeCell};
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::error::KernelResult;
use crate::sched::queue::TaskPriorityQueue;
use crate::sched::sleep::SleepQueue;
use crate::sched::task::Task;
use crate::sync::RawSpinLock;

pub const MAX_CPUS: usize = 64;

/// Per-CPU scheduler state: the ready queue and round-robin bookkeeping.
pub struct SchedData {
    pub ready: TaskPriorityQueue,
    /// Monotonic count of timer ticks taken on this CPU.
    pub upticks: u64,
}

impl SchedData {
    pub const fn new() -> Self {
        Self {
            ready: TaskPriorityQueue::new(),
            upticks: 0,
        }
    }
}

impl Default for SchedData {
    fn default() -> Self {
        Self::new()
    }
}

/// Page-sized per-CPU record.
#[repr(C, align(4096))]
pub struct PerCpu {
    /// Must stay the first field: the per-CPU base register points here
    /// and `arch::per_cpu_base` reads it back through offset 0.
    self_ptr: *mut PerCpu,
    pub cpu_id: u64,
    pub lapic_id: u64,

    sched_lock: RawSpinLock,
    irq_disable_count: Cell<u32>,

    sched: UnsafeCell<SchedData>,
    current_task: Cell<*mut Task>,
    sleep_queue: UnsafeCell<SleepQueue>,

    /// Monotonic input to capability cookie generation.
    cookie_counter: Cell<u64>,
}

const _: () = assert!(core::mem::size_of::<PerCpu>() <= crate::mm::PAGE_SIZE);

// SAFETY: cross-CPU access is limited to sched_lock (a lock) and, under
// it, the ready queue; everything else is owner-CPU only by protocol.
unsafe impl Sync for PerCpu {}
unsafe impl Send for PerCpu {}

static CPUS: [AtomicPtr<PerCpu>; MAX_CPUS] = {
    const NULL: AtomicPtr<PerCpu> = AtomicPtr::new(ptr::null_mut());
    [NULL; MAX_CPUS]
};
static CPU_COUNT: AtomicUsize = AtomicUsize::new(0);

impl PerCpu {
    fn new(cpu_id: u64, lapic_id: u64) -> Self {
        Self {
            self_ptr: ptr::null_mut(),
            cpu_id,
            lapic_id,
            sched_lock: RawSpinLock::new(),
            irq_disable_count: Cell::new(0),
            sched: UnsafeCell::new(SchedData::new()),
            current_task: Cell::new(ptr::null_mut()),
            sleep_queue: UnsafeCell::new(SleepQueue::new()),
            cookie_counter: Cell::new(1),
        }
    }

    pub fn sched_lock(&self) -> &RawSpinLock {
        &self.sched_lock
    }

    pub fn irq_disable_count(&self) -> u32 {
        self.irq_disable_count.get()
    }

    pub fn set_irq_disable_count(&self, count: u32) {
        self.irq_disable_count.set(count);
    }

    /// Scheduler data for this CPU.
    ///
    /// # Safety
    /// Caller must hold this CPU's scheduler lock (or be its boot path).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn sched_data(&self) -> &mut SchedData {
        // SAFETY: exclusivity per the caller contract.
        unsafe { &mut *self.sched.get() }
    }

    /// This CPU's sleep queue.
    ///
    /// # Safety
    /// Caller must hold this CPU's scheduler lock.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn sleep_queue(&self) -> &mut SleepQueue {
        // SAFETY: exclusivity per the caller contract.
        unsafe { &mut *self.sleep_queue.get() }
    }

    pub fn current_task(&self) -> *mut Task {
        self.current_task.get()
    }

    pub fn set_current_task(&self, task: *mut Task) {
        self.current_task.set(task);
    }

    /// Next value of the per-CPU monotonic cookie counter.
    pub fn next_cookie_count(&self) -> u64 {
        let value = self.cookie_counter.get();
        self.cookie_counter.set(value.wrapping_add(1));
        value
    }
}

/// Install a freshly allocated state record for this CPU and point the
/// per-CPU base register at it. Called once per CPU at bring-up; records
/// are never freed.
///
/// # Safety
/// Must run on the CPU being brought up, exactly once, with the kernel
/// fixed-block allocator initialized.
#[cfg(target_os = "none")]
pub unsafe fn init_this_cpu(cpu_id: u64, lapic_id: u64) -> KernelResult<&'static PerCpu> {
    let block = crate::mm::kernel_fba()?
        .alloc_block()
        .ok_or(crate::error::KernelError::OutOfMemory)?;

    let state = block.as_ptr() as *mut PerCpu;

    // SAFETY: the block is page-sized and page-aligned, exclusively ours.
    unsafe {
        ptr::write(state, PerCpu::new(cpu_id, lapic_id));
        (*state).self_ptr = state;
        crate::arch::set_per_cpu_base(state as *mut u8);
    }

    register(state, cpu_id);

    // SAFETY: just initialized, never freed.
    Ok(unsafe { &*state })
}

/// Hosted: each test thread lazily gets its own CPU 0 record.
#[cfg(not(target_os = "none"))]
pub unsafe fn init_this_cpu(cpu_id: u64, lapic_id: u64) -> KernelResult<&'static PerCpu> {
    let state = std::boxed::Box::leak(std::boxed::Box::new(PerCpu::new(cpu_id, lapic_id)));
    let ptr = state as *mut PerCpu;
    state.self_ptr = ptr;
    // SAFETY: state just leaked, lives forever.
    unsafe { crate::arch::set_per_cpu_base(ptr as *mut u8) };
    register(ptr, cpu_id);
    Ok(state)
}

fn register(state: *mut PerCpu, cpu_id: u64) {
    if (cpu_id as usize) < MAX_CPUS {
        CPUS[cpu_id as usize].store(state, Ordering::Release);
        CPU_COUNT.fetch_add(1, Ordering::Relaxed);
    }
}

/// This CPU's state record.
pub fn current() -> &'static PerCpu {
    let base = crate::arch::per_cpu_base();

    #[cfg(not(target_os = "none"))]
    if base.is_null() {
        // First touch on this test thread: bring up a mock CPU 0.
        // SAFETY: once per thread by the null check.
        return unsafe { init_this_cpu(0, 0) }.expect("hosted per-CPU init");
    }

    debug_assert!(!base.is_null(), "per-CPU base used before init_this_cpu");
    // SAFETY: the base register points at a live, never-freed record.
    unsafe { &*(base as *mut PerCpu) }
}

/// The state record registered for `cpu_id`, if that CPU is up.
pub fn for_cpu(cpu_id: usize) -> Option<&'static PerCpu> {
    if cpu_id >= MAX_CPUS {
        return None;
    }
    let ptr = CPUS[cpu_id].load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        // SAFETY: registered records are never freed.
        Some(unsafe { &*ptr })
    }
}

pub fn online_count() -> usize {
    CPU_COUNT.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_is_stable_and_self_pointing() {
        let a = current();
        let b = current();
        assert!(core::ptr::eq(a, b));
        assert_eq!(a.self_ptr as *const PerCpu, a as *const PerCpu);
    }

    #[test]
    fn cookie_counter_is_monotonic() {
        let cpu = current();
        let a = cpu.next_cookie_count();
        let b = cpu.next_cookie_count();
        assert!(b > a);
    }

    #[test]
    fn record_fits_one_page() {
        assert!(core::mem::size_of::<PerCpu>() <= crate::mm::PAGE_SIZE);
        assert_eq!(core::mem::align_of::<PerCpu>(), crate::mm::PAGE_SIZE);
    }
}
