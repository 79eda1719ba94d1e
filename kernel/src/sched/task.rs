//! Tasks
//!
//! The 64-byte task control block lives at the base of its own kernel
//! stack block; the scheduler sidecar (`TaskSched`) is a slab object so
//! the hot switch path only touches the TCB cache line.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU64, Ordering};

use crate::mm::fba::FixedBlockAllocator;
use crate::mm::slab::SlabAllocator;
use crate::mm::PAGE_SIZE;
use crate::process::Process;
use crate::smp::percpu;

pub const DEFAULT_TIMESLICE: u16 = 10;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskClass {
    Idle = 0,
    Normal,
    High,
    Realtime,
}

impl TaskClass {
    /// Default queue priority for the class; lower sorts first.
    pub fn default_priority(self) -> u8 {
        match self {
            TaskClass::Realtime => 0,
            TaskClass::High => 20,
            TaskClass::Normal => 40,
            TaskClass::Idle => 250,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Blocked = 0,
    Ready,
    Running,
}

/// Scheduler bookkeeping kept off the switch fast path.
#[repr(C)]
pub struct TaskSched {
    pub tid: u64,
    pub ts_remain: u16,
    pub state: TaskState,
    pub class: TaskClass,
    pub prio: u8,
    _pad: [u8; 3],
    _reserved: [u64; 6],
}

const _: () = assert!(core::mem::size_of::<TaskSched>() == 64);

/// Task control block. The context-switch path depends on this exact
/// layout; keep the field order in sync with the platform assembly.
#[repr(C)]
pub struct Task {
    /// Intrusive link for whichever queue currently holds the task.
    pub(crate) next: *mut Task,
    pub sched: *mut TaskSched,
    /// Kernel stack pointer (top of the task's stack block).
    pub rsp0: usize,
    /// Saved user stack pointer.
    pub ssp: usize,
    pub owner: *mut Process,
    /// Duplicated from the owning process to avoid a cache miss on the
    /// naive switch path.
    pub pml4: u64,
    pub usp_stash: usize,
    _reserved: u64,
}

const _: () = assert!(core::mem::size_of::<Task>() == 64);

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Create a task: TCB embedded at the base of a fresh kernel stack block
/// (or of the caller-supplied stack when `sys_ssp` is non-zero), sidecar
/// from the slab. The task starts `Ready` but is not queued.
///
/// `entry_point` is recorded at the top of the kernel stack for the
/// platform switch code to return into.
pub fn create(
    fba: &'static FixedBlockAllocator,
    slab: &'static SlabAllocator,
    owner: *mut Process,
    sp: usize,
    sys_ssp: usize,
    entry_point: usize,
    class: TaskClass,
) -> Option<NonNull<Task>> {
    let stack_base = if sys_ssp == 0 {
        fba.alloc_block()?.as_ptr() as usize
    } else {
        sys_ssp & !(PAGE_SIZE - 1)
    };

    let sched = match slab.alloc_zeroed::<TaskSched>() {
        Some(sched) => sched.as_ptr(),
        None => {
            if sys_ssp == 0 {
                // SAFETY: the stack block was just allocated and is unused.
                unsafe {
                    fba.free_block(NonNull::new_unchecked(stack_base as *mut u8));
                }
            }
            return None;
        }
    };

    let task = stack_base as *mut Task;
    let pml4 = if owner.is_null() {
        0
    } else {
        // SAFETY: a non-null owner is a live process record.
        unsafe { (*owner).pml4 }
    };

    // SAFETY: the TCB slot at the stack base is exclusively ours; the
    // entry-point push stays within the stack block.
    unsafe {
        let mut rsp0 = stack_base + PAGE_SIZE;
        rsp0 -= core::mem::size_of::<usize>();
        *(rsp0 as *mut usize) = entry_point;

        (*sched).tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
        (*sched).ts_remain = DEFAULT_TIMESLICE;
        (*sched).state = TaskState::Ready;
        (*sched).class = class;
        (*sched).prio = class.default_priority();

        ptr::write(
            task,
            Task {
                next: ptr::null_mut(),
                sched,
                rsp0,
                ssp: sp,
                owner,
                pml4,
                usp_stash: 0,
                _reserved: 0,
            },
        );
    }

    NonNull::new(task)
}

/// Tear a task down: sidecar back to the slab, stack block (which holds
/// the TCB itself) back to the fixed-block allocator.
///
/// # Safety
/// `task` must be off every queue and not current on any CPU.
pub unsafe fn destroy(
    task: NonNull<Task>,
    fba: &'static FixedBlockAllocator,
    slab: &'static SlabAllocator,
) {
    // SAFETY: per contract, nothing references the task any more.
    unsafe {
        let sched = (*task.as_ptr()).sched;
        if !sched.is_null() {
            slab.free(NonNull::new_unchecked(sched));
        }
        fba.free_block(task.cast());
    }
}

/// The task currently executing on this CPU.
pub fn current() -> Option<NonNull<Task>> {
    NonNull::new(percpu::current().current_task())
}

/// Install `task` as this CPU's current task (boot and test paths; the
/// scheduler does this itself on a normal switch).
pub fn set_current(task: Option<NonNull<Task>>) {
    percpu::current().set_current_task(task.map_or(ptr::null_mut(), NonNull::as_ptr));
}
