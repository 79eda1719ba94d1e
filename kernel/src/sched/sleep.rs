//! Sleep queue and timer-driven wakeups
//!
//! Deadline-ordered singly-linked sleepers per CPU. The queue owns a
//! zero-deadline sentinel node at its head, so the enqueue walk needs no
//! head special case; ties wake in enqueue order. The per-CPU timer tick
//! drains the due prefix through `check_sleepers`.

use core::ptr::{self, NonNull};

use crate::mm::slab::SlabAllocator;
use crate::sched::task::Task;
use crate::smp::percpu;

/// One sleeping task. Slab-allocated per sleep, freed on wake.
#[repr(C)]
pub struct Sleeper {
    next: *mut Sleeper,
    pub wake_at: u64,
    pub task: *mut Task,
    _reserved: [u64; 5],
}

const _: () = assert!(core::mem::size_of::<Sleeper>() == 64);

/// Deadline-ordered queue with an owned sentinel head.
pub struct SleepQueue {
    /// Always present, `wake_at == 0`: the walk starts here and never has
    /// to branch on an empty head.
    sentinel: Sleeper,
    tail: *mut Sleeper,
}

// SAFETY: confined behind the owning CPU's scheduler lock.
unsafe impl Send for SleepQueue {}

impl SleepQueue {
    pub const fn new() -> Self {
        Self {
            sentinel: Sleeper {
                next: ptr::null_mut(),
                wake_at: 0,
                task: ptr::null_mut(),
                _reserved: [0; 5],
            },
            tail: ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sentinel.next.is_null()
    }

    /// Splice `node` in before the first sleeper with a later deadline.
    ///
    /// # Safety
    /// `node` must be live and not on any queue.
    pub unsafe fn enqueue(&mut self, node: NonNull<Sleeper>) {
        let node = node.as_ptr();
        // SAFETY: node is ours; list links are live or null.
        unsafe {
            let deadline = (*node).wake_at;

            let mut prev: *mut Sleeper = &mut self.sentinel;
            while !(*prev).next.is_null() && (*(*prev).next).wake_at <= deadline {
                prev = (*prev).next;
            }

            (*node).next = (*prev).next;
            (*prev).next = node;

            if (*node).next.is_null() {
                self.tail = node;
            }
        }
    }

    /// Detach the prefix of sleepers with `wake_at <= now` and return it
    /// as a linked chain (walk it with [`Sleeper::take_next`]).
    pub fn dequeue(&mut self, now: u64) -> Option<NonNull<Sleeper>> {
        let first = self.sentinel.next;
        // SAFETY: list links are live or null.
        unsafe {
            if first.is_null() || (*first).wake_at > now {
                return None;
            }

            let mut last = first;
            while !(*last).next.is_null() && (*(*last).next).wake_at <= now {
                last = (*last).next;
            }

            self.sentinel.next = (*last).next;
            (*last).next = ptr::null_mut();

            if self.sentinel.next.is_null() {
                self.tail = ptr::null_mut();
            }
        }

        NonNull::new(first)
    }
}

impl Default for SleepQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Sleeper {
    /// Step along a dequeued chain, detaching this node.
    pub fn take_next(&mut self) -> Option<NonNull<Sleeper>> {
        let next = NonNull::new(self.next);
        self.next = ptr::null_mut();
        next
    }
}

/// Put the current CPU's `task` to sleep for at least `nanos`.
///
/// # Safety
/// Caller must hold this CPU's scheduler lock; `task` must be the
/// current task on this CPU.
pub unsafe fn sleep_task(task: NonNull<Task>, nanos: u64) -> bool {
    let timer = crate::timer::system();
    let wake_at = timer.current_ticks() + nanos / timer.nanos_per_tick();

    let slab = match crate::mm::kernel_slab() {
        Ok(slab) => slab,
        Err(_) => return false,
    };

    let Some(node) = slab.alloc_zeroed::<Sleeper>() else {
        return false;
    };

    // SAFETY: fresh node; sched lock held per contract.
    unsafe {
        (*node.as_ptr()).wake_at = wake_at;
        (*node.as_ptr()).task = task.as_ptr();

        percpu::current().sleep_queue().enqueue(node);
        crate::sched::block(task);
        crate::sched::schedule();
    }

    true
}

/// Wake every sleeper whose deadline has passed. Runs from the timer
/// tick with the scheduler lock held.
///
/// # Safety
/// Caller must hold this CPU's scheduler lock.
pub unsafe fn check_sleepers(slab: &SlabAllocator) {
    let now = crate::timer::system().current_ticks();

    // SAFETY: sched lock held per contract.
    let mut chain = unsafe { percpu::current().sleep_queue().dequeue(now) };

    while let Some(node) = chain {
        // SAFETY: dequeued nodes are live until we free them here.
        unsafe {
            chain = (*node.as_ptr()).take_next();

            if let Some(task) = NonNull::new((*node.as_ptr()).task) {
                crate::sched::unblock(task);
            }

            slab.free(node);
        }
    }
}
