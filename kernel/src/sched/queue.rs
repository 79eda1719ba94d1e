//! Task priority queue
//!
//! Intrusive singly-linked list kept in ascending priority order; equal
//! priorities stay FIFO. Push is O(n), pop and peek O(1); the scheduler
//! pops far more often than it pushes. No allocation: the link lives in
//! the task itself.

use core::ptr::{self, NonNull};

use crate::sched::task::Task;

pub struct TaskPriorityQueue {
    head: *mut Task,
}

// SAFETY: queues are confined behind their owner's lock (per-CPU sched
// lock or a mutex's spinlock).
unsafe impl Send for TaskPriorityQueue {}

impl TaskPriorityQueue {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    fn prio_of(task: *mut Task) -> u8 {
        // SAFETY: queue members are live tasks with live sidecars.
        unsafe { (*(*task).sched).prio }
    }

    /// Splice `task` in before the first strictly-higher priority, so it
    /// lands at the end of its own priority run.
    ///
    /// # Safety
    /// `task` must be live and not currently on any queue.
    pub unsafe fn push(&mut self, task: NonNull<Task>) {
        let task = task.as_ptr();
        let prio = Self::prio_of(task);

        // SAFETY: list links are live tasks; task is exclusively ours.
        unsafe {
            if self.head.is_null() || prio < Self::prio_of(self.head) {
                (*task).next = self.head;
                self.head = task;
            } else {
                let mut current = self.head;
                while !(*current).next.is_null() && Self::prio_of((*current).next) <= prio {
                    current = (*current).next;
                }
                (*task).next = (*current).next;
                (*current).next = task;
            }
        }

        #[cfg(any(debug_assertions, feature = "conservative"))]
        assert!(self.check_invariants());
    }

    /// Detach and return the lowest-priority-value (highest urgency) task.
    pub fn pop(&mut self) -> Option<NonNull<Task>> {
        let head = NonNull::new(self.head)?;

        // SAFETY: head is a live queue member.
        unsafe {
            self.head = (*head.as_ptr()).next;
            (*head.as_ptr()).next = ptr::null_mut();
        }

        #[cfg(any(debug_assertions, feature = "conservative"))]
        assert!(self.check_invariants());

        Some(head)
    }

    pub fn peek(&self) -> Option<NonNull<Task>> {
        NonNull::new(self.head)
    }

    /// Cycle detection (Floyd) plus monotone priority, the queue's two
    /// structural invariants.
    pub fn check_invariants(&self) -> bool {
        if self.head.is_null() {
            return true;
        }

        // SAFETY: list links are live tasks or null throughout.
        unsafe {
            if (*self.head).next == self.head {
                return false;
            }

            let mut slow = self.head;
            let mut fast = (*self.head).next;

            while !fast.is_null() && !(*fast).next.is_null() {
                if fast == slow || (*fast).next == slow {
                    return false;
                }

                if Self::prio_of(slow) > Self::prio_of((*slow).next) {
                    return false;
                }

                slow = (*slow).next;
                fast = (*(*fast).next).next;
            }
        }

        true
    }
}

impl Default for TaskPriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}
