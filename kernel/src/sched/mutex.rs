//! Scheduler-backed mutexes
//!
//! Owner-tracked mutex that parks contenders on a priority queue and
//! hands ownership directly to the highest-priority waiter on unlock
//! (FIFO within a priority). Re-acquisition by the owner succeeds
//! without blocking; unlocks are paired, not counted.

use core::cell::Cell;
use core::ptr::{self, NonNull};

use crate::mm::slab::SlabAllocator;
use crate::sched::queue::TaskPriorityQueue;
use crate::sched::task::{self, Task};
use crate::sched::{block, sched_lock_this_cpu, sched_unlock_this_cpu, schedule, unblock};
use crate::sync::RawSpinLock;

#[repr(C)]
pub struct Mutex {
    owner: Cell<*mut Task>,
    spin_lock: NonNull<RawSpinLock>,
    wait_queue: NonNull<TaskPriorityQueue>,
    locked: Cell<bool>,
    _pad: [u8; 7],
    _reserved: [u64; 4],
}

const _: () = assert!(core::mem::size_of::<Mutex>() == 64);

// SAFETY: all state transitions happen under spin_lock.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

/// Allocate a mutex (and its lock word and wait queue) from the slab.
pub fn mutex_create(slab: &'static SlabAllocator) -> Option<NonNull<Mutex>> {
    let spin_lock = slab.alloc_init(RawSpinLock::new())?;

    let Some(wait_queue) = slab.alloc_init(TaskPriorityQueue::new()) else {
        // SAFETY: unpublished allocation.
        unsafe { slab.free(spin_lock) };
        return None;
    };

    let mutex = slab.alloc_init(Mutex {
        owner: Cell::new(ptr::null_mut()),
        spin_lock,
        wait_queue,
        locked: Cell::new(false),
        _pad: [0; 7],
        _reserved: [0; 4],
    });

    if mutex.is_none() {
        // SAFETY: unpublished allocations.
        unsafe {
            slab.free(wait_queue);
            slab.free(spin_lock);
        }
    }

    mutex
}

/// Free an unlocked mutex. Refuses (returns false) while locked.
///
/// # Safety
/// `mutex` must have come from `mutex_create` with the same slab, and no
/// other reference to it may remain.
pub unsafe fn mutex_free(slab: &'static SlabAllocator, mutex: NonNull<Mutex>) -> bool {
    // SAFETY: mutex is live per contract.
    let m = unsafe { mutex.as_ref() };

    if m.locked.get() {
        return false;
    }

    // SAFETY: per contract, nothing else references these blocks.
    unsafe {
        slab.free(m.spin_lock);
        slab.free(m.wait_queue);
        slab.free(mutex);
    }

    true
}

impl Mutex {
    #[allow(clippy::mut_from_ref)]
    unsafe fn waiters(&self) -> &mut TaskPriorityQueue {
        // SAFETY: caller holds spin_lock.
        unsafe { &mut *self.wait_queue.as_ptr() }
    }

    fn spin(&self) -> &RawSpinLock {
        // SAFETY: spin_lock is a live slab block for the mutex's lifetime.
        unsafe { self.spin_lock.as_ref() }
    }

    /// Acquire. Returns false only when there is no current task to own
    /// the mutex. The owner re-locking succeeds immediately.
    pub fn lock(&self) -> bool {
        let Some(current) = task::current() else {
            return false;
        };
        let current = current.as_ptr();

        loop {
            let flags = self.spin().lock_irqsave();

            if !self.locked.get() {
                self.owner.set(current);
                self.locked.set(true);
                // SAFETY: matching lock_irqsave above.
                unsafe { self.spin().unlock_irqrestore(flags) };
                return true;
            }

            if self.owner.get() == current {
                // Reentrant: no count is kept, unlocks stay paired.
                // SAFETY: matching lock_irqsave above.
                unsafe { self.spin().unlock_irqrestore(flags) };
                return true;
            }

            // Contended: park on the wait queue and let the scheduler
            // take us off-CPU. The spinlock is dropped before blocking;
            // the scheduler lock covers the queue-push/block window.
            sched_lock_this_cpu();
            // SAFETY: current is live and not on any queue (it is
            // running); spin lock held.
            unsafe {
                self.waiters().push(NonNull::new_unchecked(current));
                self.spin().unlock();
                block(NonNull::new_unchecked(current));
                schedule();
            }
            sched_unlock_this_cpu();
            // SAFETY: flags from lock_irqsave at the top of this round.
            unsafe { crate::arch::local_irq_restore(flags) };
        }
    }

    /// Release. Only the owner may unlock; ownership passes straight to
    /// the best waiter, which is unblocked.
    pub fn unlock(&self) -> bool {
        let Some(current) = task::current() else {
            return false;
        };

        if self.owner.get() != current.as_ptr() {
            return false;
        }

        let flags = self.spin().lock_irqsave();

        // SAFETY: spin lock held.
        let next = unsafe { self.waiters().pop() };

        let Some(next) = next else {
            self.locked.set(false);
            self.owner.set(ptr::null_mut());
            // SAFETY: matching lock_irqsave above.
            unsafe { self.spin().unlock_irqrestore(flags) };
            return true;
        };

        self.owner.set(next.as_ptr());

        sched_lock_this_cpu();
        // SAFETY: spin lock held until just before the scheduler runs;
        // next came off our wait queue and is blocked.
        unsafe {
            self.spin().unlock();
            unblock(next);
            schedule();
        }
        sched_unlock_this_cpu();
        // SAFETY: flags from lock_irqsave above.
        unsafe { crate::arch::local_irq_restore(flags) };

        true
    }

    pub fn is_locked(&self) -> bool {
        self.locked.get()
    }

    pub fn owner(&self) -> *mut Task {
        self.owner.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::task::tests::spawn_test_task;
    use crate::sched::task::{TaskClass, TaskState};
    use crate::smp::percpu;

    fn slab() -> &'static SlabAllocator {
        use crate::mm::fba::tests::test_fba;
        std::boxed::Box::leak(std::boxed::Box::new(SlabAllocator::new(test_fba(64))))
    }

    #[test]
    fn create_lock_unlock_free() {
        let slab = slab();
        let owner = spawn_test_task(TaskClass::Normal);
        task::set_current(Some(owner));

        let mutex_ptr = mutex_create(slab).unwrap();
        let mutex = unsafe { mutex_ptr.as_ref() };

        assert!(mutex.lock());
        assert!(mutex.is_locked());
        assert_eq!(mutex.owner(), owner.as_ptr());

        // A locked mutex refuses to be freed.
        assert!(!unsafe { mutex_free(slab, mutex_ptr) });

        assert!(mutex.unlock());
        assert!(!mutex.is_locked());
        assert!(unsafe { mutex_free(slab, mutex_ptr) });

        task::set_current(None);
    }

    #[test]
    fn owner_relock_returns_true_without_blocking() {
        let slab = slab();
        let owner = spawn_test_task(TaskClass::Normal);
        task::set_current(Some(owner));

        let mutex = unsafe { mutex_create(slab).unwrap().as_ref() };

        assert!(mutex.lock());
        assert!(mutex.lock());
        assert!(mutex.unlock());

        task::set_current(None);
    }

    #[test]
    fn unlock_by_non_owner_is_refused() {
        let slab = slab();
        let owner = spawn_test_task(TaskClass::Normal);
        let imposter = spawn_test_task(TaskClass::Normal);

        task::set_current(Some(owner));
        let mutex = unsafe { mutex_create(slab).unwrap().as_ref() };
        assert!(mutex.lock());

        task::set_current(Some(imposter));
        assert!(!mutex.unlock());
        assert!(mutex.is_locked());

        task::set_current(Some(owner));
        assert!(mutex.unlock());
        task::set_current(None);
    }

    #[test]
    fn unlock_hands_off_to_highest_priority_waiter() {
        let slab = slab();
        let owner = spawn_test_task(TaskClass::Normal);
        let low = spawn_test_task(TaskClass::Normal);
        let high = spawn_test_task(TaskClass::Realtime);

        task::set_current(Some(owner));
        let mutex = unsafe { mutex_create(slab).unwrap().as_ref() };
        assert!(mutex.lock());

        // Park two waiters directly (what lock() does on contention).
        unsafe {
            (*low.as_ref().sched).state = TaskState::Blocked;
            (*high.as_ref().sched).state = TaskState::Blocked;
            mutex.waiters().push(low);
            mutex.waiters().push(high);
        }

        assert!(mutex.unlock());

        // Ownership went to the realtime waiter, which is runnable again.
        assert_eq!(mutex.owner(), high.as_ptr());
        assert!(mutex.is_locked());

        // Drain scheduler state this test pushed at the current CPU.
        unsafe {
            let cpu = percpu::current();
            while cpu.sched_data().ready.pop().is_some() {}
            cpu.set_current_task(core::ptr::null_mut());
        }
    }
}
