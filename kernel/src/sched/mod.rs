//! Scheduler
//!
//! CPU-local scheduling: each task belongs to one CPU and runs until it
//! blocks or exhausts its timeslice. The ready queue is priority-ordered
//! (FIFO within a priority); all transitions happen under the owning
//! CPU's scheduler lock.

pub mod lock;
pub mod mutex;
pub mod queue;
pub mod sleep;
pub mod task;

use core::ptr::NonNull;

use crate::smp::percpu::{self, PerCpu};
use task::{Task, TaskState, DEFAULT_TIMESLICE};

pub use lock::{sched_lock_any_cpu, sched_lock_this_cpu, sched_unlock_any_cpu, sched_unlock_this_cpu};

/// The CPU a new or woken task should run on. Tasks are CPU-local, so
/// this is always the current CPU; the indirection marks every place a
/// placement policy would slot in.
pub fn find_target_cpu() -> &'static PerCpu {
    percpu::current()
}

/// Mark `task` blocked. It keeps running until the caller schedules.
///
/// # Safety
/// Caller must hold this CPU's scheduler lock; `task` must be live.
pub unsafe fn block(task: NonNull<Task>) {
    // SAFETY: task and its sched sidecar are live per contract.
    unsafe {
        (*(*task.as_ptr()).sched).state = TaskState::Blocked;
    }
}

/// Mark `task` ready and queue it on this CPU.
///
/// # Safety
/// Caller must hold this CPU's scheduler lock; `task` must be live and
/// not on any queue.
pub unsafe fn unblock(task: NonNull<Task>) {
    // SAFETY: per contract.
    unsafe { unblock_on(task, percpu::current()) }
}

/// Mark `task` ready and queue it on `cpu`, poking that CPU if it is not
/// this one.
///
/// # Safety
/// Caller must hold `cpu`'s scheduler lock; `task` must be live and not
/// on any queue.
pub unsafe fn unblock_on(task: NonNull<Task>, cpu: &'static PerCpu) {
    // SAFETY: per contract; the sched data access is lock-protected.
    unsafe {
        (*(*task.as_ptr()).sched).state = TaskState::Ready;
        cpu.sched_data().ready.push(task);
    }

    if !core::ptr::eq(cpu, percpu::current()) {
        crate::smp::ipwi::wake_cpu(cpu);
    }
}

/// Pick the next ready task and switch to it. A still-running current
/// task goes back on the ready queue behind its priority peers; with an
/// empty queue the current task simply carries on.
///
/// # Safety
/// Caller must hold this CPU's scheduler lock.
pub unsafe fn schedule() {
    let cpu = percpu::current();

    // SAFETY: sched lock held per contract.
    let next = unsafe { cpu.sched_data().ready.pop() };

    let Some(next) = next else {
        return;
    };

    let prev = cpu.current_task();

    // SAFETY: queue members and the previous task are live tasks.
    unsafe {
        if !prev.is_null() && (*(*prev).sched).state == TaskState::Running {
            (*(*prev).sched).state = TaskState::Ready;
            cpu.sched_data().ready.push(NonNull::new_unchecked(prev));
        }

        (*(*next.as_ptr()).sched).state = TaskState::Running;
        (*(*next.as_ptr()).sched).ts_remain = DEFAULT_TIMESLICE;
        cpu.set_current_task(next.as_ptr());

        crate::arch::task_switch(next.as_ptr());
    }
}

/// Timer-tick accounting: burn one tick of the current task's timeslice
/// and reschedule when it is spent.
///
/// # Safety
/// Caller must hold this CPU's scheduler lock (the tick ISR does).
pub unsafe fn tick() {
    let cpu = percpu::current();

    // SAFETY: sched lock held per contract.
    unsafe {
        cpu.sched_data().upticks += 1;

        let current = cpu.current_task();
        if current.is_null() {
            return;
        }

        let sched = (*current).sched;
        if (*sched).ts_remain > 0 {
            (*sched).ts_remain -= 1;
        }

        if (*sched).ts_remain == 0 {
            schedule();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::task::tests::spawn_test_task;
    use crate::sched::task::TaskClass;

    #[test]
    fn block_and_unblock_flip_state() {
        let task = spawn_test_task(TaskClass::Normal);

        sched_lock_this_cpu();
        unsafe {
            block(task);
            assert_eq!((*task.as_ref().sched).state, TaskState::Blocked);

            unblock(task);
            assert_eq!((*task.as_ref().sched).state, TaskState::Ready);

            // Drain what we queued so later tests see a clean CPU.
            let popped = percpu::current().sched_data().ready.pop();
            assert_eq!(popped, Some(task));
        }
        sched_unlock_this_cpu();
    }

    #[test]
    fn schedule_runs_highest_priority_ready_task() {
        let normal = spawn_test_task(TaskClass::Normal);
        let realtime = spawn_test_task(TaskClass::Realtime);

        sched_lock_this_cpu();
        unsafe {
            let cpu = percpu::current();
            cpu.set_current_task(core::ptr::null_mut());

            unblock(normal);
            unblock(realtime);

            schedule();
            assert_eq!(cpu.current_task(), realtime.as_ptr());
            assert_eq!((*realtime.as_ref().sched).state, TaskState::Running);

            // The realtime task is still running, so the next schedule
            // round-robins it behind nothing and picks the normal task,
            // re-queueing the realtime one.
            schedule();
            assert_eq!(cpu.current_task(), normal.as_ptr());

            // Clean up queue state.
            while cpu.sched_data().ready.pop().is_some() {}
            cpu.set_current_task(core::ptr::null_mut());
        }
        sched_unlock_this_cpu();
    }
}
