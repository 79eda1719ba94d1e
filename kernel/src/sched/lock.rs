//! Scheduler locking
//!
//! Nestable scheduler sections per CPU: interrupts go off on entry, the
//! CPU's scheduler spinlock is taken only by the outermost entry, and a
//! per-CPU disable count lets interior sections share the acquisition.
//! The outermost exit releases the lock and re-enables interrupts.

use crate::arch;
use crate::smp::percpu::{self, PerCpu};

/// Enter a scheduler section on this CPU.
pub fn sched_lock_this_cpu() {
    arch::disable_interrupts();

    let cpu = percpu::current();

    if cpu.irq_disable_count() == 0 {
        cpu.sched_lock().lock();
    }

    cpu.set_irq_disable_count(cpu.irq_disable_count() + 1);
}

/// Leave a scheduler section on this CPU.
pub fn sched_unlock_this_cpu() {
    let cpu = percpu::current();

    if cpu.irq_disable_count() <= 1 {
        cpu.set_irq_disable_count(0);
        cpu.sched_lock().unlock();
        arch::enable_interrupts();
    } else {
        cpu.set_irq_disable_count(cpu.irq_disable_count() - 1);
    }
}

/// Take another CPU's scheduler lock (queueing a task there). Returns
/// the saved IRQ state for the matching unlock.
pub fn sched_lock_any_cpu(target: &PerCpu) -> u64 {
    let flags = arch::local_irq_save();
    target.sched_lock().lock();
    flags
}

/// Release a lock taken with `sched_lock_any_cpu`.
pub fn sched_unlock_any_cpu(target: &PerCpu, flags: u64) {
    target.sched_lock().unlock();
    // SAFETY: flags came from the matching sched_lock_any_cpu.
    unsafe { arch::local_irq_restore(flags) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_sections_share_one_acquisition() {
        let cpu = percpu::current();
        assert_eq!(cpu.irq_disable_count(), 0);

        sched_lock_this_cpu();
        assert!(cpu.sched_lock().is_locked());
        assert!(!crate::arch::interrupts_enabled());
        assert_eq!(cpu.irq_disable_count(), 1);

        // Interior entry only bumps the count.
        sched_lock_this_cpu();
        assert_eq!(cpu.irq_disable_count(), 2);

        sched_unlock_this_cpu();
        assert!(cpu.sched_lock().is_locked());
        assert_eq!(cpu.irq_disable_count(), 1);

        // Outermost exit releases and re-enables.
        sched_unlock_this_cpu();
        assert!(!cpu.sched_lock().is_locked());
        assert!(crate::arch::interrupts_enabled());
        assert_eq!(cpu.irq_disable_count(), 0);
    }

    #[test]
    fn remote_lock_saves_and_restores_irq_state() {
        let cpu = percpu::current();

        crate::arch::enable_interrupts();
        let flags = sched_lock_any_cpu(cpu);
        assert!(!crate::arch::interrupts_enabled());
        assert!(cpu.sched_lock().is_locked());

        sched_unlock_any_cpu(cpu, flags);
        assert!(!cpu.sched_lock().is_locked());
        assert!(crate::arch::interrupts_enabled());
    }
}
