//! Inter-processor signalling
//!
//! Both the panic broadcast and the inter-processor wake-up ride the same
//! transport: an NMI with the all-except-self destination shorthand. The
//! receiving side distinguishes them by kernel state: a panicking kernel
//! halts in its NMI handler, a healthy one rechecks its queues.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::smp::percpu::PerCpu;

/// Set before the panic broadcast so NMI handlers know to halt.
pub static PANIC_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

fn broadcast_nmi() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: the platform maps the LAPIC before SMP bring-up.
    unsafe {
        crate::arch::lapic::nmi_broadcast_all_except_self()
    };

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        // No NMI-equivalent transport wired up on the RISC-V port yet.
    }

    #[cfg(not(target_os = "none"))]
    // SAFETY: hosted mock just counts broadcasts.
    unsafe {
        crate::arch::nmi_broadcast_all_except_self()
    };
}

/// Stop every other CPU: they take the NMI, observe the panic flag, and
/// halt. The caller halts itself afterwards.
pub fn panic_stop_all_processors() {
    PANIC_IN_PROGRESS.store(true, Ordering::Release);
    broadcast_nmi();
}

/// Poke `target` so it notices work queued on one of its queues. The
/// queueing itself happens first, under the target's scheduler lock; the
/// wake-up only forces a prompt reschedule.
pub fn wake_cpu(target: &PerCpu) {
    // Single-transport implementation: the broadcast reaches the target
    // (and harmlessly nudges the rest). Targeted delivery needs the ICR
    // destination field once CPU hot-plug lands.
    let _ = target;
    broadcast_nmi();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smp::percpu;

    #[test]
    fn panic_broadcast_sets_flag_and_sends_nmi() {
        let before = crate::arch::test_nmi_broadcast_count();
        panic_stop_all_processors();
        assert!(PANIC_IN_PROGRESS.load(Ordering::Acquire));
        assert!(crate::arch::test_nmi_broadcast_count() > before);
    }

    #[test]
    fn wake_cpu_uses_the_same_transport() {
        let before = crate::arch::test_nmi_broadcast_count();
        wake_cpu(percpu::current());
        assert!(crate::arch::test_nmi_broadcast_count() > before);
    }
}
