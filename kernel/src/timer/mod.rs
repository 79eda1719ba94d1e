//! Kernel timer
//!
//! The core never touches timer hardware directly: the platform layer
//! (HPET-calibrated LAPIC timer on x86_64) registers an implementation
//! of [`KernelTimer`] at boot, and the per-CPU tick ISR calls into
//! [`timer_tick`] after signalling EOI. This trait is the core's only
//! polymorphic surface.

use spin::Once;

use crate::sched::{self, sched_lock_this_cpu, sched_unlock_this_cpu};

/// Ticks per second each CPU's local timer is programmed for.
pub const KERNEL_HZ: u64 = 100;

pub trait KernelTimer: Send + Sync {
    /// Monotonic tick count since boot.
    fn current_ticks(&self) -> u64;
    /// Nanoseconds per tick at the programmed rate.
    fn nanos_per_tick(&self) -> u64;
    /// Busy-wait for at least `nanos`.
    fn delay_nanos(&self, nanos: u64);
}

static SYSTEM_TIMER: Once<&'static dyn KernelTimer> = Once::new();

/// Register the platform timer. First registration wins.
pub fn register_system_timer(timer: &'static dyn KernelTimer) {
    SYSTEM_TIMER.call_once(|| timer);
}

/// The system timer.
///
/// On bare metal this panics if used before registration (nothing can
/// meaningfully sleep without a timebase). The hosted build falls back
/// to the mock so tests need no explicit registration.
pub fn system() -> &'static dyn KernelTimer {
    #[cfg(not(target_os = "none"))]
    {
        *SYSTEM_TIMER.call_once(|| mock::mock_timer())
    }

    #[cfg(target_os = "none")]
    {
        *SYSTEM_TIMER
            .get()
            .expect("kernel timer used before registration")
    }
}

/// Per-CPU timer tick: wake due sleepers, account the timeslice, and
/// reschedule if it expired. The ISR signals EOI before calling here.
pub fn timer_tick() {
    sched_lock_this_cpu();
    // SAFETY: scheduler lock held for both calls.
    unsafe {
        if let Ok(slab) = crate::mm::kernel_slab() {
            sched::sleep::check_sleepers(slab);
        }
        sched::tick();
    }
    sched_unlock_this_cpu();
}

#[cfg(not(target_os = "none"))]
pub mod mock {
    //! Settable timer for the hosted build.

    use core::sync::atomic::{AtomicU64, Ordering};

    use super::{KernelTimer, KERNEL_HZ};

    pub struct MockTimer {
        ticks: AtomicU64,
    }

    impl MockTimer {
        pub const fn new() -> Self {
            Self {
                ticks: AtomicU64::new(0),
            }
        }

        pub fn advance(&self, ticks: u64) {
            self.ticks.fetch_add(ticks, Ordering::Relaxed);
        }

        pub fn set_ticks(&self, ticks: u64) {
            self.ticks.store(ticks, Ordering::Relaxed);
        }
    }

    impl Default for MockTimer {
        fn default() -> Self {
            Self::new()
        }
    }

    impl KernelTimer for MockTimer {
        fn current_ticks(&self) -> u64 {
            self.ticks.load(Ordering::Relaxed)
        }

        fn nanos_per_tick(&self) -> u64 {
            1_000_000_000 / KERNEL_HZ
        }

        fn delay_nanos(&self, nanos: u64) {
            // Model time passing instead of burning wall-clock.
            self.advance(nanos / self.nanos_per_tick());
        }
    }

    static MOCK: MockTimer = MockTimer::new();

    pub fn mock_timer() -> &'static MockTimer {
        &MOCK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_timer_is_the_system_timer_on_hosted() {
        let timer = system();
        let before = timer.current_ticks();
        mock::mock_timer().advance(5);
        assert_eq!(timer.current_ticks(), before + 5);
    }

    #[test]
    fn delay_advances_mock_time() {
        let timer = system();
        let before = timer.current_ticks();
        timer.delay_nanos(3 * timer.nanos_per_tick());
        assert!(timer.current_ticks() >= before + 3);
    }

    #[test]
    fn tick_is_safe_without_kernel_allocators() {
        // No global slab on the hosted build: the tick must still run
        // (it just has no sleepers to check).
        timer_tick();
    }
}
