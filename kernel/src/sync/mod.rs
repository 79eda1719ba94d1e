//! Synchronization primitives
//!
//! IRQ-save spinlocks and the reentrant scheduler-lock building block. All
//! lock words are padded to a cache line; see `smp::percpu` for the per-CPU
//! scheduler lock discipline built on these.

pub mod spinlock;

pub use spinlock::{IrqSpinGuard, RawSpinLock, ReentrantSpinLock, SpinLock};
