//! Spinlocks
//!
//! Three flavours, all padded to one cache line:
//!
//! * [`SpinLock<T>`]: data-carrying lock with RAII guards; the IRQ-save
//!   variant disables interrupts for the guard's lifetime and restores the
//!   prior state on drop.
//! * [`RawSpinLock`]: bare lock word with explicit lock/unlock, for code
//!   that must interleave lock release with scheduler transitions (mutex,
//!   IPC rendezvous) and for slab-allocated locks inside 64-byte records.
//! * [`ReentrantSpinLock`]: owner-tracked; `lock` reports whether the
//!   caller was the first acquirer.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch;

/// Bare spinlock word, cache-line padded.
#[repr(C, align(64))]
pub struct RawSpinLock {
    lock: AtomicU64,
}

const _: () = assert!(core::mem::size_of::<RawSpinLock>() == 64);

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            lock: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.lock
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn lock(&self) {
        while !self.try_lock() {
            while self.lock.load(Ordering::Relaxed) != 0 {
                core::hint::spin_loop();
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.lock.store(0, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed) != 0
    }

    /// Disable interrupts, take the lock, return the prior IRQ state.
    pub fn lock_irqsave(&self) -> u64 {
        let flags = arch::local_irq_save();
        self.lock();
        flags
    }

    /// Release the lock and restore the IRQ state from `lock_irqsave`.
    ///
    /// # Safety
    /// `flags` must come from the matching `lock_irqsave` on this CPU.
    pub unsafe fn unlock_irqrestore(&self, flags: u64) {
        self.unlock();
        // SAFETY: per contract, flags came from local_irq_save on this CPU.
        unsafe { arch::local_irq_restore(flags) };
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner-tracked reentrant lock.
///
/// `lock` returns `true` exactly when the caller is the first acquirer and
/// `false` on a successful re-entry, so callers can pair their unlocks.
#[repr(C, align(64))]
pub struct ReentrantSpinLock {
    lock: AtomicU64,
    ident: AtomicU64,
}

const _: () = assert!(core::mem::size_of::<ReentrantSpinLock>() == 64);

impl ReentrantSpinLock {
    pub const fn new() -> Self {
        Self {
            lock: AtomicU64::new(0),
            ident: AtomicU64::new(0),
        }
    }

    /// Acquire for `ident` (any non-zero caller-unique value).
    pub fn lock(&self, ident: u64) -> bool {
        debug_assert!(ident != 0);
        loop {
            if self
                .lock
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.ident.store(ident, Ordering::Relaxed);
                return true;
            }

            if self.ident.load(Ordering::Relaxed) == ident {
                // Already ours; tell the caller this wasn't a fresh acquire.
                return false;
            }

            core::hint::spin_loop();
        }
    }

    /// Release; only the owning `ident` may unlock.
    pub fn unlock(&self, ident: u64) -> bool {
        if self.ident.load(Ordering::Relaxed) != ident {
            return false;
        }

        self.ident.store(0, Ordering::Relaxed);
        self.lock.store(0, Ordering::Release);
        true
    }
}

impl Default for ReentrantSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Data-carrying spinlock with RAII guards.
#[repr(C, align(64))]
pub struct SpinLock<T> {
    inner: spin::Mutex<T>,
}

// SAFETY: same bounds as spin::Mutex.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Take the lock with interrupts disabled; the guard restores the
    /// prior IRQ state when dropped.
    pub fn lock_irqsave(&self) -> IrqSpinGuard<'_, T> {
        let flags = arch::local_irq_save();
        IrqSpinGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            flags,
        }
    }
}

/// Guard for [`SpinLock::lock_irqsave`]; releases the lock before
/// restoring the interrupt flag.
pub struct IrqSpinGuard<'a, T> {
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    flags: u64,
}

impl<T> Deref for IrqSpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqSpinGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: guard is dropped exactly once, before IRQs come back on.
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
            arch::local_irq_restore(self.flags);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_lock_unlock() {
        let lock = RawSpinLock::new();
        assert!(!lock.is_locked());
        lock.lock();
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn irqsave_restores_interrupt_state() {
        let lock = RawSpinLock::new();

        crate::arch::enable_interrupts();
        let flags = lock.lock_irqsave();
        assert!(!crate::arch::interrupts_enabled());
        unsafe { lock.unlock_irqrestore(flags) };
        assert!(crate::arch::interrupts_enabled());

        crate::arch::disable_interrupts();
        let flags = lock.lock_irqsave();
        unsafe { lock.unlock_irqrestore(flags) };
        assert!(!crate::arch::interrupts_enabled());
        crate::arch::enable_interrupts();
    }

    #[test]
    fn reentrant_first_acquire_reports_true() {
        let lock = ReentrantSpinLock::new();
        assert!(lock.lock(42));
        // Re-entry succeeds but reports false.
        assert!(!lock.lock(42));
        // Only the owner can unlock.
        assert!(!lock.unlock(7));
        assert!(lock.unlock(42));
        // Free again: a different owner gets a fresh acquire.
        assert!(lock.lock(7));
        assert!(lock.unlock(7));
    }

    #[test]
    fn guarded_lock_protects_data() {
        let lock = SpinLock::new(0u64);
        crate::arch::enable_interrupts();
        {
            let mut guard = lock.lock_irqsave();
            *guard += 3;
            assert!(!crate::arch::interrupts_enabled());
        }
        // Guard dropped: lock released, interrupt state restored.
        assert!(crate::arch::interrupts_enabled());
        assert_eq!(*lock.lock(), 3);
    }

    #[test]
    fn lock_words_are_cache_line_sized() {
        assert_eq!(core::mem::size_of::<RawSpinLock>(), 64);
        assert_eq!(core::mem::size_of::<ReentrantSpinLock>(), 64);
        assert_eq!(core::mem::align_of::<RawSpinLock>(), 64);
    }
}
