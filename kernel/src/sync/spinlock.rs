//! Two-state test-and-set spin lock.
//!
//! The plain [`SpinLock::lock`] is for code that already runs with a known
//! interrupt state. [`SpinLock::lock_irqsave`] additionally saves EFLAGS and
//! masks interrupts for the lifetime of the guard, which is the canonical
//! discipline for data shared with interrupt handlers.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use super::{irq_restore, irq_save, IrqFlags};

/// A mutual-exclusion primitive built on an atomic exchange.
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: the lock provides exclusive access to the inner value, so sharing
// the lock between contexts is sound whenever the value itself can be sent.
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
// SAFETY: moving the lock moves the value with it.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new unlocked spin lock.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    fn acquire(&self) {
        // Atomic exchange with 1; proceed once the previous value was 0.
        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Lock without touching the interrupt flag.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard { lock: self }
    }

    /// Lock, then save EFLAGS and mask interrupts until the guard drops.
    pub fn lock_irqsave(&self) -> SpinLockIrqGuard<'_, T> {
        self.acquire();
        let flags = irq_save();
        SpinLockIrqGuard { lock: self, flags }
    }

    /// Whether the lock is currently held. Diagnostic only.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// RAII guard for [`SpinLock::lock`].
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock, so no other reference exists.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// RAII guard for [`SpinLock::lock_irqsave`]; restores EFLAGS on drop.
pub struct SpinLockIrqGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    flags: IrqFlags,
}

impl<T: ?Sized> Deref for SpinLockIrqGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock, so no other reference exists.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockIrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockIrqGuard<'_, T> {
    fn drop(&mut self) {
        // Unlock first, then restore the flags (potentially re-enabling
        // interrupts), mirroring unlock before popfl.
        self.lock.release();
        irq_restore(self.flags);
    }
}
