//! Synchronization primitives.
//!
//! All kernel critical sections use interrupt-masking spin locks: callers
//! include interrupt handlers, which must never block. On a single
//! processor the locks never actually spin; they document the critical
//! section and stay correct if SMP is ever added.
//!
//! Lock order: `pcb` before `tty` before `terminal`. The heap lock is
//! innermost and must never be held across a call into another subsystem.

mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard, SpinLockIrqGuard};

/// Saved EFLAGS image returned by [`irq_save`].
pub type IrqFlags = u32;

/// Save EFLAGS and mask maskable interrupts.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
pub fn irq_save() -> IrqFlags {
    let flags: u32;
    // SAFETY: pushfd/pop reads EFLAGS into a register; cli only masks
    // maskable interrupts. Both are always permitted at CPL 0.
    unsafe {
        core::arch::asm!(
            "pushfd",
            "pop {0}",
            "cli",
            out(reg) flags,
        );
    }
    flags
}

/// Restore a previously saved EFLAGS image (potentially re-enabling
/// interrupts).
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
pub fn irq_restore(flags: IrqFlags) {
    // SAFETY: the flags value came from irq_save, so this restores a valid
    // prior EFLAGS state.
    unsafe {
        core::arch::asm!(
            "push {0}",
            "popfd",
            in(reg) flags,
        );
    }
}

// Host builds have no interrupt flag to manipulate.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[inline]
pub fn irq_save() -> IrqFlags {
    0
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[inline]
pub fn irq_restore(_flags: IrqFlags) {}

/// Run `f` with maskable interrupts disabled, restoring the previous state
/// afterwards.
pub fn with_irqs_masked<R>(f: impl FnOnce() -> R) -> R {
    let flags = irq_save();
    let result = f();
    irq_restore(flags);
    result
}
