//! Kernel-side context switch.

use crate::process::KernelContext;

/// Swap kernel stacks: record the outgoing process's ESP/EBP and a
/// resume point in `old`, then restore `new` and jump to its saved
/// resume point.
///
/// Returns (through the recorded resume point) when some other process
/// eventually switches back to this one. Interrupts are re-enabled just
/// before control transfers.
///
/// # Safety
///
/// Both pointers must reference live `KernelContext` records that stay
/// pinned until the switch completes, `new` must hold a context saved by
/// a previous switch or user-mode entry, and the caller must have
/// interrupts masked.
pub unsafe fn switch_context(old: *mut KernelContext, new: *const KernelContext) {
    // SAFETY: per the function contract. The callee-saved registers are
    // preserved on the outgoing stack and restored when the resume point
    // runs again; the compiler-visible clobbers cover the rest.
    unsafe {
        core::arch::asm!(
            // Keep callee-saved registers on the outgoing stack so the
            // resume path can restore them.
            "push ebx",
            "push esi",
            "push edi",
            // Save the cooperative context: ESP, EBP and the address of
            // the local resume label.
            "mov [{old}], esp",
            "mov [{old} + 4], ebp",
            "lea eax, [2f]",
            "mov [{old} + 8], eax",
            // Load the incoming context and enter it.
            "mov esp, [{new}]",
            "mov ebp, [{new} + 4]",
            "push dword ptr [{new} + 8]",
            "sti",
            "ret",
            // Resume point: another process switched back to us.
            "2:",
            "pop edi",
            "pop esi",
            "pop ebx",
            old = in(reg) old,
            new = in(reg) new,
            out("eax") _,
            out("ecx") _,
            out("edx") _,
        );
    }
}
