//! Transition to user mode.

use crate::{
    arch::{USER_CS, USER_DS},
    process::KernelContext,
};

/// IRET into user mode at `entry` with the stack at `user_esp`.
///
/// All data segments are switched to the user segment and IF is forced
/// on in the pushed EFLAGS, so the new program runs with interrupts
/// enabled.
///
/// When `save` is provided, the caller's ESP/EBP and a resume point are
/// recorded first; the call then "returns" (through that resume point)
/// once the spawned process halts or yields the CPU back. Without a
/// save target this function never returns.
///
/// # Safety
///
/// `entry` and `user_esp` must lie in pages mapped user-accessible, TSS
/// esp0 must point at the new process's kernel stack, and interrupts
/// must be masked until the IRET.
pub unsafe fn enter_user(entry: u32, user_esp: u32, save: Option<*mut KernelContext>) {
    let ctx = save.unwrap_or(core::ptr::null_mut());

    // SAFETY: per the function contract. Callee-saved registers are
    // parked on this kernel stack and restored on the resume path, which
    // is only reachable through a context switch that reloads ESP/EBP
    // from the saved record.
    unsafe {
        core::arch::asm!(
            "push ebx",
            "push esi",
            "push edi",
            // Optionally record the resume point.
            "test {ctx}, {ctx}",
            "jz 2f",
            "mov [{ctx}], esp",
            "mov [{ctx} + 4], ebp",
            "lea eax, [4f]",
            "mov [{ctx} + 8], eax",
            "2:",
            // User data segments.
            "mov eax, {uds}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            // IRET frame: SS, ESP, EFLAGS (IF set), CS, EIP.
            "push {uds}",
            "push {uesp}",
            "pushfd",
            "or dword ptr [esp], 0x200",
            "push {ucs}",
            "push {uentry}",
            "iretd",
            // Resume point reached when the spawned process gives the
            // CPU back through a context switch.
            "4:",
            "pop edi",
            "pop esi",
            "pop ebx",
            ctx = in(reg) ctx,
            uesp = in(reg) user_esp,
            uentry = in(reg) entry,
            uds = const USER_DS as u32,
            ucs = const USER_CS as u32,
            out("eax") _,
            out("ecx") _,
            out("edx") _,
        );
    }
}
