//! Architecture layer.
//!
//! The portable surface (segment selectors, the saved user-mode register
//! frame, the handful of privileged entry points the kernel proper calls)
//! lives here; the x86 protected-mode implementation is compiled only for
//! the bare-metal target, with host stand-ins so the logic layers unit
//! test on the build machine.

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use x86::{
    enable_interrupts, enter_user, set_in_userspace, set_tss_esp0, set_tss_ss0, switch_context,
    timer_is_only_frame, tss_esp0,
};

/// GDT selectors. User selectors carry RPL 3.
pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
pub const USER_CS: u16 = 0x18 | 3;
pub const USER_DS: u16 = 0x20 | 3;
pub const TSS_SELECTOR: u16 = 0x28;

/// The hardware context of an interrupted user program, exactly as the
/// interrupt linkages lay it out at the top of the kernel stack: eight
/// `pushal` registers below the five words the CPU pushes on a
/// privilege-crossing interrupt.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserContext {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// ESP image stored by `pushal`; ignored by `popal`.
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

impl UserContext {
    /// The context as raw little-endian bytes (the wire format the
    /// signal frame uses on the user stack).
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: UserContext is repr(C) with only u32 fields, so it has
        // no padding and any byte view is valid.
        unsafe {
            core::slice::from_raw_parts(
                self as *const Self as *const u8,
                core::mem::size_of::<Self>(),
            )
        }
    }

    /// Rebuild a context from the bytes a signal frame saved.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < core::mem::size_of::<Self>() {
            return None;
        }
        // SAFETY: any bit pattern is a valid UserContext (all-u32,
        // repr(C)); read_unaligned tolerates arbitrary alignment.
        Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Self) })
    }
}

/// Location of the saved user context on a process's kernel stack: just
/// below the PID word at the stack top.
pub fn user_context_ptr(kernel_stack_base: usize) -> *mut UserContext {
    (kernel_stack_base - 4 - core::mem::size_of::<UserContext>()) as *mut UserContext
}

// ---------------------------------------------------------------------------
// Host stand-ins
// ---------------------------------------------------------------------------

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod host {
    use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use crate::process::KernelContext;

    static TSS_ESP0: AtomicU32 = AtomicU32::new(0);
    static IN_USERSPACE: AtomicBool = AtomicBool::new(false);

    pub fn tss_esp0() -> u32 {
        TSS_ESP0.load(Ordering::Relaxed)
    }

    pub fn set_tss_esp0(value: u32) {
        TSS_ESP0.store(value, Ordering::Relaxed);
    }

    pub fn set_tss_ss0(_selector: u16) {}

    pub fn set_in_userspace(value: bool) {
        IN_USERSPACE.store(value, Ordering::Relaxed);
    }

    pub fn in_userspace() -> bool {
        IN_USERSPACE.load(Ordering::Relaxed)
    }

    pub fn enable_interrupts() {}

    pub fn timer_is_only_frame() -> bool {
        true
    }

    /// # Safety
    /// Never sound on the host; present so shared code links.
    pub unsafe fn switch_context(_old: *mut KernelContext, _new: *const KernelContext) {
        unreachable!("context switch is bare-metal only");
    }

    /// # Safety
    /// Never sound on the host; present so shared code links.
    pub unsafe fn enter_user(_entry: u32, _user_esp: u32, _save: Option<*mut KernelContext>) {
        unreachable!("user-mode entry is bare-metal only");
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub use host::{
    enable_interrupts, enter_user, in_userspace, set_in_userspace, set_tss_esp0, set_tss_ss0,
    switch_context, timer_is_only_frame, tss_esp0,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_context_byte_roundtrip() {
        let ctx = UserContext {
            edi: 1,
            esi: 2,
            ebp: 3,
            esp_dummy: 4,
            ebx: 5,
            edx: 6,
            ecx: 7,
            eax: 8,
            eip: 9,
            cs: USER_CS as u32,
            eflags: 0x202,
            esp: 11,
            ss: USER_DS as u32,
        };

        let bytes = ctx.as_bytes();
        assert_eq!(bytes.len(), 52);
        assert_eq!(UserContext::from_bytes(bytes), Some(ctx));
    }

    #[test]
    fn test_context_sits_below_pid_word() {
        let base = 0x80_2000usize;
        let ptr = user_context_ptr(base) as usize;
        assert_eq!(ptr, base - 4 - 52);
    }
}
