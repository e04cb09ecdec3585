//! Signal frame construction.
//!
//! When a handled signal is delivered, the user stack is rewritten so the
//! kernel's IRET lands in the handler and the handler's `ret` lands in a
//! trampoline pushed onto the stack itself. The layout, from the new stack
//! pointer upward:
//!
//! ```text
//!   return address  -> start of the in-stack trampoline
//!   signum          (first handler argument)
//!   data            (second handler argument)
//!   saved hardware context of the interrupted program
//!   trampoline      (machine code: mov eax, 10; int 0x80)
//!   <previous stack contents>
//! ```

use alloc::vec::Vec;

use crate::arch::UserContext;

/// x86 machine code for `mov eax, 10; int 0x80` -- syscall 10 is
/// `sigreturn`.
pub const TRAMPOLINE: [u8; 7] = [0xB8, 0x0A, 0x00, 0x00, 0x00, 0xCD, 0x80];

/// Size of the saved hardware context in bytes.
pub const CONTEXT_SIZE: usize = core::mem::size_of::<UserContext>();

/// Total bytes the signal frame occupies on the user stack.
pub const FRAME_SIZE: usize = TRAMPOLINE.len() + CONTEXT_SIZE + 3 * 4;

/// A fully laid out signal frame ready to be copied below `user_esp`.
pub struct SignalFrame {
    /// Frame bytes in memory order starting at `new_esp`.
    pub bytes: Vec<u8>,
    /// Stack pointer the user program resumes with.
    pub new_esp: u32,
}

/// Lay out the frame for invoking a handler with `(signum, data)` on a
/// stack currently at `user_esp`.
pub fn build_signal_frame(
    user_esp: u32,
    signum: u32,
    data: u32,
    context: &UserContext,
) -> SignalFrame {
    let trampoline_addr = user_esp - TRAMPOLINE.len() as u32;
    let new_esp = user_esp - FRAME_SIZE as u32;

    let mut bytes = Vec::with_capacity(FRAME_SIZE);
    bytes.extend_from_slice(&trampoline_addr.to_le_bytes());
    bytes.extend_from_slice(&signum.to_le_bytes());
    bytes.extend_from_slice(&data.to_le_bytes());
    bytes.extend_from_slice(context.as_bytes());
    bytes.extend_from_slice(&TRAMPOLINE);

    SignalFrame { bytes, new_esp }
}

/// Recover `(signum, saved context)` during `sigreturn`.
///
/// `stack` holds the user stack bytes starting at the current user ESP,
/// which points at `signum`: the handler's `ret` already consumed the
/// trampoline return address.
pub fn parse_sigreturn_frame(stack: &[u8]) -> Option<(u32, UserContext)> {
    if stack.len() < 8 + CONTEXT_SIZE {
        return None;
    }

    let signum = u32::from_le_bytes([stack[0], stack[1], stack[2], stack[3]]);
    let context = UserContext::from_bytes(&stack[8..8 + CONTEXT_SIZE])?;
    Some((signum, context))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_context() -> UserContext {
        UserContext {
            edi: 1,
            esi: 2,
            ebp: 3,
            esp_dummy: 4,
            ebx: 5,
            edx: 6,
            ecx: 7,
            eax: 0xDEAD_0001,
            eip: 0x0804_8123,
            cs: 0x1B,
            eflags: 0x202,
            esp: 0x083F_FF00,
            ss: 0x23,
        }
    }

    #[test]
    fn test_frame_layout() {
        let ctx = sample_context();
        let esp = 0x083F_FF00;
        let frame = build_signal_frame(esp, 2, 99, &ctx);

        assert_eq!(frame.bytes.len(), FRAME_SIZE);
        assert_eq!(frame.new_esp, esp - FRAME_SIZE as u32);

        // Return address points at the trampoline, which sits directly
        // below the original stack pointer.
        let ret = u32::from_le_bytes(frame.bytes[0..4].try_into().unwrap());
        assert_eq!(ret, esp - TRAMPOLINE.len() as u32);

        // Arguments follow the return address.
        let signum = u32::from_le_bytes(frame.bytes[4..8].try_into().unwrap());
        let data = u32::from_le_bytes(frame.bytes[8..12].try_into().unwrap());
        assert_eq!((signum, data), (2, 99));

        // The trampoline bytes are the last thing before the old stack.
        assert_eq!(&frame.bytes[FRAME_SIZE - TRAMPOLINE.len()..], &TRAMPOLINE);
    }

    #[test]
    fn test_sigreturn_restores_context() {
        let ctx = sample_context();
        let frame = build_signal_frame(0x083F_FF00, 2, 99, &ctx);

        // After the handler's `ret`, user ESP points at signum.
        let stack_at_sigreturn = &frame.bytes[4..];
        let (signum, restored) = parse_sigreturn_frame(stack_at_sigreturn).unwrap();

        assert_eq!(signum, 2);
        // Every register, including eax, matches the pre-handler values.
        assert_eq!(restored.as_bytes(), ctx.as_bytes());
    }

    #[test]
    fn test_short_stack_rejected() {
        assert!(parse_sigreturn_frame(&[0u8; 10]).is_none());
    }
}
