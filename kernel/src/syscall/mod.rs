//! System call dispatch.
//!
//! Syscalls arrive through the int 0x80 gate with the number in EAX and
//! up to three arguments in EBX/ECX/EDX. Every user pointer or string is
//! validated against the caller's page mappings before any side effect;
//! invalid input returns -1 untouched. The linkage writes the return
//! value into the saved user EAX.

pub mod files;

use crate::process::{self, current_pid, validate::is_userspace_region_valid};

/// System call numbers.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Halt = 1,
    Execute = 2,
    Read = 3,
    Write = 4,
    Open = 5,
    Close = 6,
    GetArgs = 7,
    VidMap = 8,
    SetHandler = 9,
    SigReturn = 10,
    AllocateWindow = 11,
    UpdateWindow = 12,
}

impl TryFrom<u32> for Syscall {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Halt),
            2 => Ok(Self::Execute),
            3 => Ok(Self::Read),
            4 => Ok(Self::Write),
            5 => Ok(Self::Open),
            6 => Ok(Self::Close),
            7 => Ok(Self::GetArgs),
            8 => Ok(Self::VidMap),
            9 => Ok(Self::SetHandler),
            10 => Ok(Self::SigReturn),
            11 => Ok(Self::AllocateWindow),
            12 => Ok(Self::UpdateWindow),
            _ => Err(()),
        }
    }
}

/// Copy the argument string (including its NUL) into `buf`.
///
/// Fails when the process has no arguments or they do not fit.
pub fn sys_getargs(buf: &mut [u8]) -> i32 {
    process::with_table(|t| {
        let Some(pcb) = t.pcb(current_pid()) else {
            return -1;
        };

        let args = pcb.args_bytes();
        if args.is_empty() {
            return -1;
        }
        // The terminator must fit as well.
        if args.len() + 1 > buf.len() {
            return -1;
        }

        buf[..args.len()].copy_from_slice(args);
        buf[args.len()] = 0;
        0
    })
}

/// Install (or clear, when `handler` is zero) a signal handler.
pub fn sys_set_handler(signum: i32, handler: u32) -> i32 {
    if crate::signal::Signal::from_index(signum).is_none() {
        return -1;
    }

    process::with_table(|t| {
        let Some(pcb) = t.pcb_mut(current_pid()) else {
            return -1;
        };

        if handler == 0 {
            pcb.signal_handlers[signum as usize] = None;
            return 0;
        }

        if !is_userspace_region_valid(pcb, handler, 1) {
            return -1;
        }

        pcb.signal_handlers[signum as usize] = Some(handler);
        0
    })
}

/// Map video memory into the caller's address space; returns the user
/// virtual address, or `None` when the caller is unknown.
pub fn sys_vidmap() -> Option<u32> {
    process::with_table(|t| {
        let pcb = t.pcb_mut(current_pid())?;

        let phys = crate::tty::vid_mem_phys(pcb.tty);
        let addr = crate::mm::paging::map_video_mem_user(
            phys,
            crate::graphics::framebuffer().size_bytes(),
        );
        pcb.vid_mem = Some(addr);
        Some(addr)
    })
}

/// Create a window through the compositor collaborator.
pub fn sys_allocate_window(x: u32, y: u32, width: u32, height: u32) -> Option<(u32, u32)> {
    let compositor = crate::graphics::compositor().ok()?;
    compositor
        .allocate_window(x, y, width, height, current_pid())
        .ok()
}

/// Ask the compositor to redraw a window.
pub fn sys_update_window(id: u32) -> i32 {
    match crate::graphics::compositor().and_then(|c| c.update_window(id)) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Raw dispatch used by the int 0x80 linkage.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn dispatch(number: u32, p1: u32, p2: u32, p3: u32) -> i32 {
    let Ok(syscall) = Syscall::try_from(number) else {
        return -1;
    };

    match syscall {
        Syscall::Halt => process::process_halt((p1 & 0xFF) as u16),
        Syscall::Execute => {
            let Some(command) = copy_user_string(p1) else {
                return -1;
            };
            let tty = process::with_table(|t| {
                t.pcb(current_pid()).map(|p| p.tty).unwrap_or(1)
            });
            process::process_execute(&command, true, tty, true)
        }
        Syscall::Read => {
            let len = p3 as i32;
            if len < 0 {
                return -1;
            }
            let Some(buf) = user_slice_mut(p2, p3) else {
                return -1;
            };
            files::sys_read(p1 as i32, buf)
        }
        Syscall::Write => {
            let len = p3 as i32;
            if len < 0 {
                return -1;
            }
            let Some(buf) = user_slice(p2, p3) else {
                return -1;
            };
            files::sys_write(p1 as i32, buf)
        }
        Syscall::Open => {
            let Some(name) = copy_user_string(p1) else {
                return -1;
            };
            files::sys_open(&name)
        }
        Syscall::Close => files::sys_close(p1 as i32),
        Syscall::GetArgs => {
            let Some(buf) = user_slice_mut(p1, p2) else {
                return -1;
            };
            sys_getargs(buf)
        }
        Syscall::VidMap => {
            let Some(out) = user_slice_mut(p1, 4) else {
                return -1;
            };
            match sys_vidmap() {
                Some(addr) => {
                    out[..4].copy_from_slice(&addr.to_le_bytes());
                    0
                }
                None => -1,
            }
        }
        Syscall::SetHandler => sys_set_handler(p1 as i32, p2),
        Syscall::SigReturn => crate::signal::sigreturn(),
        Syscall::AllocateWindow => {
            // p2 points at six u32s: x, y, w, h, out id, out buffer.
            let Some(args) = user_slice_mut(p2, 24) else {
                return -1;
            };
            let word = |i: usize| {
                u32::from_le_bytes([args[i * 4], args[i * 4 + 1], args[i * 4 + 2], args[i * 4 + 3]])
            };
            match sys_allocate_window(word(0), word(1), word(2), word(3)) {
                Some((id, buffer)) => {
                    args[16..20].copy_from_slice(&id.to_le_bytes());
                    args[20..24].copy_from_slice(&buffer.to_le_bytes());
                    0
                }
                None => -1,
            }
        }
        Syscall::UpdateWindow => sys_update_window(p1),
    }
}

/// Borrow `[ptr, ptr + len)` of user memory after validating it against
/// the caller's mappings.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn user_slice_mut(ptr: u32, len: u32) -> Option<&'static mut [u8]> {
    let valid = process::with_table(|t| {
        t.pcb(current_pid())
            .map(|p| is_userspace_region_valid(p, ptr, len))
            .unwrap_or(false)
    });
    if !valid {
        return None;
    }
    // SAFETY: the range was validated to lie inside the caller's mapped
    // pages, which stay resident while the syscall runs.
    Some(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) })
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn user_slice(ptr: u32, len: u32) -> Option<&'static [u8]> {
    let slice = user_slice_mut(ptr, len)?;
    Some(slice)
}

/// Copy a NUL-terminated user string, validating every byte.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn copy_user_string(ptr: u32) -> Option<alloc::vec::Vec<u8>> {
    process::with_table(|t| {
        let pcb = t.pcb(current_pid())?;
        // SAFETY: userspace_string_len validates each byte before
        // reading it.
        let len = unsafe { process::validate::userspace_string_len(pcb, ptr)? };
        // SAFETY: the measured range was just validated.
        let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) };
        Some(bytes.to_vec())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{table::with_current_pid, with_table, Pid};

    fn spawn() -> Pid {
        with_table(|t| t.get_open_pid())
    }

    fn release(pid: Pid) {
        with_table(|t| t.release_slot(pid));
    }

    #[test]
    fn test_syscall_numbering() {
        assert_eq!(Syscall::try_from(1), Ok(Syscall::Halt));
        assert_eq!(Syscall::try_from(10), Ok(Syscall::SigReturn));
        assert_eq!(Syscall::try_from(12), Ok(Syscall::UpdateWindow));
        assert!(Syscall::try_from(0).is_err());
        assert!(Syscall::try_from(13).is_err());
    }

    #[test]
    fn test_getargs_roundtrip() {
        let pid = spawn();
        with_table(|t| t.pcb_mut(pid).unwrap().set_args(b"42"));

        with_current_pid(pid, || {
            let mut buf = [0u8; 10];
            assert_eq!(sys_getargs(&mut buf), 0);
            assert_eq!(&buf[..3], b"42\0");
        });

        release(pid);
    }

    #[test]
    fn test_getargs_requires_room_for_nul() {
        let pid = spawn();
        with_table(|t| t.pcb_mut(pid).unwrap().set_args(b"abcd"));

        with_current_pid(pid, || {
            let mut exact = [0u8; 5];
            assert_eq!(sys_getargs(&mut exact), 0);

            let mut short = [0u8; 4];
            assert_eq!(sys_getargs(&mut short), -1);
        });

        release(pid);
    }

    #[test]
    fn test_getargs_without_args_fails() {
        let pid = spawn();
        with_current_pid(pid, || {
            let mut buf = [0u8; 8];
            assert_eq!(sys_getargs(&mut buf), -1);
        });
        release(pid);
    }

    #[test]
    fn test_set_handler_validation() {
        use crate::mm::{PageMapping, LARGE_PAGE_SIZE};
        use crate::process::EXECUTABLE_VIRT_ADDR;

        let pid = spawn();
        with_table(|t| {
            t.pcb_mut(pid)
                .unwrap()
                .large_page_mappings
                .push(PageMapping::new(EXECUTABLE_VIRT_ADDR / LARGE_PAGE_SIZE, 9));
        });

        with_current_pid(pid, || {
            // Bad signal numbers are rejected.
            assert_eq!(sys_set_handler(-1, EXECUTABLE_VIRT_ADDR), -1);
            assert_eq!(sys_set_handler(5, EXECUTABLE_VIRT_ADDR), -1);

            // A handler outside the process's pages is rejected.
            assert_eq!(sys_set_handler(2, 0x1000), -1);

            // A valid handler installs, and zero clears it.
            assert_eq!(sys_set_handler(2, EXECUTABLE_VIRT_ADDR + 0x500), 0);
            with_table(|t| {
                assert_eq!(
                    t.pcb(pid).unwrap().signal_handlers[2],
                    Some(EXECUTABLE_VIRT_ADDR + 0x500)
                );
            });
            assert_eq!(sys_set_handler(2, 0), 0);
            with_table(|t| {
                assert_eq!(t.pcb(pid).unwrap().signal_handlers[2], None);
            });
        });

        release(pid);
    }

    #[test]
    fn test_window_syscalls_without_compositor() {
        let pid = spawn();
        with_current_pid(pid, || {
            assert!(sys_allocate_window(0, 0, 64, 48).is_none());
            assert_eq!(sys_update_window(1), -1);
        });
        release(pid);
    }
}
