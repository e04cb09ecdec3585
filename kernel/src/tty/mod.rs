//! Virtual terminal multiplexing.
//!
//! Three text consoles and one graphical console share the single
//! physical framebuffer. Exactly one TTY is active: its pixels live in
//! the framebuffer while every inactive TTY draws into a back-buffer of
//! the same size. Switching TTYs swaps buffer contents and retargets the
//! running process's video-memory window.

pub mod console;
pub mod keyboard;
pub mod terminal;

use core::fmt;

use spin::Once;

use crate::{
    error::{KernelError, KernelResult},
    graphics,
    process::{self, current_pid},
    sync::SpinLock,
};

/// Total TTYs (1-based indices).
pub const NUM_TTYS: u8 = 4;

/// TTYs 1..=3 are text consoles.
pub const NUM_TEXT_TTYS: usize = 3;

/// TTY 4 is the graphics console.
pub const GRAPHICS_TTY: u8 = 4;

/// Display memory for one inactive TTY.
struct BackBuffer {
    /// Kernel pointer used for buffer swaps and off-screen drawing.
    ptr: usize,
    /// Physical address handed to the user video-memory mapping.
    phys: u32,
}

struct TtyState {
    active: u8,
    back_buffers: [BackBuffer; NUM_TTYS as usize],
    shell_started: [bool; NUM_TEXT_TTYS],
}

impl TtyState {
    fn create() -> Self {
        Self {
            active: 1,
            back_buffers: [
                allocate_back_buffer(0),
                allocate_back_buffer(1),
                allocate_back_buffer(2),
                allocate_back_buffer(3),
            ],
            // The boot shell runs in TTY 1; the others spawn a shell on
            // first visit.
            shell_started: [true, false, false],
        }
    }
}

/// Reserve a 4 MiB frame for a back-buffer and identity-map it.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn allocate_back_buffer(_index: usize) -> BackBuffer {
    use crate::mm::{frame_allocator, paging, LARGE_PAGE_SIZE, PageFlags};

    let frame = frame_allocator::get_open_page().expect("no frame for TTY back-buffer");
    let addr = frame * LARGE_PAGE_SIZE;
    paging::identity_map_containing_region(
        addr,
        LARGE_PAGE_SIZE - 1,
        PageFlags::GLOBAL | PageFlags::READ_WRITE,
    )
    .expect("back-buffer frame already mapped");

    BackBuffer {
        ptr: addr as usize,
        phys: addr,
    }
}

/// Host rendition: heap buffers with fabricated physical addresses.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn allocate_back_buffer(index: usize) -> BackBuffer {
    use crate::mm::LARGE_PAGE_SIZE;

    let size = graphics::framebuffer().size_bytes() as usize;
    let buf = alloc::vec![0u8; size];
    let ptr = alloc::boxed::Box::leak(buf.into_boxed_slice()).as_mut_ptr() as usize;
    BackBuffer {
        ptr,
        phys: 0xD000_0000 + (index as u32) * LARGE_PAGE_SIZE,
    }
}

static TTY_STATE: Once<SpinLock<TtyState>> = Once::new();

fn state() -> &'static SpinLock<TtyState> {
    TTY_STATE.call_once(|| SpinLock::new(TtyState::create()))
}

/// Allocate the back-buffers and clear the initially inactive consoles.
pub fn init() {
    state();
    for tty in 2..=NUM_TEXT_TTYS as u8 {
        console::clear_tty(tty);
    }
}

/// The currently active TTY.
pub fn active_tty() -> u8 {
    state().lock_irqsave().active
}

/// Physical address of the display memory a process in `tty` writes to:
/// the framebuffer while the TTY is active, its back-buffer otherwise.
pub fn vid_mem_phys(tty: u8) -> u32 {
    if tty == 0 || tty > NUM_TTYS {
        return 0;
    }
    let st = state().lock_irqsave();
    if st.active == tty {
        graphics::framebuffer().phys_addr
    } else {
        st.back_buffers[tty as usize - 1].phys
    }
}

/// Kernel pointer to the display memory of `tty`, for console drawing
/// and buffer swaps.
pub(crate) fn vid_mem_ptr(tty: u8) -> *mut u8 {
    let st = state().lock_irqsave();
    if st.active == tty {
        graphics::framebuffer_ptr()
    } else {
        st.back_buffers[tty as usize - 1].ptr as *mut u8
    }
}

/// Switch the display to `new_tty`.
///
/// Saves the framebuffer into the outgoing TTY's back-buffer, restores
/// the incoming TTY's pixels, retargets the running process's
/// video-memory window, and spawns a shell the first time a text TTY is
/// visited (saving a resume point so control returns here afterwards).
pub fn tty_switch(new_tty: u8) -> KernelResult<()> {
    if new_tty == 0 || new_tty > NUM_TTYS {
        return Err(KernelError::InvalidArgument {
            name: "tty",
            value: "out_of_range",
        });
    }

    let fb_size = graphics::framebuffer().size_bytes() as usize;
    let fb = graphics::framebuffer_ptr();

    let spawn_shell = {
        let mut st = state().lock_irqsave();
        let old = st.active;

        if old != new_tty {
            let old_buf = st.back_buffers[old as usize - 1].ptr as *mut u8;
            let new_buf = st.back_buffers[new_tty as usize - 1].ptr as *mut u8;
            // SAFETY: the framebuffer and both back-buffers are
            // fb_size-byte regions that never overlap.
            unsafe {
                core::ptr::copy_nonoverlapping(fb, old_buf, fb_size);
                core::ptr::copy_nonoverlapping(new_buf, fb, fb_size);
            }
            st.active = new_tty;
        }

        if (new_tty as usize) <= NUM_TEXT_TTYS && !st.shell_started[new_tty as usize - 1] {
            st.shell_started[new_tty as usize - 1] = true;
            true
        } else {
            false
        }
    };

    // Retarget the running process's vid-mem window: a direct map if its
    // TTY just became active, its TTY's back-buffer otherwise.
    process::with_table(|t| {
        if let Some(pcb) = t.pcb(current_pid()) {
            if pcb.vid_mem.is_some() {
                crate::mm::paging::unmap_video_mem_user();
                crate::mm::paging::map_video_mem_user(vid_mem_phys(pcb.tty), fb_size as u32);
            }
        }
    });

    console::update_cursor();

    if new_tty == GRAPHICS_TTY {
        if let Ok(compositor) = graphics::compositor() {
            let _ = compositor.composite();
        }
    }

    if spawn_shell {
        // Spawned from the current kernel stack; execution resumes here
        // once the new shell yields the CPU back.
        process::process_execute(b"shell", false, new_tty, true);
    }

    Ok(())
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;

    struct ConsoleWriter(u8);

    impl Write for ConsoleWriter {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            console::puts_tty(s.as_bytes(), self.0);
            Ok(())
        }
    }

    let tty = active_tty();
    if (tty as usize) <= NUM_TEXT_TTYS {
        let _ = ConsoleWriter(tty).write_fmt(args);
    }
}

/// Serialize tests that touch the shared display state (active TTY,
/// framebuffer, line buffers).
#[cfg(test)]
pub(crate) fn display_test_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
pub(crate) fn set_active_for_test(tty: u8) {
    state().lock_irqsave().active = tty;
}

#[cfg(test)]
pub(crate) fn mark_shell_started_for_test(tty: u8) {
    state().lock_irqsave().shell_started[tty as usize - 1] = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    use super::display_test_lock as switch_lock;

    #[test]
    fn test_invalid_tty_rejected() {
        assert!(tty_switch(0).is_err());
        assert!(tty_switch(5).is_err());
    }

    #[test]
    fn test_switch_swaps_buffers() {
        let _guard = switch_lock();
        set_active_for_test(1);
        mark_shell_started_for_test(2);

        let fb = graphics::framebuffer_ptr();
        // SAFETY: the framebuffer buffer is writable.
        unsafe {
            *fb = 0x11;
        }

        tty_switch(2).unwrap();
        assert_eq!(active_tty(), 2);

        // TTY 1's pixels were saved into its back-buffer.
        let saved = vid_mem_ptr(1);
        // SAFETY: back-buffers are framebuffer-sized.
        unsafe {
            assert_eq!(*saved, 0x11);
        }

        // Drawing to TTY 2 now goes to the live framebuffer.
        // SAFETY: as above.
        unsafe {
            *graphics::framebuffer_ptr() = 0x22;
        }

        tty_switch(1).unwrap();
        assert_eq!(active_tty(), 1);
        // TTY 1's pixels came back.
        // SAFETY: as above.
        unsafe {
            assert_eq!(*graphics::framebuffer_ptr(), 0x11);
        }
        // TTY 2's buffer holds what was drawn while it was active.
        // SAFETY: as above.
        unsafe {
            assert_eq!(*vid_mem_ptr(2), 0x22);
        }
    }

    #[test]
    fn test_vid_mem_routing_follows_active() {
        let _guard = switch_lock();
        set_active_for_test(1);
        mark_shell_started_for_test(2);
        mark_shell_started_for_test(3);

        let fb_phys = graphics::framebuffer().phys_addr;
        assert_eq!(vid_mem_phys(1), fb_phys);
        assert_ne!(vid_mem_phys(2), fb_phys);

        tty_switch(3).unwrap();
        assert_eq!(vid_mem_phys(3), fb_phys);
        assert_ne!(vid_mem_phys(1), fb_phys);

        tty_switch(1).unwrap();
    }
}
