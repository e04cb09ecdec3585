//! Framebuffer and compositor collaborator contracts.
//!
//! The SVGA MMIO driver is external; the kernel treats it as an opaque
//! linear framebuffer installed at boot. The windowing compositor is
//! likewise external and reached only through the window syscalls.

use spin::Once;

use crate::{
    error::{KernelError, KernelResult},
    process::Pid,
};

/// Bytes per framebuffer pixel (32-bit XRGB).
pub const BYTES_PER_PIXEL: u32 = 4;

/// Description of the linear framebuffer the display driver exposes.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    /// Physical base address of the framebuffer MMIO aperture.
    pub phys_addr: u32,
    pub width: u32,
    pub height: u32,
}

impl FramebufferInfo {
    pub const fn size_bytes(&self) -> u32 {
        self.width * self.height * BYTES_PER_PIXEL
    }
}

/// Fallback used until the display driver reports its aperture.
const DEFAULT_FRAMEBUFFER: FramebufferInfo = FramebufferInfo {
    phys_addr: 0xE000_0000,
    width: 1024,
    height: 768,
};

static FRAMEBUFFER: Once<FramebufferInfo> = Once::new();

/// Record the framebuffer reported by the display driver. Called once at
/// boot.
pub fn install_framebuffer(info: FramebufferInfo) {
    FRAMEBUFFER.call_once(|| info);
}

/// The active framebuffer description.
pub fn framebuffer() -> FramebufferInfo {
    FRAMEBUFFER.get().copied().unwrap_or(DEFAULT_FRAMEBUFFER)
}

/// Writable pointer to the live framebuffer pixels.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn framebuffer_ptr() -> *mut u8 {
    framebuffer().phys_addr as *mut u8
}

/// Host stand-in: a heap buffer of the same size, so console routing and
/// TTY switching are exercised for real in unit tests.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn framebuffer_ptr() -> *mut u8 {
    use spin::Once;
    static HOST_FRAMEBUFFER: Once<usize> = Once::new();
    *HOST_FRAMEBUFFER.call_once(|| {
        let size = framebuffer().size_bytes() as usize;
        let buf = alloc::vec![0u8; size];
        alloc::boxed::Box::leak(buf.into_boxed_slice()).as_mut_ptr() as usize
    }) as *mut u8
}

/// Windowing compositor contract, reached via syscalls 11 and 12.
pub trait Compositor: Send + Sync {
    /// Create a window and return `(window id, user buffer address)`.
    fn allocate_window(
        &self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pid: Pid,
    ) -> KernelResult<(u32, u32)>;

    /// Redraw the window with the given id.
    fn update_window(&self, id: u32) -> KernelResult<()>;

    /// Recomposite the whole desktop (after a switch to the graphics
    /// TTY).
    fn composite(&self) -> KernelResult<()> {
        Ok(())
    }
}

static COMPOSITOR: Once<&'static dyn Compositor> = Once::new();

/// Install the compositor. Called once at boot when a display is present.
pub fn install_compositor(compositor: &'static dyn Compositor) {
    COMPOSITOR.call_once(|| compositor);
}

/// The installed compositor, if any.
pub fn compositor() -> KernelResult<&'static dyn Compositor> {
    COMPOSITOR.get().copied().ok_or(KernelError::NotInitialized {
        subsystem: "compositor",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framebuffer_defaults() {
        let fb = framebuffer();
        assert_eq!(fb.size_bytes(), fb.width * fb.height * BYTES_PER_PIXEL);
    }

    #[test]
    fn test_host_framebuffer_is_writable() {
        let ptr = framebuffer_ptr();
        // SAFETY: the host framebuffer is a leaked heap buffer of
        // size_bytes() bytes.
        unsafe {
            *ptr = 0x42;
            assert_eq!(*ptr, 0x42);
        }
    }

    #[test]
    fn test_missing_compositor_reported() {
        assert!(compositor().is_err());
    }
}
