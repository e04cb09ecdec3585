//! Kernel entry point.

#![cfg_attr(all(target_arch = "x86", target_os = "none"), no_std)]
#![cfg_attr(all(target_arch = "x86", target_os = "none"), no_main)]

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod kernel_main {
    use core::panic::PanicInfo;

    use quartz_kernel::{println, process, serial_println};

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        serial_println!("[KERNEL PANIC] {}", info);
        println!("[KERNEL PANIC] {}", info);
        loop {
            // SAFETY: parking the CPU after a panic.
            unsafe {
                core::arch::asm!("cli", "hlt");
            }
        }
    }

    /// Boot entry, reached from the bootloader with a flat 32-bit
    /// protected-mode environment and the boot stack in low memory.
    #[no_mangle]
    pub extern "C" fn _start() -> ! {
        quartz_kernel::init();

        // The external collaborators (filesystem image reader, display
        // driver, E1000) register themselves here in a full image build:
        //   fs::install(...);
        //   graphics::install_framebuffer(...);
        //   net::device::register_eth_device(...);

        println!("starting shell in tty 1");
        process::process_execute(b"shell", false, 1, false);

        // Only reached if the first shell could not be launched.
        panic!("failed to start the initial shell");
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn main() {
    // The kernel binary only has meaning on the bare-metal target; the
    // host build exists for the test harness.
}
