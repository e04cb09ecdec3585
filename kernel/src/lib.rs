//! Quartz kernel library.
//!
//! A small preemptive x86 (32-bit, protected-mode) teaching kernel:
//! 4 MiB-superpage virtual memory with a free-frame allocator, a
//! round-robin scheduler with stack-rewriting signal delivery, four
//! virtual terminals over one framebuffer, and an Ethernet stack up to
//! UDP with ARP and a DHCP client.
//!
//! The library also compiles for the host target so the pure-logic
//! subsystems run under the standard `#[test]` harness; privileged code
//! is confined to `arch` and compiled only for bare metal.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Bare metal uses the kernel's own first-fit heap as the global
// allocator; the host target delegates to the system allocator so test
// code allocates normally.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: mm::heap::LockedKernelHeap = mm::heap::LockedKernelHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod error;
pub mod fs;
pub mod graphics;
pub mod log_service;
pub mod mm;
pub mod net;
pub mod process;
pub mod sched;
pub mod serial;
pub mod signal;
pub mod sync;
pub mod syscall;
pub mod timer;
pub mod tty;

pub use error::{KernelError, KernelResult};

/// Bring the kernel up to the point where the first shell can run:
/// paging and the heap, segmentation and interrupt delivery, consoles,
/// signals and the network stack.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() {
    mm::paging::init();
    // SAFETY: the heap arena was identity-mapped by paging::init and is
    // reserved for the allocator; this runs once.
    unsafe {
        ALLOCATOR.init(
            mm::KERNEL_HEAP_START as *mut u8,
            mm::KERNEL_HEAP_SIZE as usize,
        );
    }

    log_service::init();
    arch::x86::init();

    tty::init();

    signal::init().expect("signal init failed");
    net::init().expect("network init failed");

    println!("quartz kernel v{}", env!("CARGO_PKG_VERSION"));
}

/// Heap allocation failure in a no_std kernel is unrecoverable.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout);
}
