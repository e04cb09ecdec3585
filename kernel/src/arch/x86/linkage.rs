//! Interrupt and syscall linkages.
//!
//! Every kernel entry from user mode lays the interrupted program's
//! registers out identically: the CPU's five-word frame, then the eight
//! `pushal` words below it. That fixed shape is what the signal code and
//! `syscall` return-value plumbing rely on (see [`crate::arch::UserContext`]).

use core::sync::atomic::Ordering;

use crate::arch::{KERNEL_DS, USER_DS};

use super::TIMER_LINKAGE_ESP;

/// Scratch slot for exception error codes; single processor, written
/// with interrupts gated off in the handler prologue.
#[no_mangle]
static mut EXCEPTION_ERROR_CODE: u32 = 0;

// ---------------------------------------------------------------------------
// Rust-side handlers
// ---------------------------------------------------------------------------

extern "C" fn timer_handler() {
    super::pic::end_of_interrupt(0);
    crate::timer::tick();
    crate::sched::scheduler_tick();
}

extern "C" fn keyboard_handler() {
    super::set_in_userspace(false);
    super::pic::end_of_interrupt(1);

    // SAFETY: reading the keyboard controller data port is side-effect
    // free beyond consuming the scancode.
    let scancode = unsafe { x86::io::inb(0x60) };
    crate::tty::keyboard::isr::handle_scancode(scancode);

    super::set_in_userspace(true);
}

extern "C" fn rtc_handler() {
    // Acknowledge the RTC (register C) so it keeps interrupting; the
    // actual RTC driver is external.
    // SAFETY: standard CMOS index/data port access.
    unsafe {
        x86::io::outb(0x70, 0x0C);
        let _ = x86::io::inb(0x71);
    }
    super::pic::end_of_interrupt(8);
}

extern "C" fn pci_handler() {
    // Shared line for the network devices; drivers hook the receive
    // path directly.
    super::pic::end_of_interrupt(11);
}

extern "C" fn mouse_handler() {
    // Drain the controller so the line clears; the mouse driver is
    // external.
    // SAFETY: reading the PS/2 data port only consumes the byte.
    let _ = unsafe { x86::io::inb(0x60) };
    super::pic::end_of_interrupt(12);
}

extern "C" fn syscall_entry(number: u32, p1: u32, p2: u32, p3: u32) -> i32 {
    super::set_in_userspace(false);
    let retval = crate::syscall::dispatch(number, p1, p2, p3);
    super::set_in_userspace(true);
    retval
}

/// Common exception dispatch: user-mode divide-zero and page faults turn
/// into signals; everything else is fatal.
extern "C" fn exception_dispatch(vector: u32, error_code: u32) {
    let from_user = super::in_userspace();

    match vector {
        0 if from_user => {
            let pid = crate::process::current_pid();
            let _ = crate::signal::send_signal(pid, crate::signal::Signal::DivZero, 0);
            crate::signal::handle_signals();
        }
        14 if from_user => {
            let pid = crate::process::current_pid();
            let _ = crate::signal::send_signal(pid, crate::signal::Signal::Segfault, 0);
            crate::signal::handle_signals();
        }
        _ => fatal_exception(vector, error_code),
    }
}

/// Kernel-mode fault: dump a diagnostic and halt.
fn fatal_exception(vector: u32, error_code: u32) -> ! {
    // SAFETY: masking interrupts before halting is always permitted at
    // CPL 0.
    unsafe {
        x86::irq::disable();
    }

    let cr2 = if vector == 14 {
        // SAFETY: reading CR2 is side-effect free.
        Some(unsafe { x86::controlregs::cr2() })
    } else {
        None
    };

    crate::serial_println!("\n*** FATAL EXCEPTION {} (error {:#x}) ***", vector, error_code);
    crate::println!("\n*** FATAL EXCEPTION {} (error {:#x}) ***", vector, error_code);
    if let Some(addr) = cr2 {
        crate::serial_println!("    faulting address {:#010x}", addr);
        crate::println!("    faulting address {:#010x}", addr);
    }

    loop {
        // SAFETY: halting with interrupts masked parks the CPU.
        unsafe {
            core::arch::asm!("hlt");
        }
    }
}

/// Record the timer's frame top so the scheduler can tell whether the
/// tick interrupted the top of a user entry or nested kernel work.
#[no_mangle]
extern "C" fn record_timer_esp(frame_top: u32) {
    TIMER_LINKAGE_ESP.store(frame_top, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Naked linkages
// ---------------------------------------------------------------------------

/// Generate an IRQ linkage: uniform pushal frame, kernel data segments,
/// a call into the Rust handler, user data segments restored when the
/// IRET returns to CPL 3.
macro_rules! irq_linkage {
    ($name:ident, $handler:ident) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() {
            core::arch::naked_asm!(
                "pushal",
                "mov eax, {kds}",
                "mov ds, ax",
                "mov es, ax",
                "mov fs, ax",
                "mov gs, ax",
                "call {handler}",
                // Returning to user mode needs user data segments back.
                "mov eax, [esp + 36]",
                "and eax, 3",
                "cmp eax, 3",
                "jne 3f",
                "mov eax, {uds}",
                "mov ds, ax",
                "mov es, ax",
                "mov fs, ax",
                "mov gs, ax",
                "3:",
                "popal",
                "iretd",
                kds = const KERNEL_DS as u32,
                uds = const USER_DS as u32,
                handler = sym $handler,
            )
        }
    };
}

irq_linkage!(keyboard_linkage, keyboard_handler);
irq_linkage!(rtc_linkage, rtc_handler);
irq_linkage!(pci_linkage, pci_handler);
irq_linkage!(mouse_linkage, mouse_handler);

/// The timer linkage additionally records its frame top (entry ESP plus
/// the CPU frame) before handing off, so the scheduler can detect that
/// this interrupt is the only thing on the kernel stack.
#[unsafe(naked)]
pub extern "C" fn timer_linkage() {
    core::arch::naked_asm!(
        "pushal",
        "mov eax, {kds}",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        // frame top = current esp + pushal (32) + CPU frame (20).
        "lea eax, [esp + 52]",
        "push eax",
        "call {record}",
        "add esp, 4",
        "call {handler}",
        "mov eax, [esp + 36]",
        "and eax, 3",
        "cmp eax, 3",
        "jne 3f",
        "mov eax, {uds}",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "3:",
        "popal",
        "iretd",
        kds = const KERNEL_DS as u32,
        uds = const USER_DS as u32,
        record = sym record_timer_esp,
        handler = sym timer_handler,
    )
}

/// int 0x80: number in EAX, arguments in EBX/ECX/EDX. The return value
/// is written into the saved EAX slot so the interrupted program sees it
/// after IRET.
#[unsafe(naked)]
pub extern "C" fn syscall_linkage() {
    core::arch::naked_asm!(
        "pushal",
        "mov ebp, {kds}",
        "mov ds, bp",
        "mov es, bp",
        "mov fs, bp",
        "mov gs, bp",
        "push edx",
        "push ecx",
        "push ebx",
        "push eax",
        "call {entry}",
        "add esp, 16",
        // Saved EAX lives at pushal slot 7 (esp + 28).
        "mov [esp + 28], eax",
        "mov eax, {uds}",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "popal",
        "iretd",
        kds = const KERNEL_DS as u32,
        uds = const USER_DS as u32,
        entry = sym syscall_entry,
    )
}

/// Exception linkage without a CPU error code.
macro_rules! exception_linkage {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() {
            core::arch::naked_asm!(
                "pushal",
                "mov eax, {kds}",
                "mov ds, ax",
                "mov es, ax",
                "mov fs, ax",
                "mov gs, ax",
                "push 0",
                "push {vector}",
                "call {dispatch}",
                "add esp, 8",
                "mov eax, [esp + 36]",
                "and eax, 3",
                "cmp eax, 3",
                "jne 3f",
                "mov eax, {uds}",
                "mov ds, ax",
                "mov es, ax",
                "mov fs, ax",
                "mov gs, ax",
                "3:",
                "popal",
                "iretd",
                kds = const KERNEL_DS as u32,
                uds = const USER_DS as u32,
                vector = const $vector,
                dispatch = sym exception_dispatch,
            )
        }
    };
    ($name:ident, $vector:expr, err) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() {
            core::arch::naked_asm!(
                // Move the CPU-pushed error code aside so the frame
                // keeps the uniform shape.
                "pop dword ptr [{scratch}]",
                "pushal",
                "mov eax, {kds}",
                "mov ds, ax",
                "mov es, ax",
                "mov fs, ax",
                "mov gs, ax",
                "push dword ptr [{scratch}]",
                "push {vector}",
                "call {dispatch}",
                "add esp, 8",
                "mov eax, [esp + 36]",
                "and eax, 3",
                "cmp eax, 3",
                "jne 3f",
                "mov eax, {uds}",
                "mov ds, ax",
                "mov es, ax",
                "mov fs, ax",
                "mov gs, ax",
                "3:",
                "popal",
                "iretd",
                kds = const KERNEL_DS as u32,
                uds = const USER_DS as u32,
                vector = const $vector,
                scratch = sym EXCEPTION_ERROR_CODE,
                dispatch = sym exception_dispatch,
            )
        }
    };
}

exception_linkage!(divide_error_linkage, 0);
exception_linkage!(debug_linkage, 1);
exception_linkage!(nmi_linkage, 2);
exception_linkage!(breakpoint_linkage, 3);
exception_linkage!(overflow_linkage, 4);
exception_linkage!(bound_range_linkage, 5);
exception_linkage!(invalid_opcode_linkage, 6);
exception_linkage!(device_na_linkage, 7);
exception_linkage!(double_fault_linkage, 8, err);
exception_linkage!(coprocessor_overrun_linkage, 9);
exception_linkage!(invalid_tss_linkage, 10, err);
exception_linkage!(segment_np_linkage, 11, err);
exception_linkage!(stack_fault_linkage, 12, err);
exception_linkage!(general_protection_linkage, 13, err);
exception_linkage!(page_fault_linkage, 14, err);
exception_linkage!(fpu_error_linkage, 16);
exception_linkage!(alignment_check_linkage, 17, err);
exception_linkage!(machine_check_linkage, 18);
exception_linkage!(simd_exception_linkage, 19);
