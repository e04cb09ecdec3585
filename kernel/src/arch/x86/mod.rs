//! x86 protected-mode implementation: segmentation, interrupt plumbing,
//! the context switch and the user-mode transition.

pub mod context;
pub mod gdt;
pub mod idt;
pub mod linkage;
pub mod pic;
pub mod pit;
pub mod usermode;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub use context::switch_context;
pub use usermode::enter_user;

/// Whether the CPU was executing user code when the last kernel entry
/// happened. Maintained by the linkages and `enter_user`.
static IN_USERSPACE: AtomicBool = AtomicBool::new(false);

/// ESP value recorded by the timer linkage at its entry (adjusted to the
/// frame top), used to detect "the timer is the only thing on this
/// kernel stack".
pub(super) static TIMER_LINKAGE_ESP: AtomicU32 = AtomicU32::new(0);

pub fn set_in_userspace(value: bool) {
    IN_USERSPACE.store(value, Ordering::Relaxed);
}

pub fn in_userspace() -> bool {
    IN_USERSPACE.load(Ordering::Relaxed)
}

/// Current TSS esp0 (top of the running process's kernel stack minus the
/// PID word).
pub fn tss_esp0() -> u32 {
    gdt::tss_esp0()
}

pub fn set_tss_esp0(value: u32) {
    gdt::set_tss_esp0(value);
}

pub fn set_tss_ss0(selector: u16) {
    gdt::set_tss_ss0(selector);
}

/// True when the saved timer-entry ESP matches the TSS stack top: the
/// scheduler's interrupt is the only frame on the stack, so preemption
/// and signal delivery are safe.
pub fn timer_is_only_frame() -> bool {
    TIMER_LINKAGE_ESP.load(Ordering::Relaxed) == tss_esp0()
}

/// Unmask maskable interrupts.
pub fn enable_interrupts() {
    // SAFETY: enabling interrupts at CPL 0 with a loaded IDT is always
    // permitted.
    unsafe {
        x86::irq::enable();
    }
}

/// Set up segmentation and interrupt delivery. Called once at boot,
/// before the first interrupt can fire.
pub fn init() {
    gdt::init();
    idt::init();
    pic::init();
    pit::init();
}
