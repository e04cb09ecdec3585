//! 8259 PIC setup and end-of-interrupt plumbing.
//!
//! The controller pair is remapped to vectors 0x20..0x2F. Everything
//! beyond remap/EOI is the PIC crate's concern.

use pic8259::ChainedPics;
use spin::Mutex;

/// First vector of the primary controller after remap.
pub const PIC_1_OFFSET: u8 = 0x20;
/// First vector of the secondary controller.
pub const PIC_2_OFFSET: u8 = 0x28;

// SAFETY: the chosen offsets do not collide with CPU exceptions.
static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remap and unmask the controllers. Called once at boot.
pub fn init() {
    // SAFETY: standard 8259 initialization sequence, run once before
    // interrupts are enabled.
    unsafe {
        PICS.lock().initialize();
    }
}

/// Signal end-of-interrupt for the given IRQ line (0-15).
pub fn end_of_interrupt(irq: u8) {
    // SAFETY: acknowledging the vector we are currently servicing.
    unsafe {
        PICS.lock().notify_end_of_interrupt(PIC_1_OFFSET + irq);
    }
}
