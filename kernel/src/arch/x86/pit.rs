//! Programmable interval timer setup.
//!
//! Channel 0 runs in rate-generator mode at ~69 Hz and drives the
//! scheduler through [`super::linkage::timer_linkage`]. The tick
//! bookkeeping itself lives in [`crate::timer`].

use crate::timer::PIT_FREQUENCY;

const CHANNEL_0_DATA: u16 = 0x40;
const COMMAND: u16 = 0x43;

/// Channel 0, lobyte/hibyte access, mode 2 (rate generator), binary.
const COMMAND_WORD: u8 = 0x34;

/// Base oscillator frequency in Hz.
const BASE_FREQUENCY: u32 = 1_193_182;

/// Program channel 0 for the scheduler tick. Called once at boot.
pub fn init() {
    let reload = (BASE_FREQUENCY / PIT_FREQUENCY) as u16;

    // SAFETY: standard PIT programming sequence on the canonical ports.
    unsafe {
        x86::io::outb(COMMAND, COMMAND_WORD);
        x86::io::outb(CHANNEL_0_DATA, (reload & 0xFF) as u8);
        x86::io::outb(CHANNEL_0_DATA, (reload >> 8) as u8);
    }
}
