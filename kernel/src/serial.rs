//! COM1 serial console.
//!
//! All kernel log output is mirrored to the first 16550 UART so that runs
//! under an emulator can capture it with `-serial stdio`.

#![cfg(all(target_arch = "x86", target_os = "none"))]

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

/// I/O port base of COM1
const COM1_PORT: u16 = 0x3F8;

lazy_static! {
    static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 port base on PC hardware and is
        // not claimed by any other driver in this kernel.
        let mut serial_port = unsafe { SerialPort::new(COM1_PORT) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    // Interrupt handlers also log; mask interrupts while the port is held so
    // a nested handler cannot deadlock on SERIAL1.
    crate::sync::with_irqs_masked(|| {
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("serial port write failed");
    });
}
