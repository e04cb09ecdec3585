//! Interrupt descriptor table.
//!
//! Trap gates for the 32 CPU exceptions, interrupt gates for the
//! hardware IRQs in use (timer, keyboard, RTC, PCI shared, mouse), and a
//! DPL-3 trap gate for int 0x80 so syscalls keep interrupts enabled.

use core::cell::UnsafeCell;

use crate::arch::KERNEL_CS;

use super::linkage;

/// 32-bit trap gate (IF preserved).
const GATE_TRAP: u8 = 0x8F;
/// 32-bit interrupt gate (IF cleared on entry).
const GATE_INTERRUPT: u8 = 0x8E;
/// Trap gate callable from CPL 3.
const GATE_TRAP_USER: u8 = 0xEF;

/// Hardware vectors after the PIC remap.
pub const VECTOR_TIMER: u8 = 0x20;
pub const VECTOR_KEYBOARD: u8 = 0x21;
pub const VECTOR_RTC: u8 = 0x28;
pub const VECTOR_PCI: u8 = 0x2B;
pub const VECTOR_MOUSE: u8 = 0x2C;
pub const VECTOR_SYSCALL: u8 = 0x80;

#[derive(Clone, Copy)]
#[repr(C, packed)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    flags: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            zero: 0,
            flags: 0,
            offset_high: 0,
        }
    }

    fn new(handler: extern "C" fn(), flags: u8) -> Self {
        let addr = handler as usize as u32;
        Self {
            offset_low: (addr & 0xFFFF) as u16,
            selector: KERNEL_CS,
            zero: 0,
            flags,
            offset_high: (addr >> 16) as u16,
        }
    }
}

struct IdtCell(UnsafeCell<[IdtEntry; 256]>);

// SAFETY: written once during init before interrupts are enabled.
unsafe impl Sync for IdtCell {}

static IDT: IdtCell = IdtCell(UnsafeCell::new([IdtEntry::missing(); 256]));

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

/// Fill the table and load IDTR. Called once at boot with interrupts
/// still masked.
pub fn init() {
    let exceptions: [(usize, extern "C" fn()); 19] = [
        (0, linkage::divide_error_linkage),
        (1, linkage::debug_linkage),
        (2, linkage::nmi_linkage),
        (3, linkage::breakpoint_linkage),
        (4, linkage::overflow_linkage),
        (5, linkage::bound_range_linkage),
        (6, linkage::invalid_opcode_linkage),
        (7, linkage::device_na_linkage),
        (8, linkage::double_fault_linkage),
        (9, linkage::coprocessor_overrun_linkage),
        (10, linkage::invalid_tss_linkage),
        (11, linkage::segment_np_linkage),
        (12, linkage::stack_fault_linkage),
        (13, linkage::general_protection_linkage),
        (14, linkage::page_fault_linkage),
        (16, linkage::fpu_error_linkage),
        (17, linkage::alignment_check_linkage),
        (18, linkage::machine_check_linkage),
        (19, linkage::simd_exception_linkage),
    ];

    // SAFETY: runs once before interrupts are enabled; the table is a
    // static so the loaded pointer stays valid.
    unsafe {
        let idt = &mut *IDT.0.get();

        for (vector, handler) in exceptions {
            idt[vector] = IdtEntry::new(handler, GATE_TRAP);
        }

        idt[VECTOR_TIMER as usize] = IdtEntry::new(linkage::timer_linkage, GATE_INTERRUPT);
        idt[VECTOR_KEYBOARD as usize] = IdtEntry::new(linkage::keyboard_linkage, GATE_INTERRUPT);
        idt[VECTOR_RTC as usize] = IdtEntry::new(linkage::rtc_linkage, GATE_INTERRUPT);
        idt[VECTOR_PCI as usize] = IdtEntry::new(linkage::pci_linkage, GATE_INTERRUPT);
        idt[VECTOR_MOUSE as usize] = IdtEntry::new(linkage::mouse_linkage, GATE_INTERRUPT);

        idt[VECTOR_SYSCALL as usize] = IdtEntry::new(linkage::syscall_linkage, GATE_TRAP_USER);

        let pointer = DescriptorTablePointer {
            limit: (core::mem::size_of::<[IdtEntry; 256]>() - 1) as u16,
            base: IDT.0.get() as u32,
        };
        core::arch::asm!("lidt [{0}]", in(reg) core::ptr::addr_of!(pointer));
    }
}
