//! GDT and TSS.
//!
//! Flat 4 GiB segments: kernel code/data at DPL 0, user code/data at
//! DPL 3, plus a single TSS whose esp0/ss0 the scheduler repoints at
//! every context switch.

use core::cell::UnsafeCell;

use crate::arch::{KERNEL_DS, TSS_SELECTOR};

/// 32-bit task state segment. Only esp0/ss0 are ever read by hardware in
/// this kernel (no hardware task switching).
#[repr(C, packed)]
struct TaskStateSegment {
    prev_task_link: u32,
    esp0: u32,
    ss0: u32,
    unused: [u32; 22],
    /// I/O map base past the segment limit: no I/O bitmap.
    iomap_base: u32,
}

struct TssCell(UnsafeCell<TaskStateSegment>);

// SAFETY: single processor; esp0/ss0 writes happen with interrupts
// masked (context switch, execute) and reads are single u32 loads.
unsafe impl Sync for TssCell {}

static TSS: TssCell = TssCell(UnsafeCell::new(TaskStateSegment {
    prev_task_link: 0,
    esp0: 0,
    ss0: KERNEL_DS as u32,
    unused: [0; 22],
    iomap_base: 104 << 16,
}));

pub fn tss_esp0() -> u32 {
    // SAFETY: aligned u32 load from a static.
    unsafe { core::ptr::addr_of!((*TSS.0.get()).esp0).read() }
}

pub fn set_tss_esp0(value: u32) {
    // SAFETY: aligned u32 store to a static; callers hold interrupts
    // masked.
    unsafe {
        core::ptr::addr_of_mut!((*TSS.0.get()).esp0).write(value);
    }
}

pub fn set_tss_ss0(selector: u16) {
    // SAFETY: as for set_tss_esp0.
    unsafe {
        core::ptr::addr_of_mut!((*TSS.0.get()).ss0).write(selector as u32);
    }
}

/// Flat segment descriptors. Layout per the IA-32 manuals; limit 4 GiB,
/// granularity 4 KiB, 32-bit.
const KERNEL_CODE_DESC: u64 = 0x00CF_9A00_0000_FFFF;
const KERNEL_DATA_DESC: u64 = 0x00CF_9200_0000_FFFF;
const USER_CODE_DESC: u64 = 0x00CF_FA00_0000_FFFF;
const USER_DATA_DESC: u64 = 0x00CF_F200_0000_FFFF;

struct GdtCell(UnsafeCell<[u64; 6]>);

// SAFETY: written once during init before interrupts are enabled.
unsafe impl Sync for GdtCell {}

static GDT: GdtCell = GdtCell(UnsafeCell::new([0; 6]));

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

/// Build a 32-bit available-TSS system descriptor for the given base and
/// limit.
fn tss_descriptor(base: u32, limit: u32) -> u64 {
    let base = base as u64;
    let limit = limit as u64;
    (limit & 0xFFFF)
        | ((base & 0xFF_FFFF) << 16)
        | (0x89u64 << 40) // present, DPL 0, 32-bit available TSS
        | (((limit >> 16) & 0xF) << 48)
        | (((base >> 24) & 0xFF) << 56)
}

/// Load the GDT, reload the segment registers, and load the task
/// register. Called once at boot.
pub fn init() {
    let tss_base = TSS.0.get() as u32;

    // SAFETY: runs once, before interrupts are enabled, on the boot
    // stack. The descriptor table and TSS are statics so the loaded
    // pointers stay valid forever.
    unsafe {
        let gdt = &mut *GDT.0.get();
        gdt[0] = 0;
        gdt[1] = KERNEL_CODE_DESC;
        gdt[2] = KERNEL_DATA_DESC;
        gdt[3] = USER_CODE_DESC;
        gdt[4] = USER_DATA_DESC;
        gdt[5] = tss_descriptor(tss_base, core::mem::size_of::<TaskStateSegment>() as u32 - 1);

        let pointer = DescriptorTablePointer {
            limit: core::mem::size_of::<[u64; 6]>() as u16 - 1,
            base: GDT.0.get() as u32,
        };

        core::arch::asm!(
            "lgdt [{ptr}]",
            // Reload CS with a far jump through the new descriptor.
            "push {kcs}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            // Reload the data segments.
            "mov ds, {kds:x}",
            "mov es, {kds:x}",
            "mov fs, {kds:x}",
            "mov gs, {kds:x}",
            "mov ss, {kds:x}",
            "ltr {tss:x}",
            ptr = in(reg) core::ptr::addr_of!(pointer),
            kcs = const crate::arch::KERNEL_CS as u32,
            kds = in(reg) KERNEL_DS as u32,
            tss = in(reg) TSS_SELECTOR as u32,
            tmp = out(reg) _,
        );
    }
}
