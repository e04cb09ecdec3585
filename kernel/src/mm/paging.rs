//! Page directory management.
//!
//! The kernel keeps a single page directory of 4 MiB superpage entries plus
//! two 4 KiB page tables: one mapping the video window for the kernel, one
//! painting video memory into user space at a fixed slot. Process images
//! are mapped and unmapped as whole 4 MiB regions.
//!
//! Map calls refuse to overwrite a present entry; callers unmap first.

use bitflags::bitflags;

use crate::{
    error::{KernelError, KernelResult},
    sync::SpinLock,
};

use super::{
    frame_allocator, LARGE_PAGE_SIZE, NORMAL_PAGE_SIZE, PAGE_DIRECTORY_ENTRIES,
    PAGE_TABLE_ENTRIES, USER_VIDEO_VIRT_ADDR, VIDEO_MEM_ADDR, VIDEO_MEM_SIZE,
};

bitflags! {
    /// Flag bits shared by page-directory and page-table entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT       = 1 << 0;
        const READ_WRITE    = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        /// PDE maps a 4 MiB page instead of pointing at a page table.
        const PAGE_SIZE_4M  = 1 << 7;
        /// Translation survives a CR3 reload.
        const GLOBAL        = 1 << 8;
    }
}

/// 4 KiB-aligned array of page directory or page table entries.
#[repr(C, align(4096))]
struct EntryTable([u32; PAGE_TABLE_ENTRIES]);

impl EntryTable {
    const fn new() -> Self {
        Self([0; PAGE_TABLE_ENTRIES])
    }
}

/// The kernel page directory.
static PAGE_DIRECTORY: SpinLock<EntryTable> = SpinLock::new(EntryTable::new());

/// 4 KiB mappings for the kernel's own view of video memory (slot 0).
static VIDEO_PAGE_TABLE: SpinLock<EntryTable> = SpinLock::new(EntryTable::new());

/// 4 KiB mappings painted into the fixed user video slot by `vidmap`.
static USER_VIDEO_PAGE_TABLE: SpinLock<EntryTable> = SpinLock::new(EntryTable::new());

/// Reload CR3 so the hardware observes directory changes.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn flush_directory(directory: &EntryTable) {
    let addr = directory.0.as_ptr() as u32;
    // SAFETY: the directory is a static inside the identity-mapped kernel
    // image, so its virtual address equals its physical address and is a
    // valid CR3 value.
    unsafe {
        x86::controlregs::cr3_write(addr as u64);
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn flush_directory(_directory: &EntryTable) {}

/// Map `num_pdes` large pages starting at `virt` to physical memory
/// starting at `phys`. Both addresses are rounded down to 4 MiB.
///
/// Fails without side effects if any target slot is already present.
pub fn map_region(phys: u32, virt: u32, num_pdes: u32, flags: PageFlags) -> KernelResult<()> {
    let phys_base = phys / LARGE_PAGE_SIZE;
    let virt_base = virt / LARGE_PAGE_SIZE;

    let mut dir = PAGE_DIRECTORY.lock_irqsave();

    for i in 0..num_pdes {
        let pde_index = (virt_base + i) as usize;
        if pde_index >= PAGE_DIRECTORY_ENTRIES {
            return Err(KernelError::InvalidAddress { addr: virt });
        }
        if dir.0[pde_index] & PageFlags::PRESENT.bits() != 0 {
            return Err(KernelError::AlreadyMapped {
                virt_index: virt_base + i,
            });
        }
    }

    for i in 0..num_pdes {
        let pde_index = (virt_base + i) as usize;
        let frame_addr = (phys_base + i) * LARGE_PAGE_SIZE;
        dir.0[pde_index] =
            frame_addr | (flags | PageFlags::PAGE_SIZE_4M | PageFlags::PRESENT).bits();
    }

    flush_directory(&dir);
    Ok(())
}

/// Unconditionally clear `num_pdes` directory slots starting at the 4 MiB
/// region containing `virt`.
pub fn unmap_region(virt: u32, num_pdes: u32) {
    let virt_base = (virt / LARGE_PAGE_SIZE) as usize;

    let mut dir = PAGE_DIRECTORY.lock_irqsave();
    for i in 0..num_pdes as usize {
        if virt_base + i < PAGE_DIRECTORY_ENTRIES {
            dir.0[virt_base + i] = 0;
        }
    }
    flush_directory(&dir);
}

/// Map the smallest 4 MiB-aligned super-region fully containing
/// `size` bytes at `phys`/`virt`.
///
/// The two addresses must share the same offset within a 4 MiB page.
pub fn map_containing_region(
    phys: u32,
    virt: u32,
    size: u32,
    flags: PageFlags,
) -> KernelResult<()> {
    if phys % LARGE_PAGE_SIZE != virt % LARGE_PAGE_SIZE {
        return Err(KernelError::MisalignedRegion { phys, virt });
    }

    let phys_aligned = phys / LARGE_PAGE_SIZE * LARGE_PAGE_SIZE;
    let virt_aligned = virt / LARGE_PAGE_SIZE * LARGE_PAGE_SIZE;
    // Bytes requested plus the bytes introduced by aligning downwards,
    // rounded out to whole directory entries.
    let num_pdes = (size + phys % LARGE_PAGE_SIZE) / LARGE_PAGE_SIZE + 1;

    map_region(phys_aligned, virt_aligned, num_pdes, flags)
}

/// Clear the smallest containing super-region previously mapped with
/// [`map_containing_region`].
pub fn unmap_containing_region(virt: u32, size: u32) {
    let num_pdes = (size + virt % LARGE_PAGE_SIZE) / LARGE_PAGE_SIZE + 1;
    unmap_region(virt, num_pdes);
}

/// Identity-map the smallest containing super-region.
pub fn identity_map_containing_region(addr: u32, size: u32, flags: PageFlags) -> KernelResult<()> {
    map_containing_region(addr, addr, size, flags)
}

/// Paint `size` bytes of physical memory at `phys_target` into the fixed
/// user video slot, user-accessible, and return the user virtual address.
///
/// The existing contents of the user video page table are replaced; this
/// is how the vid-mem window is retargeted between the live framebuffer
/// and a TTY back-buffer.
pub fn map_video_mem_user(phys_target: u32, size: u32) -> u32 {
    let mut table = USER_VIDEO_PAGE_TABLE.lock_irqsave();
    let pages = size.div_ceil(NORMAL_PAGE_SIZE) as usize;

    for i in 0..PAGE_TABLE_ENTRIES {
        table.0[i] = if i < pages {
            (phys_target + (i as u32) * NORMAL_PAGE_SIZE)
                | (PageFlags::USER | PageFlags::READ_WRITE | PageFlags::PRESENT).bits()
        } else {
            0
        };
    }

    let table_addr = table.0.as_ptr() as u32;
    drop(table);

    let mut dir = PAGE_DIRECTORY.lock_irqsave();
    dir.0[(USER_VIDEO_VIRT_ADDR / LARGE_PAGE_SIZE) as usize] =
        table_addr | (PageFlags::USER | PageFlags::READ_WRITE | PageFlags::PRESENT).bits();
    flush_directory(&dir);

    USER_VIDEO_VIRT_ADDR
}

/// Remove the user video slot from the directory.
pub fn unmap_video_mem_user() {
    let mut dir = PAGE_DIRECTORY.lock_irqsave();
    dir.0[(USER_VIDEO_VIRT_ADDR / LARGE_PAGE_SIZE) as usize] = 0;
    flush_directory(&dir);
}

/// Whether the directory slot covering `virt` is present. Diagnostic and
/// test hook.
pub fn is_mapped(virt: u32) -> bool {
    let dir = PAGE_DIRECTORY.lock_irqsave();
    dir.0[(virt / LARGE_PAGE_SIZE) as usize] & PageFlags::PRESENT.bits() != 0
}

/// Raw directory entry covering `virt`. Test hook.
pub fn directory_entry(virt: u32) -> u32 {
    let dir = PAGE_DIRECTORY.lock_irqsave();
    dir.0[(virt / LARGE_PAGE_SIZE) as usize]
}

/// Build the boot page directory:
///
/// * slot 0 points at the 4 KiB video page table (only the VGA window is
///   present, cache-disabled),
/// * slot 1 is the global 4 MiB kernel page,
/// * the kernel heap is identity-mapped,
/// * everything else is absent and owned by the frame allocator.
pub fn init() {
    {
        let mut table = VIDEO_PAGE_TABLE.lock_irqsave();
        for i in 0..PAGE_TABLE_ENTRIES {
            let addr = (i as u32) * NORMAL_PAGE_SIZE;
            table.0[i] = if (VIDEO_MEM_ADDR..VIDEO_MEM_ADDR + VIDEO_MEM_SIZE).contains(&addr) {
                addr | (PageFlags::READ_WRITE | PageFlags::PRESENT).bits()
            } else {
                0
            };
        }
    }

    {
        let mut dir = PAGE_DIRECTORY.lock_irqsave();
        let table_addr = VIDEO_PAGE_TABLE.lock_irqsave().0.as_ptr() as u32;
        dir.0[0] = table_addr
            | (PageFlags::CACHE_DISABLE | PageFlags::READ_WRITE | PageFlags::PRESENT).bits();
        dir.0[1] = super::KERNEL_START_ADDR
            | (PageFlags::GLOBAL
                | PageFlags::PAGE_SIZE_4M
                | PageFlags::READ_WRITE
                | PageFlags::PRESENT)
                .bits();
        for slot in dir.0.iter_mut().skip(2) {
            *slot = 0;
        }
    }

    identity_map_containing_region(
        super::KERNEL_HEAP_START,
        super::KERNEL_HEAP_SIZE - 1,
        PageFlags::GLOBAL | PageFlags::READ_WRITE,
    )
    .expect("kernel heap region collided with an existing mapping");

    frame_allocator::init();

    enable_hardware_paging();
}

/// Load CR3 and switch on PSE + paging.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn enable_hardware_paging() {
    let dir = PAGE_DIRECTORY.lock_irqsave();
    let addr = dir.0.as_ptr() as u32;
    // SAFETY: the directory maps the kernel image and video memory before
    // paging is enabled, so execution continues seamlessly once CR0.PG is
    // set. PSE must be on first so the 4 MiB entries are honored.
    unsafe {
        use x86::controlregs::{cr0, cr0_write, cr4, cr4_write, Cr0, Cr4};
        x86::controlregs::cr3_write(addr as u64);
        cr4_write(cr4() | Cr4::CR4_ENABLE_PSE);
        cr0_write(cr0() | Cr0::CR0_ENABLE_PAGING);
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn enable_hardware_paging() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::KERNEL_HEAP_END;

    // Paging state is global; tests share it and use distinct high slots.

    #[test]
    fn test_map_then_unmap_region() {
        let virt = 900 * LARGE_PAGE_SIZE;
        map_region(
            5 * LARGE_PAGE_SIZE,
            virt,
            1,
            PageFlags::READ_WRITE | PageFlags::USER,
        )
        .unwrap();
        assert!(is_mapped(virt));

        let pde = directory_entry(virt);
        assert_eq!(pde & 0xFFC0_0000, 5 * LARGE_PAGE_SIZE);
        assert!(pde & PageFlags::PAGE_SIZE_4M.bits() != 0);
        assert!(pde & PageFlags::USER.bits() != 0);

        unmap_region(virt, 1);
        assert!(!is_mapped(virt));
    }

    #[test]
    fn test_double_map_rejected() {
        let virt = 901 * LARGE_PAGE_SIZE;
        map_region(6 * LARGE_PAGE_SIZE, virt, 1, PageFlags::READ_WRITE).unwrap();
        let second = map_region(7 * LARGE_PAGE_SIZE, virt, 1, PageFlags::READ_WRITE);
        assert_eq!(second, Err(KernelError::AlreadyMapped { virt_index: 901 }));
        unmap_region(virt, 1);
    }

    #[test]
    fn test_misaligned_containing_region_rejected() {
        let result = map_containing_region(
            0x1000,
            902 * LARGE_PAGE_SIZE + 0x2000,
            0x100,
            PageFlags::READ_WRITE,
        );
        assert!(matches!(result, Err(KernelError::MisalignedRegion { .. })));
    }

    #[test]
    fn test_containing_region_rounds_outward() {
        // A region straddling a boundary needs two directory entries.
        let virt = 903 * LARGE_PAGE_SIZE + LARGE_PAGE_SIZE / 2;
        let phys = 8 * LARGE_PAGE_SIZE + LARGE_PAGE_SIZE / 2;
        map_containing_region(phys, virt, LARGE_PAGE_SIZE, PageFlags::READ_WRITE).unwrap();
        assert!(is_mapped(903 * LARGE_PAGE_SIZE));
        assert!(is_mapped(904 * LARGE_PAGE_SIZE));
        unmap_containing_region(virt, LARGE_PAGE_SIZE);
        assert!(!is_mapped(903 * LARGE_PAGE_SIZE));
        assert!(!is_mapped(904 * LARGE_PAGE_SIZE));
    }

    #[test]
    fn test_user_video_slot_roundtrip() {
        let addr = map_video_mem_user(KERNEL_HEAP_END, 3 * NORMAL_PAGE_SIZE);
        assert_eq!(addr, USER_VIDEO_VIRT_ADDR);
        assert!(is_mapped(USER_VIDEO_VIRT_ADDR));

        unmap_video_mem_user();
        assert!(!is_mapped(USER_VIDEO_VIRT_ADDR));
    }
}
