//! User pointer validation.
//!
//! Every pointer or string argument a syscall receives must lie entirely
//! inside one of the calling process's large-page mappings. Validation
//! never mutates state; invalid input is reported before any side effect.

use crate::mm::LARGE_PAGE_SIZE;

use super::pcb::Pcb;

/// Whether `[ptr, ptr + size)` lies entirely inside one of the process's
/// 4 MiB mappings.
pub fn is_userspace_region_valid(pcb: &Pcb, ptr: u32, size: u32) -> bool {
    if size == 0 {
        return true;
    }

    let end = match ptr.checked_add(size) {
        Some(end) => end,
        None => return false,
    };

    pcb.large_page_mappings.iter().any(|mapping| {
        let start = mapping.virt_addr();
        ptr >= start && end <= start + LARGE_PAGE_SIZE
    })
}

/// Measure a null-terminated user string and validate it (terminator
/// included) against the process's mappings. Returns the length without
/// the terminator.
///
/// # Safety
///
/// The process's pages must currently be mapped; each byte is validated
/// before it is dereferenced.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub unsafe fn userspace_string_len(pcb: &Pcb, ptr: u32) -> Option<u32> {
    let mut len = 0u32;
    loop {
        let addr = ptr.checked_add(len)?;
        if !is_userspace_region_valid(pcb, addr, 1) {
            return None;
        }
        // SAFETY: the byte was just validated against a present mapping.
        if unsafe { *(addr as *const u8) } == 0 {
            return Some(len);
        }
        len += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PageMapping;
    use crate::process::EXECUTABLE_VIRT_ADDR;

    fn pcb_with_image_page() -> Pcb {
        let mut pcb = Pcb::unused();
        pcb.large_page_mappings
            .push(PageMapping::new(EXECUTABLE_VIRT_ADDR / LARGE_PAGE_SIZE, 4));
        pcb
    }

    #[test]
    fn test_region_inside_mapping() {
        let pcb = pcb_with_image_page();
        assert!(is_userspace_region_valid(
            &pcb,
            EXECUTABLE_VIRT_ADDR + 0x1000,
            256
        ));
    }

    #[test]
    fn test_region_straddling_end_rejected() {
        let pcb = pcb_with_image_page();
        assert!(!is_userspace_region_valid(
            &pcb,
            EXECUTABLE_VIRT_ADDR + LARGE_PAGE_SIZE - 16,
            32
        ));
    }

    #[test]
    fn test_region_outside_rejected() {
        let pcb = pcb_with_image_page();
        assert!(!is_userspace_region_valid(&pcb, 0x1000, 4));
        assert!(!is_userspace_region_valid(&pcb, 0xFFFF_FFF0, 32));
    }

    #[test]
    fn test_region_in_second_mapping() {
        let mut pcb = pcb_with_image_page();
        pcb.large_page_mappings.push(PageMapping::new(48, 5));
        assert!(is_userspace_region_valid(&pcb, 48 * LARGE_PAGE_SIZE, 64));
    }

    #[test]
    fn test_whole_page_is_valid() {
        let pcb = pcb_with_image_page();
        assert!(is_userspace_region_valid(
            &pcb,
            EXECUTABLE_VIRT_ADDR,
            LARGE_PAGE_SIZE
        ));
    }
}
