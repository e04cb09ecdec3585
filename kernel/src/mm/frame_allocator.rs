//! Physical frame allocator.
//!
//! Tracks every 4 MiB frame of physical memory with a descriptor
//! `{used, next_free}`; the unused descriptors thread an intrusive free
//! list by index, so allocation and release are O(1) pops and pushes.

use crate::sync::SpinLock;

use super::{KERNEL_HEAP_END, LARGE_PAGE_SIZE, NUM_LARGE_FRAMES};

/// Index of a 4 MiB physical frame (frame 2 covers 8 MiB..12 MiB).
pub type FrameIndex = u32;

/// Sentinel terminating the free list.
const FREE_LIST_END: i32 = -1;

/// Descriptor for one 4 MiB frame of physical memory.
#[derive(Debug, Clone, Copy)]
struct FrameDesc {
    /// Whether the frame is currently allocated.
    used: bool,
    /// If unused, the index of the next unused frame (-1 terminates).
    /// Meaningless while the frame is in use.
    next_free: i32,
}

/// Allocator over all managed 4 MiB frames.
pub struct FrameAllocator {
    frames: [FrameDesc; NUM_LARGE_FRAMES],
    /// Head of the linked list of unused frames, -1 when exhausted.
    free_head: i32,
}

impl FrameAllocator {
    /// An allocator with every frame marked used; [`init`](Self::init)
    /// builds the real free list.
    pub const fn new() -> Self {
        Self {
            frames: [FrameDesc {
                used: true,
                next_free: FREE_LIST_END,
            }; NUM_LARGE_FRAMES],
            free_head: FREE_LIST_END,
        }
    }

    /// Reserve the boot-time frames and chain everything after
    /// `first_free` into the free list.
    ///
    /// Frames below `first_free` (video/low memory, the kernel image, the
    /// kernel heap) stay permanently used.
    pub fn init(&mut self, first_free: FrameIndex) {
        for i in 0..first_free as usize {
            self.frames[i].used = true;
        }

        for i in first_free as usize..NUM_LARGE_FRAMES {
            self.frames[i].used = false;
            self.frames[i].next_free = if i == NUM_LARGE_FRAMES - 1 {
                FREE_LIST_END
            } else {
                (i + 1) as i32
            };
        }

        self.free_head = if (first_free as usize) < NUM_LARGE_FRAMES {
            first_free as i32
        } else {
            FREE_LIST_END
        };
    }

    /// Pop the head of the free list, marking that frame used.
    pub fn get_open_page(&mut self) -> Option<FrameIndex> {
        if self.free_head < 0 {
            return None;
        }

        let index = self.free_head as usize;
        self.frames[index].used = true;
        self.free_head = self.frames[index].next_free;

        Some(index as FrameIndex)
    }

    /// Return a frame to the head of the free list.
    ///
    /// Out-of-range indices are ignored.
    pub fn free_page(&mut self, index: FrameIndex) {
        if index as usize >= NUM_LARGE_FRAMES {
            return;
        }

        self.frames[index as usize].used = false;
        self.frames[index as usize].next_free = self.free_head;
        self.free_head = index as i32;
    }

    /// Whether the given frame is currently allocated.
    pub fn is_used(&self, index: FrameIndex) -> bool {
        self.frames
            .get(index as usize)
            .map(|f| f.used)
            .unwrap_or(false)
    }

    /// Number of frames currently on the free list.
    pub fn free_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.free_head;
        while cur >= 0 {
            count += 1;
            cur = self.frames[cur as usize].next_free;
        }
        count
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global frame allocator.
static FRAMES: SpinLock<FrameAllocator> = SpinLock::new(FrameAllocator::new());

/// First frame eligible for allocation: everything past the kernel heap.
pub fn first_allocatable_frame() -> FrameIndex {
    KERNEL_HEAP_END / LARGE_PAGE_SIZE
}

/// Build the boot-time free list. Called once from paging init.
pub fn init() {
    FRAMES.lock_irqsave().init(first_allocatable_frame());
}

/// Allocate a free 4 MiB frame.
pub fn get_open_page() -> Option<FrameIndex> {
    FRAMES.lock_irqsave().get_open_page()
}

/// Release a 4 MiB frame back to the allocator.
pub fn free_page(index: FrameIndex) {
    FRAMES.lock_irqsave().free_page(index);
}

/// Number of frames currently available.
pub fn free_frame_count() -> usize {
    FRAMES.lock_irqsave().free_count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_reserves_boot_frames() {
        let mut alloc = FrameAllocator::new();
        alloc.init(4);

        assert!(alloc.is_used(0));
        assert!(alloc.is_used(1));
        assert!(alloc.is_used(2));
        assert!(alloc.is_used(3));
        assert!(!alloc.is_used(4));
        assert_eq!(alloc.free_count(), NUM_LARGE_FRAMES - 4);
    }

    #[test]
    fn test_alloc_pops_in_order() {
        let mut alloc = FrameAllocator::new();
        alloc.init(4);

        assert_eq!(alloc.get_open_page(), Some(4));
        assert_eq!(alloc.get_open_page(), Some(5));
        assert!(alloc.is_used(4));
        assert!(alloc.is_used(5));
    }

    #[test]
    fn test_free_pushes_to_head() {
        let mut alloc = FrameAllocator::new();
        alloc.init(4);

        let a = alloc.get_open_page().unwrap();
        let _b = alloc.get_open_page().unwrap();
        alloc.free_page(a);

        // The most recently freed frame is reused first.
        assert_eq!(alloc.get_open_page(), Some(a));
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut alloc = FrameAllocator::new();
        alloc.init(NUM_LARGE_FRAMES as u32 - 1);

        assert_eq!(alloc.get_open_page(), Some(NUM_LARGE_FRAMES as u32 - 1));
        assert_eq!(alloc.get_open_page(), None);
    }

    #[test]
    fn test_out_of_range_free_ignored() {
        let mut alloc = FrameAllocator::new();
        alloc.init(4);
        let before = alloc.free_count();
        alloc.free_page(NUM_LARGE_FRAMES as u32 + 10);
        assert_eq!(alloc.free_count(), before);
    }

    #[test]
    fn test_frame_allocated_to_at_most_one_owner() {
        let mut alloc = FrameAllocator::new();
        alloc.init(4);

        let mut seen = std::collections::HashSet::new();
        while let Some(frame) = alloc.get_open_page() {
            assert!(seen.insert(frame), "frame {} handed out twice", frame);
        }
    }
}
