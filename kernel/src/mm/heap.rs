//! Kernel heap allocator.
//!
//! First-fit allocator over a fixed arena. Every block is prefixed with a
//! descriptor carrying its size (including the descriptor, 31 bits) and a
//! free bit, plus links for two doubly-linked lists: one threading every
//! block in address order and one threading just the free blocks.
//!
//! Freed blocks coalesce with their address-order neighbors. Small blocks
//! (below [`BIG_BLOCK_THRESHOLD`]) are queued at the head of the free list
//! and large ones at the tail, so small allocations drain the head without
//! fragmenting large contiguous blocks.

use core::{alloc::Layout, ptr};

use crate::sync::SpinLock;

/// Free blocks no larger than this go to the head of the free list;
/// larger ones go to the tail.
pub const BIG_BLOCK_THRESHOLD: usize = 2000;

/// Mask selecting the 31 size bits of `size_and_free`.
const SIZE_MASK: u32 = 0x7FFF_FFFF;
/// High bit of `size_and_free`: set while the block is free.
const FREE_BIT: u32 = 0x8000_0000;

/// Per-block descriptor stored immediately before the payload.
#[repr(C)]
struct BlockDesc {
    /// Low 31 bits: block size in bytes including this descriptor.
    /// Bit 31: whether the block is free.
    size_and_free: u32,
    prev: *mut BlockDesc,
    next: *mut BlockDesc,
    prev_free: *mut BlockDesc,
    next_free: *mut BlockDesc,
}

/// Size of a block descriptor in bytes.
const DESC_SIZE: usize = core::mem::size_of::<BlockDesc>();

impl BlockDesc {
    fn size(&self) -> usize {
        (self.size_and_free & SIZE_MASK) as usize
    }

    fn set_size(&mut self, size: usize) {
        self.size_and_free = (self.size_and_free & FREE_BIT) | (size as u32 & SIZE_MASK);
    }

    fn is_free(&self) -> bool {
        self.size_and_free & FREE_BIT != 0
    }

    fn set_free(&mut self, free: bool) {
        if free {
            self.size_and_free |= FREE_BIT;
        } else {
            self.size_and_free &= SIZE_MASK;
        }
    }
}

/// First-fit heap over one contiguous arena.
pub struct KernelHeap {
    arena: *mut u8,
    arena_size: usize,
    head: *mut BlockDesc,
    free_head: *mut BlockDesc,
    free_tail: *mut BlockDesc,
}

// SAFETY: the raw pointers all point into the single arena owned by this
// heap; moving the struct between contexts does not alias them.
unsafe impl Send for KernelHeap {}

impl KernelHeap {
    /// Create a heap over `arena_size` bytes starting at `arena`.
    ///
    /// # Safety
    ///
    /// The memory range must be valid for reads and writes for the life of
    /// the heap and used by nothing else.
    pub unsafe fn new(arena: *mut u8, arena_size: usize) -> Self {
        debug_assert!(arena_size > DESC_SIZE);

        // SAFETY: caller guarantees the range is exclusively ours.
        unsafe { ptr::write_bytes(arena, 0, arena_size) };

        let head = arena as *mut BlockDesc;
        // SAFETY: the arena is large enough to hold one descriptor and is
        // writable per the caller contract.
        unsafe {
            (*head).size_and_free = FREE_BIT | (arena_size as u32 & SIZE_MASK);
            (*head).prev = ptr::null_mut();
            (*head).next = ptr::null_mut();
            (*head).prev_free = ptr::null_mut();
            (*head).next_free = ptr::null_mut();
        }

        Self {
            arena,
            arena_size,
            head,
            free_head: head,
            free_tail: head,
        }
    }

    /// Unlink `block` from the free list.
    ///
    /// # Safety
    ///
    /// `block` must be a live descriptor currently on the free list.
    unsafe fn remove_free_element(&mut self, block: *mut BlockDesc) {
        // SAFETY: per the caller contract the block and its free-list
        // neighbors are live descriptors inside the arena.
        unsafe {
            if self.free_head == block {
                self.free_head = (*block).next_free;
            } else {
                (*(*block).prev_free).next_free = (*block).next_free;
            }

            if self.free_tail == block {
                self.free_tail = (*block).prev_free;
            } else {
                (*(*block).next_free).prev_free = (*block).prev_free;
            }
        }
    }

    /// Queue `block` onto the free list: head if small, tail if big.
    ///
    /// # Safety
    ///
    /// `block` must be a live descriptor not currently on the free list.
    unsafe fn insert_free_element(&mut self, block: *mut BlockDesc) {
        // SAFETY: caller contract; list heads/tails are maintained
        // invariants of this heap.
        unsafe {
            if (*block).size() > BIG_BLOCK_THRESHOLD {
                (*block).next_free = ptr::null_mut();
                (*block).prev_free = self.free_tail;
                if self.free_tail.is_null() {
                    self.free_head = block;
                } else {
                    (*self.free_tail).next_free = block;
                }
                self.free_tail = block;
            } else {
                (*block).prev_free = ptr::null_mut();
                (*block).next_free = self.free_head;
                if self.free_head.is_null() {
                    self.free_tail = block;
                } else {
                    (*self.free_head).prev_free = block;
                }
                self.free_head = block;
            }
        }
    }

    /// Split `block` so its payload is exactly `size` bytes; the remainder
    /// becomes a new free block.
    ///
    /// Returns the new second block, or null when the block is not free or
    /// the remainder could not hold a descriptor.
    ///
    /// # Safety
    ///
    /// `block` must be a live descriptor inside the arena.
    unsafe fn split_free_block(&mut self, block: *mut BlockDesc, size: usize) -> *mut BlockDesc {
        // SAFETY: caller contract; arithmetic stays inside the block, which
        // is inside the arena.
        unsafe {
            if size + 2 * DESC_SIZE > (*block).size() {
                return ptr::null_mut();
            }
            if !(*block).is_free() {
                return ptr::null_mut();
            }

            let total_size = (*block).size();
            (*block).set_size(size + DESC_SIZE);

            let new_block = (block as *mut u8).add(size + DESC_SIZE) as *mut BlockDesc;
            (*new_block).size_and_free = 0;
            (*new_block).set_free(true);
            (*new_block).set_size(total_size - size - DESC_SIZE);

            // Insert into the address-ordered list right after `block`.
            (*new_block).next = (*block).next;
            (*new_block).prev = block;
            (*block).next = new_block;
            if !(*new_block).next.is_null() {
                (*(*new_block).next).prev = new_block;
            }

            self.insert_free_element(new_block);

            new_block
        }
    }

    /// Allocate `size` bytes with no particular alignment.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 || size > SIZE_MASK as usize {
            return ptr::null_mut();
        }

        let mut cur = self.free_head;
        while !cur.is_null() {
            // SAFETY: free-list members are live descriptors in the arena.
            unsafe {
                let next = (*cur).next_free;
                if (*cur).size() == size + DESC_SIZE
                    || !self.split_free_block(cur, size).is_null()
                {
                    (*cur).set_free(false);
                    self.remove_free_element(cur);
                    return (cur as *mut u8).add(DESC_SIZE);
                }
                cur = next;
            }
        }

        ptr::null_mut()
    }

    /// Allocate `size` bytes whose address is a multiple of `alignment`.
    ///
    /// Either uses a block whose payload already starts aligned, or carves
    /// an aligned interior region out of a larger block, splitting it into
    /// up to three pieces. Every piece created must hold its descriptor.
    pub fn alloc_aligned(&mut self, size: usize, alignment: usize) -> *mut u8 {
        if size == 0 || size > SIZE_MASK as usize || alignment == 0 {
            return ptr::null_mut();
        }

        let mut cur = self.free_head;
        while !cur.is_null() {
            // SAFETY: free-list members are live descriptors in the arena.
            unsafe {
                let next = (*cur).next_free;
                // [start, end): the payload bounds of this block.
                let start = cur as usize + DESC_SIZE;
                let end = cur as usize + (*cur).size();

                if start % alignment == 0 {
                    if (*cur).size() == size + DESC_SIZE
                        || !self.split_free_block(cur, size).is_null()
                    {
                        (*cur).set_free(false);
                        self.remove_free_element(cur);
                        return (cur as *mut u8).add(DESC_SIZE);
                    }
                } else if start / alignment != end / alignment {
                    // The first aligned address inside the payload.
                    let actual_start = alignment * (start / alignment + 1);

                    // The gap before actual_start must hold the middle
                    // block's descriptor.
                    if actual_start - start < DESC_SIZE {
                        cur = next;
                        continue;
                    }
                    // Either the first two pieces exactly fill the block,
                    // or there is room for a third piece with a descriptor.
                    let exact = DESC_SIZE + (actual_start - start) + size == (*cur).size();
                    let with_third = 2 * DESC_SIZE + (actual_start - start) + size <= (*cur).size();
                    if !(exact || with_third) {
                        cur = next;
                        continue;
                    }

                    let second = self.split_free_block(cur, actual_start - start - DESC_SIZE);
                    debug_assert!(!second.is_null());

                    if !exact {
                        self.split_free_block(second, size);
                    }

                    (*second).set_free(false);
                    self.remove_free_element(second);
                    return (second as *mut u8).add(DESC_SIZE);
                }

                cur = next;
            }
        }

        ptr::null_mut()
    }

    /// Release a pointer previously returned by [`alloc`](Self::alloc) or
    /// [`alloc_aligned`](Self::alloc_aligned). Null is ignored. Double
    /// frees are not allowed.
    pub fn free(&mut self, ptr_in: *mut u8) {
        if ptr_in.is_null() {
            return;
        }

        // SAFETY: a valid allocation pointer sits exactly one descriptor
        // past its BlockDesc; all list neighbors are live descriptors.
        unsafe {
            let cur = ptr_in.sub(DESC_SIZE) as *mut BlockDesc;
            debug_assert!(!(*cur).is_free(), "double free");
            (*cur).set_free(true);
            self.insert_free_element(cur);

            // Walk backwards to the first block of this free run.
            let mut first = cur;
            let mut walk = cur;
            while !walk.is_null() && (*walk).is_free() {
                first = walk;
                walk = (*walk).prev;
            }

            // Fold every following contiguous free block into `first`.
            let mut block = (*first).next;
            while !block.is_null() && (*block).is_free() {
                let following = (*block).next;

                (*first).next = following;
                if !following.is_null() {
                    (*following).prev = first;
                }
                (*first).set_size((*first).size() + (*block).size());

                self.remove_free_element(block);
                block = following;
            }
        }
    }

    /// Total bytes in free blocks. Diagnostic and test hook.
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut cur = self.free_head;
        while !cur.is_null() {
            // SAFETY: free-list members are live descriptors.
            unsafe {
                total += (*cur).size();
                cur = (*cur).next_free;
            }
        }
        total
    }

    /// Verify that the address-ordered list tiles the arena exactly.
    /// Diagnostic and test hook.
    pub fn verify_no_overlaps(&self) -> bool {
        let mut expected = self.arena as usize;
        let mut cur = self.head;
        while !cur.is_null() {
            if cur as usize != expected {
                return false;
            }
            // SAFETY: list members are live descriptors.
            unsafe {
                expected += (*cur).size();
                cur = (*cur).next;
            }
        }
        expected == self.arena as usize + self.arena_size
    }
}

/// The global kernel heap behind its lock. The lock is innermost in the
/// kernel lock order.
pub struct LockedKernelHeap {
    inner: SpinLock<Option<KernelHeap>>,
}

impl LockedKernelHeap {
    pub const fn empty() -> Self {
        Self {
            inner: SpinLock::new(None),
        }
    }

    /// Install the arena. Called once during boot, before the first
    /// allocation.
    ///
    /// # Safety
    ///
    /// Same contract as [`KernelHeap::new`].
    pub unsafe fn init(&self, arena: *mut u8, arena_size: usize) {
        // SAFETY: forwarded caller contract.
        *self.inner.lock_irqsave() = Some(unsafe { KernelHeap::new(arena, arena_size) });
    }
}

// SAFETY: alloc returns unique, non-overlapping blocks (first-fit over a
// lock-protected free list); dealloc returns them. Layout alignment is
// honored by alloc_aligned.
unsafe impl core::alloc::GlobalAlloc for LockedKernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = self.inner.lock_irqsave();
        match heap.as_mut() {
            Some(heap) => heap.alloc_aligned(layout.size().max(1), layout.align().max(4)),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr_in: *mut u8, _layout: Layout) {
        let mut heap = self.inner.lock_irqsave();
        if let Some(heap) = heap.as_mut() {
            heap.free(ptr_in);
        }
    }
}
