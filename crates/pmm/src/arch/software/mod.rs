//! Software scale model of the x86_64 paging hardware.
//!
//! This backend runs on any host and is used for tests and development:
//! - 4 KiB pages (same as x86_64)
//! - 3 levels of page tables (vs 4 on x86_64)
//! - 4-bit indexes (16 entries per table, vs 512 on x86_64)
//! - 24-bit virtual and physical addresses
//!
//! Physical memory is a host buffer carved into frames. Page tables and data frames are
//! both allocated from it, so the page directory walker behaves as it would on hardware.

mod entry;
mod table;

use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::alloc::{Layout, alloc_zeroed, dealloc};

pub use entry::{PageEntry, PageFlags};
pub use table::{ENTRY_COUNT, PageTable, activate, active_root, flush};

use crate::{FrameAllocator, PhysicalAddress};

/// Maximum number of bits in a physical address.
pub const MAX_PHYSICAL_BITS: usize = 24;

/// Maximum number of bits in a virtual address.
pub const MAX_VIRTUAL_BITS: usize = 24;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Number of page table levels (levels 2, 1, 0).
pub const PAGE_TABLE_LEVELS: usize = 3;

/// First address of the default user address space.
pub const USER_SPACE_START: usize = 0x0000_1000;
/// End (exclusive) of the default user address space.
pub const USER_SPACE_END: usize = 0x0080_0000;
/// First address of the kernel address space.
pub const KERNEL_SPACE_START: usize = 0x0080_0000;
/// End (exclusive) of the kernel address space.
pub const KERNEL_SPACE_END: usize = 0x00FF_F000;

/// Emulated memory size used by this crate's tests.
#[cfg(test)]
pub const TEST_MEMORY_SIZE: usize = 4 * 1024 * 1024;

/// Returns the page table index for a virtual address at the given level.
///
/// - Level 0: bits 12-15
/// - Level 1: bits 16-19
/// - Level 2: bits 20-23
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(
        level < PAGE_TABLE_LEVELS,
        "level out of range for software emulation (0-2)"
    );
    (address >> (12 + level * 4)) & (ENTRY_COUNT - 1)
}

/// Validates a physical address.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1 << MAX_PHYSICAL_BITS)
}

/// Validates a virtual address.
///
/// The scale model has no upper half, so every address below 2^24 is canonical.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr < (1 << MAX_VIRTUAL_BITS)
}

/// Emulated physical memory.
///
/// A page-aligned host buffer handed out one frame at a time. Frame 0 is never handed
/// out so that a zero physical address always means "nothing".
pub struct EmulatedMemory {
    base: NonNull<u8>,
    size: usize,
    /// Next never-used frame (bump pointer).
    next_frame: AtomicUsize,
    /// Frames returned by `deallocate_frame`, reused before bumping.
    free_frames: spin::Mutex<Vec<PhysicalAddress>>,
    allocated: AtomicUsize,
}

// SAFETY: the buffer is only reached through raw pointers handed out per frame; the
// allocator state itself is atomic or lock-protected.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a new emulated memory region of the specified size.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a whole number of pages or exceeds the physical width.
    pub fn new(size: usize) -> Self {
        assert!(
            size % PAGE_SIZE == 0 && size > 0,
            "emulated memory must be a whole number of pages"
        );
        assert!(
            size <= (1 << MAX_PHYSICAL_BITS),
            "emulated memory exceeds physical address width"
        );

        let layout = Self::layout(size);
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw).expect("out of host memory for emulation");

        Self {
            base,
            size,
            next_frame: AtomicUsize::new(PAGE_SIZE),
            free_frames: spin::Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
        }
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, PAGE_SIZE).expect("invalid emulated memory layout")
    }

    /// Translates a physical address to a pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size, "physical address out of bounds");
        // SAFETY: bounds checked above.
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Translates a pointer into the buffer back to a physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        assert!(
            addr >= base && addr < base + self.size,
            "pointer not within emulated memory"
        );
        addr - base
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the number of frames currently handed out.
    pub fn allocated_frames(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }
}

impl FrameAllocator for EmulatedMemory {
    fn allocate_frame(&self) -> Option<PhysicalAddress> {
        if let Some(frame) = self.free_frames.lock().pop() {
            self.allocated.fetch_add(1, Ordering::AcqRel);
            return Some(frame);
        }

        loop {
            let current = self.next_frame.load(Ordering::Relaxed);
            let end = current + PAGE_SIZE;
            if end > self.size {
                return None;
            }
            if self
                .next_frame
                .compare_exchange(current, end, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                self.allocated.fetch_add(1, Ordering::AcqRel);
                return Some(PhysicalAddress::new(current));
            }
        }
    }

    fn deallocate_frame(&self, frame: PhysicalAddress) {
        debug_assert!(frame.is_page_aligned(), "frame must be page-aligned");
        self.allocated.fetch_sub(1, Ordering::AcqRel);
        self.free_frames.lock().push(frame);
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), Self::layout(self.size)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_zero_is_never_handed_out() {
        let mem = EmulatedMemory::new(4 * PAGE_SIZE);
        let first = mem.allocate_frame().unwrap();
        assert_eq!(first, PhysicalAddress::new(PAGE_SIZE));
    }

    #[test]
    fn exhausts_and_recycles() {
        let mem = EmulatedMemory::new(3 * PAGE_SIZE);
        let a = mem.allocate_frame().unwrap();
        let b = mem.allocate_frame().unwrap();
        assert_eq!(mem.allocate_frame(), None);
        assert_eq!(mem.allocated_frames(), 2);

        mem.deallocate_frame(a);
        assert_eq!(mem.allocated_frames(), 1);
        assert_eq!(mem.allocate_frame(), Some(a));
        assert_ne!(a, b);
    }

    #[test]
    fn page_index_levels() {
        assert_eq!(page_index(0xAB_C000, 0), 0xC);
        assert_eq!(page_index(0xAB_C000, 1), 0xB);
        assert_eq!(page_index(0xAB_C000, 2), 0xA);
    }
}
