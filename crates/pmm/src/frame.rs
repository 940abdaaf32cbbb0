//! Physical frame allocation interface.
//!
//! Frame allocation policy lives outside the virtual memory system. Anything that can
//! hand out page-sized, page-aligned physical frames implements [`FrameAllocator`].

use crate::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

/// A source of physical frames.
///
/// Implementations must be internally synchronized: the fault path may call
/// `allocate_frame` concurrently from several cores.
pub trait FrameAllocator: Send + Sync {
    /// Allocates one frame. Returns None when physical memory is exhausted.
    ///
    /// The contents of the returned frame are unspecified.
    fn allocate_frame(&self) -> Option<PhysicalAddress>;

    /// Returns a frame previously obtained from `allocate_frame`.
    fn deallocate_frame(&self, frame: PhysicalAddress);
}

/// Fills a frame with zeroes through the direct map.
pub fn zero_frame(frame: PhysicalAddress) {
    debug_assert!(frame.is_page_aligned(), "frame must be page-aligned");
    let ptr: *mut u8 = VirtualAddress::direct_mapped(frame).as_mut_ptr();
    // SAFETY: every frame is reachable through the direct map and is PAGE_SIZE bytes long.
    unsafe { ptr.write_bytes(0, PAGE_SIZE) };
}

/// Copies the contents of `src` into `dst` through the direct map.
pub fn copy_frame(src: PhysicalAddress, dst: PhysicalAddress) {
    debug_assert!(src != dst, "cannot copy a frame onto itself");
    let from: *mut u8 = VirtualAddress::direct_mapped(src).as_mut_ptr();
    let to: *mut u8 = VirtualAddress::direct_mapped(dst).as_mut_ptr();
    // SAFETY: distinct frames never overlap.
    unsafe { core::ptr::copy_nonoverlapping(from.cast_const(), to, PAGE_SIZE) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AddressTranslator;
    use crate::arch::TEST_MEMORY_SIZE;

    fn frames() -> &'static dyn FrameAllocator {
        AddressTranslator::ensure_emulated(TEST_MEMORY_SIZE)
            .emulated_memory()
            .unwrap()
    }

    fn byte_at(frame: PhysicalAddress, offset: usize) -> *mut u8 {
        let base: *mut u8 = VirtualAddress::direct_mapped(frame).as_mut_ptr();
        unsafe { base.add(offset) }
    }

    #[test]
    fn zero_then_copy() {
        let frames = frames();
        let src = frames.allocate_frame().unwrap();
        let dst = frames.allocate_frame().unwrap();

        zero_frame(src);
        unsafe { byte_at(src, 7).write(0xAB) };
        copy_frame(src, dst);

        assert_eq!(unsafe { byte_at(dst, 7).read() }, 0xAB);
        assert_eq!(unsafe { byte_at(dst, 8).read() }, 0);

        frames.deallocate_frame(src);
        frames.deallocate_frame(dst);
    }
}
