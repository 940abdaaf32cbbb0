//! Page table entry for x86_64 architecture.

use crate::PhysicalAddress;

pub use x86_64::structures::paging::PageTableFlags as PageFlags;

/// A single page table entry for x86_64.
///
/// On x86_64, page table entries are 64-bit values containing a physical address
/// and various flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    /// Bits 12-51 contain the physical address (assuming 52-bit physical addresses).
    const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// Flag bits mask (bits 0-11 and 52-63).
    const FLAGS_MASK: u64 = !Self::ADDRESS_MASK;

    /// Returns an entry that maps nothing.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates a new page table entry.
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.is_page_aligned(),
            "physical address must be page-aligned"
        );
        let addr_bits = address.as_usize() as u64 & Self::ADDRESS_MASK;
        Self(addr_bits | (flags.bits() & Self::FLAGS_MASK))
    }

    /// Returns the physical address stored in this entry, or None if not present.
    pub fn address(self) -> Option<PhysicalAddress> {
        if self.is_present() {
            Some(PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize))
        } else {
            None
        }
    }

    /// Returns the flags for this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & Self::FLAGS_MASK)
    }

    /// Sets the flags for this entry, preserving the address.
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & Self::ADDRESS_MASK) | (flags.bits() & Self::FLAGS_MASK);
    }

    /// Returns whether this entry is present (valid).
    pub fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    /// Clears this entry.
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}
