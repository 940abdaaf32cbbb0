//! Page table entry for software emulation.

use crate::PhysicalAddress;

bitflags::bitflags! {
    /// Page table entry flags for the scale model.
    ///
    /// Names match `x86_64::structures::paging::PageTableFlags` so the page directory
    /// can be written once for both backends.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER_ACCESSIBLE = 1 << 2;
        const NO_EXECUTE = 1 << 3;
    }
}

/// A single page table entry for software emulation.
///
/// The entry format:
/// - Bits 0-3: Flags
/// - Bits 12-23: Physical frame address
/// - Bits 24-63: Reserved (zero)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    const ADDRESS_MASK: u64 = 0x00FF_F000;
    const FLAGS_MASK: u64 = 0xF;

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_address_and_flags() {
        let entry = PageEntry::new(
            PhysicalAddress::new(0x12_3000),
            PageFlags::PRESENT | PageFlags::WRITABLE,
        );
        assert_eq!(entry.address(), Some(PhysicalAddress::new(0x12_3000)));
        assert!(entry.flags().contains(PageFlags::WRITABLE));
        assert!(!entry.flags().contains(PageFlags::NO_EXECUTE));
    }

    #[test]
    fn not_present_has_no_address() {
        let entry = PageEntry::new(PhysicalAddress::new(0x1000), PageFlags::WRITABLE);
        assert_eq!(entry.address(), None);
    }

    #[test]
    fn set_flags_keeps_address() {
        let mut entry = PageEntry::new(PhysicalAddress::new(0x4000), PageFlags::PRESENT);
        entry.set_flags(PageFlags::PRESENT | PageFlags::NO_EXECUTE);
        assert_eq!(entry.address(), Some(PhysicalAddress::new(0x4000)));
        assert!(entry.flags().contains(PageFlags::NO_EXECUTE));
    }
}
