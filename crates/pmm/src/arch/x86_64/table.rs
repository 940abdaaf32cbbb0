//! Page table structure for x86_64 architecture.

use x86_64::{
    PhysAddr, VirtAddr,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::PhysFrame,
};

use crate::{PhysicalAddress, VirtualAddress};

use super::entry::PageEntry;

/// Number of entries in an x86_64 page table.
pub const ENTRY_COUNT: usize = 512;

/// One level of the x86_64 page table hierarchy (PML4, PDPT, PD or PT).
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRY_COUNT],
}

impl PageTable {
    /// Creates a table with every entry cleared.
    pub const fn new() -> Self {
        Self {
            entries: [PageEntry::empty(); ENTRY_COUNT],
        }
    }

    /// Returns the entry at the given index.
    pub fn entry(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at the given index.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        &mut self.entries[index]
    }

    /// Iterates over all entries.
    pub fn entries(&self) -> impl Iterator<Item = &PageEntry> {
        self.entries.iter()
    }
}

/// Loads the table rooted at `root` into CR3.
///
/// # Safety
/// The caller must ensure:
/// - The page table correctly maps all memory that will be accessed
/// - The kernel is properly mapped
/// - The page table itself is mapped
pub unsafe fn activate(root: PhysicalAddress) {
    let frame = PhysFrame::containing_address(PhysAddr::new(root.as_usize() as u64));
    // SAFETY: Caller must ensure the page table is valid
    unsafe {
        Cr3::write(frame, Cr3Flags::empty());
    }
}

/// Returns the root table currently loaded in CR3.
pub fn active_root() -> Option<PhysicalAddress> {
    let (frame, _) = Cr3::read();
    Some(PhysicalAddress::new(frame.start_address().as_u64() as usize))
}

/// Invalidates the TLB entry for `virt` on the executing core.
pub fn flush(virt: VirtualAddress) {
    x86_64::instructions::tlb::flush(VirtAddr::new(virt.as_usize() as u64));
}
