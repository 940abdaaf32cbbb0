//! Page table structure for software emulation.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{PhysicalAddress, VirtualAddress};

use super::entry::PageEntry;

/// Number of entries in a software-emulated page table.
pub const ENTRY_COUNT: usize = 16;

/// A single level of the page table hierarchy.
///
/// Tables live in emulated physical memory and are referenced by physical address
/// from their parent entry, exactly like hardware tables.
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

/// Root table most recently activated on this (emulated) processor. Zero means none.
static ACTIVE_ROOT: AtomicUsize = AtomicUsize::new(0);

/// Makes the table rooted at `root` the active translation.
///
/// # Safety
/// Always safe in emulation; the signature matches the hardware backend.
pub unsafe fn activate(root: PhysicalAddress) {
    ACTIVE_ROOT.store(root.as_usize(), Ordering::Release);
}

/// Returns the root of the most recently activated table.
pub fn active_root() -> Option<PhysicalAddress> {
    match ACTIVE_ROOT.load(Ordering::Acquire) {
        0 => None,
        root => Some(PhysicalAddress::new(root)),
    }
}

/// Invalidates any cached translation for `virt`. There is no TLB to flush in emulation.
pub fn flush(_virt: VirtualAddress) {}
