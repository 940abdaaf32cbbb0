//! Architecture-independent page table management.
//!
//! This module provides the `PageDirectory` type, which owns a tree of architecture
//! page tables and provides mapping, unmapping, lookup and permission updates on it.

use core::ops::Range;

use crate::{
    PhysicalAddress, VirtualAddress,
    address::AddressTranslator,
    arch::{self, PageEntry, PageFlags, PageTable},
};

#[cfg(not(any(test, feature = "software-emulation")))]
use alloc::boxed::Box;

/// Allocates a cleared page table from emulated physical memory.
#[cfg(any(test, feature = "software-emulation"))]
fn alloc_page_table() -> PhysicalAddress {
    use crate::FrameAllocator;

    let memory = AddressTranslator::current()
        .emulated_memory()
        .expect("software emulation requires an emulated address translator");
    let table = memory.allocate_frame().expect("out of emulated memory");
    crate::zero_frame(table);
    table
}

#[cfg(any(test, feature = "software-emulation"))]
fn free_page_table(table: PhysicalAddress) {
    use crate::FrameAllocator;

    if let Some(memory) = AddressTranslator::current().emulated_memory() {
        memory.deallocate_frame(table);
    }
}

/// Allocates a cleared page table using the kernel heap, which lives in the direct map.
#[cfg(not(any(test, feature = "software-emulation")))]
fn alloc_page_table() -> PhysicalAddress {
    let table = Box::into_raw(Box::new(PageTable::new()));
    PhysicalAddress::new(AddressTranslator::current().virt_to_phys(table as usize))
}

#[cfg(not(any(test, feature = "software-emulation")))]
fn free_page_table(table: PhysicalAddress) {
    let ptr = AddressTranslator::current().phys_to_ptr::<PageTable>(table.as_usize());
    // SAFETY: every table in a directory was created by `alloc_page_table`.
    drop(unsafe { Box::from_raw(ptr) });
}

/// Returns the table stored at `phys`.
///
/// # Safety
/// `phys` must be a table allocated by `alloc_page_table` and still owned by a directory,
/// and the caller must not create overlapping mutable references to it.
unsafe fn table_at<'a>(phys: PhysicalAddress) -> &'a mut PageTable {
    let ptr = AddressTranslator::current().phys_to_ptr::<PageTable>(phys.as_usize());
    // SAFETY: guaranteed by the caller.
    unsafe { &mut *ptr }
}

/// Flags for intermediate entries. Leaf entries decide the effective permissions.
fn table_flags() -> PageFlags {
    PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER_ACCESSIBLE
}

/// Root table indexes that translate the kernel half of the address space.
pub fn kernel_root_entries() -> Range<usize> {
    arch::page_index(arch::KERNEL_SPACE_START, arch::PAGE_TABLE_LEVELS - 1)..arch::ENTRY_COUNT
}

/// An architecture-independent page table manager.
///
/// This type owns the root page table and every intermediate table below it. It does
/// not own the frames its leaf entries point at. Dropping the directory frees the
/// whole table tree.
///
/// A user directory may borrow the kernel half: its root entries in
/// [`kernel_root_entries`] then point at tables owned by the kernel directory, which
/// must outlive it. Borrowed subtrees are neither counted nor freed.
pub struct PageDirectory {
    root: PhysicalAddress,
    borrowed: Range<usize>,
    /// False for tables adopted from the boot loader.
    owned: bool,
}

impl PageDirectory {
    /// Creates a new page directory with an empty root page table.
    pub fn new() -> Self {
        Self {
            root: alloc_page_table(),
            borrowed: 0..0,
            owned: true,
        }
    }

    /// Creates a kernel directory with every kernel-half root entry populated, so that
    /// directories sharing it see kernel mappings added later.
    pub fn new_kernel() -> Self {
        let mut directory = Self::new();
        directory.populate_kernel_half();
        directory
    }

    /// Creates an empty directory whose kernel half is the one of `kernel`.
    pub fn sharing_kernel_half(kernel: &PageDirectory) -> Self {
        let mut directory = Self::new();
        // SAFETY: both roots are live and distinct.
        let (source, target) = unsafe { (table_at(kernel.root), table_at(directory.root)) };
        for index in kernel_root_entries() {
            *target.entry_mut(index) = source.entry(index);
        }
        directory.borrowed = kernel_root_entries();
        directory
    }

    /// Takes over an existing table tree, e.g. the one the boot loader left active.
    /// Missing kernel-half root entries are filled in. The tree is never freed.
    ///
    /// # Safety
    /// `root` must be a valid root table reachable through the direct map, and nothing
    /// else may modify the tree while the directory exists.
    pub unsafe fn adopt(root: PhysicalAddress) -> Self {
        let mut directory = Self {
            root,
            borrowed: 0..0,
            owned: false,
        };
        directory.populate_kernel_half();
        directory
    }

    /// Returns true if the kernel half is borrowed from a kernel directory.
    pub fn shares_kernel_half(&self) -> bool {
        !self.borrowed.is_empty()
    }

    fn populate_kernel_half(&mut self) {
        // SAFETY: the root is owned or adopted by this directory.
        let root = unsafe { table_at(self.root) };
        for index in kernel_root_entries() {
            let entry = root.entry_mut(index);
            if entry.address().is_none() {
                *entry = PageEntry::new(alloc_page_table(), table_flags());
            }
        }
    }

    /// Returns the physical address of the root table.
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Maps a virtual page to a physical frame with the given flags.
    ///
    /// Intermediate tables are allocated as needed. Returns the frame previously mapped
    /// at `virt`, if any.
    ///
    /// # Panics
    /// Panics if either address is not page-aligned.
    pub fn map(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> Option<PhysicalAddress> {
        assert!(virt.is_page_aligned(), "virtual address must be page-aligned");
        assert!(phys.is_page_aligned(), "physical address must be page-aligned");

        let entry = self.walk_or_create(virt);
        let previous = entry.address();
        *entry = PageEntry::new(phys, flags | PageFlags::PRESENT);
        if previous.is_some() {
            arch::flush(virt);
        }
        previous
    }

    /// Unmaps a virtual page, returning the frame that was mapped there.
    ///
    /// # Panics
    /// Panics if the virtual address is not page-aligned.
    pub fn unmap(&mut self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        assert!(virt.is_page_aligned(), "virtual address must be page-aligned");

        let entry = self.walk(virt)?;
        let phys = entry.address()?;
        entry.clear();
        arch::flush(virt);
        Some(phys)
    }

    /// Replaces the flags of an existing mapping. Returns false if `virt` is not mapped.
    pub fn protect(&mut self, virt: VirtualAddress, flags: PageFlags) -> bool {
        let Some(entry) = self.walk(virt) else {
            return false;
        };
        if !entry.is_present() {
            return false;
        }
        entry.set_flags(flags | PageFlags::PRESENT);
        arch::flush(virt);
        true
    }

    /// Looks up the frame and flags mapped at the page containing `virt`.
    pub fn translate(&self, virt: VirtualAddress) -> Option<(PhysicalAddress, PageFlags)> {
        let virt = virt.align_down(arch::PAGE_SIZE);
        let mut table_phys = self.root;

        for level in (0..arch::PAGE_TABLE_LEVELS).rev() {
            // SAFETY: tables reachable from the root are owned by this directory.
            let table = unsafe { table_at(table_phys) };
            let entry = table.entry(virt.page_index(level));
            let next = entry.address()?;
            if level == 0 {
                return Some((next, entry.flags()));
            }
            table_phys = next;
        }

        None
    }

    /// Counts the leaf translations currently installed, not counting a borrowed
    /// kernel half.
    pub fn mapped_pages(&self) -> usize {
        self.own_subtrees()
            .map(|next| count_leaves(next, arch::PAGE_TABLE_LEVELS - 2))
            .sum()
    }

    /// Tables referenced from root entries this directory owns.
    fn own_subtrees(&self) -> impl Iterator<Item = PhysicalAddress> + '_ {
        // SAFETY: the root is owned or adopted by this directory.
        let root = unsafe { table_at(self.root) };
        root.entries()
            .enumerate()
            .filter(|(index, _)| !self.borrowed.contains(index))
            .filter_map(|(_, entry)| entry.address())
    }

    /// Walks the hierarchy to the leaf entry for `virt`, without creating tables.
    fn walk(&mut self, virt: VirtualAddress) -> Option<&mut PageEntry> {
        let mut table_phys = self.root;

        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            // SAFETY: tables reachable from the root are owned by this directory, and
            // `&mut self` guarantees exclusive access.
            let table = unsafe { table_at(table_phys) };
            table_phys = table.entry(virt.page_index(level)).address()?;
        }

        // SAFETY: as above.
        let table = unsafe { table_at(table_phys) };
        Some(table.entry_mut(virt.page_index(0)))
    }

    /// Walks the hierarchy to the leaf entry for `virt`, creating tables as needed.
    fn walk_or_create(&mut self, virt: VirtualAddress) -> &mut PageEntry {
        let mut table_phys = self.root;

        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            // SAFETY: tables reachable from the root are owned by this directory, and
            // `&mut self` guarantees exclusive access.
            let table = unsafe { table_at(table_phys) };
            let entry = table.entry_mut(virt.page_index(level));

            table_phys = match entry.address() {
                Some(next) => next,
                None => {
                    let next = alloc_page_table();
                    *entry = PageEntry::new(next, table_flags());
                    next
                }
            };
        }

        // SAFETY: as above.
        let table = unsafe { table_at(table_phys) };
        table.entry_mut(virt.page_index(0))
    }
}

fn count_leaves(table_phys: PhysicalAddress, level: usize) -> usize {
    // SAFETY: only called on tables owned by a live directory.
    let table = unsafe { table_at(table_phys) };
    table
        .entries()
        .filter_map(|entry| entry.address())
        .map(|next| {
            if level == 0 {
                1
            } else {
                count_leaves(next, level - 1)
            }
        })
        .sum()
}

fn free_tables(table_phys: PhysicalAddress, level: usize) {
    if level > 0 {
        // SAFETY: the directory owning this tree is being dropped.
        let table = unsafe { table_at(table_phys) };
        for next in table.entries().filter_map(|entry| entry.address()) {
            free_tables(next, level - 1);
        }
    }
    free_page_table(table_phys);
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PageDirectory {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        for next in self.own_subtrees() {
            free_tables(next, arch::PAGE_TABLE_LEVELS - 2);
        }
        free_page_table(self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::TEST_MEMORY_SIZE;

    fn setup() {
        AddressTranslator::ensure_emulated(TEST_MEMORY_SIZE);
    }

    fn rw() -> PageFlags {
        PageFlags::WRITABLE
    }

    #[test]
    fn map_then_translate() {
        setup();
        let mut dir = PageDirectory::new();

        let virt = VirtualAddress::new(0x12_3000);
        let phys = PhysicalAddress::new(0x4000);
        assert_eq!(dir.map(virt, phys, rw()), None);

        let (frame, flags) = dir.translate(virt + 0x10).unwrap();
        assert_eq!(frame, phys);
        assert!(flags.contains(PageFlags::PRESENT | PageFlags::WRITABLE));
        assert_eq!(dir.mapped_pages(), 1);
    }

    #[test]
    fn remap_returns_previous_frame() {
        setup();
        let mut dir = PageDirectory::new();
        let virt = VirtualAddress::new(0x5000);

        dir.map(virt, PhysicalAddress::new(0x1000), rw());
        let previous = dir.map(virt, PhysicalAddress::new(0x2000), rw());

        assert_eq!(previous, Some(PhysicalAddress::new(0x1000)));
        assert_eq!(dir.mapped_pages(), 1);
    }

    #[test]
    fn unmap_mapped_page() {
        setup();
        let mut dir = PageDirectory::new();

        let virt = VirtualAddress::new(0x1000);
        let phys = PhysicalAddress::new(0x2000);
        dir.map(virt, phys, rw());

        assert_eq!(dir.unmap(virt), Some(phys));
        assert_eq!(dir.translate(virt), None);
        assert_eq!(dir.mapped_pages(), 0);
    }

    #[test]
    fn unmap_unmapped_page() {
        setup();
        let mut dir = PageDirectory::new();
        assert_eq!(dir.unmap(VirtualAddress::new(0x1000)), None);
    }

    #[test]
    fn protect_rewrites_flags() {
        setup();
        let mut dir = PageDirectory::new();
        let virt = VirtualAddress::new(0x3000);

        assert!(!dir.protect(virt, PageFlags::empty()));

        dir.map(virt, PhysicalAddress::new(0x2000), rw());
        assert!(dir.protect(virt, PageFlags::NO_EXECUTE));

        let (_, flags) = dir.translate(virt).unwrap();
        assert!(!flags.contains(PageFlags::WRITABLE));
        assert!(flags.contains(PageFlags::NO_EXECUTE));
    }

    #[test]
    fn shared_kernel_half_tracks_kernel_mappings() {
        setup();
        let mut kernel = PageDirectory::new_kernel();
        let user = PageDirectory::sharing_kernel_half(&kernel);
        assert!(user.shares_kernel_half());
        assert!(!kernel.shares_kernel_half());

        // Mapped after the user directory was created.
        let virt = VirtualAddress::new(arch::KERNEL_SPACE_START + 0x10_0000);
        kernel.map(virt, PhysicalAddress::new(0x7000), rw());

        assert_eq!(
            user.translate(virt).map(|(frame, _)| frame),
            Some(PhysicalAddress::new(0x7000))
        );
        assert_eq!(user.mapped_pages(), 0);
        assert_eq!(kernel.mapped_pages(), 1);

        drop(user);
        assert!(kernel.translate(virt).is_some());
    }

    #[test]
    fn adopted_tree_is_left_alone() {
        setup();
        let mut boot = PageDirectory::new();
        let virt = VirtualAddress::new(0x3000);
        boot.map(virt, PhysicalAddress::new(0x2000), rw());

        let adopted = unsafe { PageDirectory::adopt(boot.root()) };
        assert_eq!(
            adopted.translate(virt).map(|(frame, _)| frame),
            Some(PhysicalAddress::new(0x2000))
        );
        let user = PageDirectory::sharing_kernel_half(&adopted);
        drop(user);
        drop(adopted);

        // The boot tree survives and now carries the kernel-half tables.
        assert!(boot.translate(virt).is_some());
        assert_eq!(boot.mapped_pages(), 1);
    }

    #[test]
    fn maps_across_tables() {
        setup();
        let mut dir = PageDirectory::new();
        for i in 0..32 {
            let virt = VirtualAddress::new(0x10_0000 * (i % 8) + 0x1000 * i);
            dir.map(virt, PhysicalAddress::new(0x1000), rw());
        }
        assert_eq!(dir.mapped_pages(), 32);
        assert!(dir.translate(VirtualAddress::new(0x71_F000)).is_some());
        assert!(dir.translate(VirtualAddress::new(0x72_0000)).is_none());
    }
}
