//! Hardware translation handles.
//!
//! A [`Pmap`] is the per-address-space structure the memory-management unit consults.
//! It wraps a [`PageDirectory`] with the addressable range of the space and the
//! policy for turning a [`Protection`] into page table flags.

use core::fmt;

use crate::{
    PhysicalAddress, VirtualAddress,
    arch::{self, PageFlags},
    page_directory::PageDirectory,
};

bitflags::bitflags! {
    /// Access rights of a range of virtual memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Protection {
    /// No access at all.
    pub const NONE: Self = Self::empty();
    /// Read and write.
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
}

impl fmt::Display for Protection {
    /// Formats the protection as the classic `rwx` triplet, e.g. `r-x`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit: Protection, c: char| if self.contains(bit) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(Self::READ, 'r'),
            flag(Self::WRITE, 'w'),
            flag(Self::EXEC, 'x')
        )
    }
}

/// Which half of the machine a pmap translates for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmapKind {
    /// Translations are reachable from user mode.
    User,
    /// Translations are supervisor-only.
    Kernel,
}

/// A hardware translation handle with a fixed addressable range `[start, end)`.
///
/// All mutation goes through an internal lock, so a pmap may be shared between the
/// fault path and whatever thread owns its address space.
pub struct Pmap {
    kind: PmapKind,
    start: VirtualAddress,
    end: VirtualAddress,
    directory: spin::Mutex<PageDirectory>,
}

fn default_range(kind: PmapKind) -> (VirtualAddress, VirtualAddress) {
    let (start, end) = match kind {
        PmapKind::User => (arch::USER_SPACE_START, arch::USER_SPACE_END),
        PmapKind::Kernel => (arch::KERNEL_SPACE_START, arch::KERNEL_SPACE_END),
    };
    (VirtualAddress::new(start), VirtualAddress::new(end))
}

impl Pmap {
    /// Creates an empty pmap covering the architecture's default range for `kind`.
    ///
    /// A kernel pmap gets its whole kernel half of root entries up front. A user pmap
    /// made this way has no kernel half and cannot be activated; use [`Self::new_user`]
    /// for address spaces that will run.
    pub fn new(kind: PmapKind) -> Self {
        let (start, end) = default_range(kind);
        Self::with_range(kind, start, end)
    }

    /// Creates an empty pmap covering `[start, end)`.
    ///
    /// # Panics
    /// Panics if the bounds are not page-aligned or the range is empty.
    pub fn with_range(kind: PmapKind, start: VirtualAddress, end: VirtualAddress) -> Self {
        let directory = match kind {
            PmapKind::User => PageDirectory::new(),
            PmapKind::Kernel => PageDirectory::new_kernel(),
        };
        Self::from_directory(kind, start, end, directory)
    }

    /// Creates an empty user pmap over the default user range that shares the kernel
    /// half of `kernel`.
    pub fn new_user(kernel: &Pmap) -> Self {
        let (start, end) = default_range(PmapKind::User);
        Self::user_with_range(kernel, start, end)
    }

    /// Creates an empty user pmap covering `[start, end)` that shares the kernel half of
    /// `kernel`. The kernel pmap must outlive it.
    ///
    /// # Panics
    /// Panics if `kernel` is not a kernel pmap, or if the range is invalid.
    pub fn user_with_range(kernel: &Pmap, start: VirtualAddress, end: VirtualAddress) -> Self {
        assert_eq!(kernel.kind, PmapKind::Kernel, "kernel half must come from a kernel pmap");
        let directory = PageDirectory::sharing_kernel_half(&kernel.directory.lock());
        Self::from_directory(PmapKind::User, start, end, directory)
    }

    /// Builds the kernel pmap around the page tables that are currently active.
    ///
    /// # Safety
    /// Must run once, at boot, while the boot loader's tables are loaded. Those tables
    /// are taken over for good.
    pub unsafe fn adopt_active() -> Self {
        let root = arch::active_root().expect("no active page table to adopt");
        let (start, end) = default_range(PmapKind::Kernel);
        // SAFETY: upheld by the caller.
        let directory = unsafe { PageDirectory::adopt(root) };
        log::debug!("adopted kernel page tables at {}", root);
        Self::from_directory(PmapKind::Kernel, start, end, directory)
    }

    /// An empty pmap with the same kind and range. A user pmap sharing a kernel half
    /// produces one sharing the same kernel half.
    pub fn new_like(&self) -> Self {
        let directory = match self.kind {
            PmapKind::User => {
                let source = self.directory.lock();
                if source.shares_kernel_half() {
                    PageDirectory::sharing_kernel_half(&source)
                } else {
                    PageDirectory::new()
                }
            }
            PmapKind::Kernel => PageDirectory::new_kernel(),
        };
        Self::from_directory(self.kind, self.start, self.end, directory)
    }

    fn from_directory(
        kind: PmapKind,
        start: VirtualAddress,
        end: VirtualAddress,
        directory: PageDirectory,
    ) -> Self {
        assert!(
            start.is_page_aligned() && end.is_page_aligned(),
            "pmap range must be page-aligned"
        );
        assert!(start < end, "pmap range must not be empty");

        Self {
            kind,
            start,
            end,
            directory: spin::Mutex::new(directory),
        }
    }

    /// Returns true if the kernel's half of the address space is mapped, which is
    /// required before the pmap can be activated.
    pub fn has_kernel_half(&self) -> bool {
        match self.kind {
            PmapKind::Kernel => true,
            PmapKind::User => self.directory.lock().shares_kernel_half(),
        }
    }

    /// Returns what this pmap translates for.
    pub fn kind(&self) -> PmapKind {
        self.kind
    }

    /// First address of the addressable range.
    pub fn start(&self) -> VirtualAddress {
        self.start
    }

    /// End (exclusive) of the addressable range.
    pub fn end(&self) -> VirtualAddress {
        self.end
    }

    /// Returns true if `addr` lies in `[start, end)`.
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Physical address of the root table.
    pub fn root(&self) -> PhysicalAddress {
        self.directory.lock().root()
    }

    /// Installs a translation from the page `vaddr` to `frame`.
    ///
    /// Entering with [`Protection::NONE`] removes any existing translation instead.
    pub fn enter(&self, vaddr: VirtualAddress, frame: PhysicalAddress, prot: Protection) {
        debug_assert!(self.contains(vaddr), "{} outside pmap range", vaddr);
        let mut directory = self.directory.lock();
        if prot.is_empty() {
            directory.unmap(vaddr);
        } else {
            directory.map(vaddr, frame, self.page_flags(prot));
        }
    }

    /// Removes every translation in `[start, end)`. Returns how many were removed.
    pub fn remove_range(&self, start: VirtualAddress, end: VirtualAddress) -> usize {
        let mut directory = self.directory.lock();
        pages(start, end)
            .filter(|page| directory.unmap(*page).is_some())
            .count()
    }

    /// Changes the protection of every existing translation in `[start, end)`.
    ///
    /// Translations downgraded to [`Protection::NONE`] are removed. Returns how many
    /// translations were touched.
    pub fn protect_range(&self, start: VirtualAddress, end: VirtualAddress, prot: Protection) -> usize {
        let mut directory = self.directory.lock();
        if prot.is_empty() {
            return pages(start, end)
                .filter(|page| directory.unmap(*page).is_some())
                .count();
        }
        let flags = self.page_flags(prot);
        pages(start, end)
            .filter(|page| directory.protect(*page, flags))
            .count()
    }

    /// Looks up the frame and protection installed for the page containing `vaddr`.
    pub fn extract(&self, vaddr: VirtualAddress) -> Option<(PhysicalAddress, Protection)> {
        let (frame, flags) = self.directory.lock().translate(vaddr)?;
        let mut prot = Protection::READ;
        prot.set(Protection::WRITE, flags.contains(PageFlags::WRITABLE));
        prot.set(Protection::EXEC, !flags.contains(PageFlags::NO_EXECUTE));
        Some((frame, prot))
    }

    /// Number of translations currently installed.
    pub fn resident_count(&self) -> usize {
        self.directory.lock().mapped_pages()
    }

    /// Makes this pmap the active translation on the executing core.
    ///
    /// # Safety
    /// The pmap must map everything the core touches after the switch (kernel text,
    /// stacks, the direct map), so it must have a kernel half. The caller must not be
    /// preempted between updating its bookkeeping and calling this.
    pub unsafe fn activate(&self) {
        let root = self.root();
        log::trace!("activating pmap rooted at {}", root);
        // SAFETY: upheld by the caller.
        unsafe { arch::activate(root) };
    }

    fn page_flags(&self, prot: Protection) -> PageFlags {
        let mut flags = PageFlags::PRESENT;
        flags.set(PageFlags::WRITABLE, prot.contains(Protection::WRITE));
        flags.set(PageFlags::NO_EXECUTE, !prot.contains(Protection::EXEC));
        flags.set(PageFlags::USER_ACCESSIBLE, self.kind == PmapKind::User);
        flags
    }
}

fn pages(start: VirtualAddress, end: VirtualAddress) -> impl Iterator<Item = VirtualAddress> {
    (start.as_usize()..end.as_usize())
        .step_by(arch::PAGE_SIZE)
        .map(VirtualAddress::new)
}
