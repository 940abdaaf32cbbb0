#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Physical Map (PMM)
//!
//! The physical map is the lowest layer of the Polaris virtual memory system. It owns
//! everything that touches the memory-management unit:
//!
//! - Physical and virtual address types.
//! - Architecture page table formats (x86_64, plus a software scale model for tests).
//! - The page directory walker that installs and removes translations.
//! - [`Pmap`], the per-address-space hardware translation handle.
//! - The [`FrameAllocator`] interface used to obtain physical frames.

extern crate alloc;

mod address;
mod arch;
mod frame;
mod page_directory;
mod pmap;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use frame::{FrameAllocator, copy_frame, zero_frame};
pub use page_directory::PageDirectory;
pub use pmap::{Pmap, PmapKind, Protection};

pub use arch::{
    KERNEL_SPACE_END, KERNEL_SPACE_START, PAGE_SIZE, USER_SPACE_END, USER_SPACE_START,
};

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedMemory, active_root};
