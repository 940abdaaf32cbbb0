//! x86_64 architecture-specific implementation.
//!
//! This module provides the hardware implementation for x86_64, including address
//! validation, address space layout and low-level page table primitives.

mod entry;
mod table;

pub use entry::{PageEntry, PageFlags};
pub use table::{ENTRY_COUNT, PageTable, activate, active_root, flush};

/// Maximum number of bits in a physical address on x86_64.
/// This is typically 52 bits on modern CPUs, but we use 48 as a conservative default.
pub const MAX_PHYSICAL_BITS: usize = 48;

/// Maximum number of bits in a virtual address on x86_64 with 4-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// Default page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of page table levels in x86_64 (4-level paging).
pub const PAGE_TABLE_LEVELS: usize = 4;

/// First address of the default user address space (page zero stays unmapped).
pub const USER_SPACE_START: usize = 0x0000_0000_0000_1000;
/// End (exclusive) of the user address space: the top of the lower canonical half.
pub const USER_SPACE_END: usize = 0x0000_7FFF_FFFF_F000;
/// First address of the kernel address space (higher half).
pub const KERNEL_SPACE_START: usize = 0xFFFF_8000_0000_0000;
/// End (exclusive) of the kernel address space.
pub const KERNEL_SPACE_END: usize = 0xFFFF_FFFF_FFFF_F000;

/// Returns the page table index for a given virtual address at the specified level.
///
/// Level 0 is the page table (PT), level 3 the page map level 4 (PML4).
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(
        level < PAGE_TABLE_LEVELS,
        "level out of range for x86_64 page table levels"
    );
    (address >> (12 + level * 9)) & (ENTRY_COUNT - 1)
}

/// Validates a physical address for x86_64.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1usize << MAX_PHYSICAL_BITS)
}

/// Validates a virtual address for x86_64.
///
/// Virtual addresses must be canonical (bits 47-63 must be sign-extended from bit 47).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let canonical = if (addr & (1 << 47)) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    };
    canonical == addr
}
