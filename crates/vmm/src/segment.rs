//! Segments: contiguous virtual ranges bound to a backing object.

use alloc::sync::Arc;
use core::fmt;

use pmm::{PAGE_SIZE, Protection, VirtualAddress};

use crate::{Result, VmError, object::VmObject};

/// A page-aligned virtual range `[start, end)` bound to one object with one protection.
///
/// The first page of the segment is backed by the object's page at `offset`; later pages
/// follow contiguously. A segment holds its own reference to the object.
#[derive(Debug)]
pub struct Segment {
    start: VirtualAddress,
    end: VirtualAddress,
    protection: Protection,
    object: Arc<VmObject>,
    offset: usize,
}

/// A copy of a segment's placement, safe to keep after the map lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub protection: Protection,
    pub offset: usize,
}

impl Segment {
    /// Creates a segment backed by `object` from offset zero.
    ///
    /// Fails with [`VmError::InvalidArgument`] if either bound is misaligned or the
    /// range is empty.
    pub fn new(
        object: Arc<VmObject>,
        start: VirtualAddress,
        end: VirtualAddress,
        protection: Protection,
    ) -> Result<Self> {
        Self::with_offset(object, 0, start, end, protection)
    }

    /// Creates a segment backed by `object` starting at page offset `offset`.
    pub fn with_offset(
        object: Arc<VmObject>,
        offset: usize,
        start: VirtualAddress,
        end: VirtualAddress,
        protection: Protection,
    ) -> Result<Self> {
        if !start.is_page_aligned() || !end.is_page_aligned() || offset % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }
        if start >= end {
            return Err(VmError::InvalidArgument);
        }

        Ok(Self {
            start,
            end,
            protection,
            object,
            offset,
        })
    }

    pub fn start(&self) -> VirtualAddress {
        self.start
    }

    pub fn end(&self) -> VirtualAddress {
        self.end
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    pub fn object(&self) -> &Arc<VmObject> {
        &self.object
    }

    /// Offset within the object of the segment's first page.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn contains(&self, addr: VirtualAddress) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Offset within the object backing `addr`.
    pub fn object_offset(&self, addr: VirtualAddress) -> usize {
        debug_assert!(self.contains(addr) || addr == self.end);
        self.offset + (addr - self.start)
    }

    pub fn info(&self) -> SegmentInfo {
        SegmentInfo {
            start: self.start,
            end: self.end,
            protection: self.protection,
            offset: self.offset,
        }
    }

    /// Moves the segment to `start`, keeping its length.
    pub(crate) fn relocate(&mut self, start: VirtualAddress) {
        let len = self.len();
        self.start = start;
        self.end = start + len;
    }

    pub(crate) fn set_end(&mut self, end: VirtualAddress) {
        debug_assert!(end > self.start);
        self.end = end;
    }

    pub(crate) fn set_protection(&mut self, protection: Protection) {
        self.protection = protection;
    }

    /// Splits the segment at `addr`. `self` keeps `[start, addr)` and the returned segment
    /// covers `[addr, end)`, sharing the same object.
    pub(crate) fn split_at(&mut self, addr: VirtualAddress) -> Segment {
        debug_assert!(self.start < addr && addr < self.end, "split point outside segment");
        let tail = Segment {
            start: addr,
            end: self.end,
            protection: self.protection,
            object: Arc::clone(&self.object),
            offset: self.object_offset(addr),
        };
        self.end = addr;
        tail
    }

    /// Returns true if `next` directly follows `self` and could be folded into it.
    pub(crate) fn can_merge(&self, next: &Segment) -> bool {
        self.end == next.start
            && self.protection == next.protection
            && Arc::ptr_eq(&self.object, &next.object)
            && self.object_offset(self.end) == next.offset
    }

    /// A segment with the same placement bound to a different object.
    pub(crate) fn rebind(&self, object: Arc<VmObject>) -> Segment {
        Segment {
            start: self.start,
            end: self.end,
            protection: self.protection,
            object,
            offset: self.offset,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {} [{}]", self.start, self.end, self.protection)
    }
}
