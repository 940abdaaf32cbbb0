//! Address space maps.
//!
//! A [`Map`] is an address-ordered, non-overlapping collection of [`Segment`]s together
//! with the [`Pmap`] that holds its hardware translations. Every segment lies within the
//! pmap's addressable range.
//!
//! The segment table sits behind a reader-writer lock. Structural changes (insert,
//! resize, protect, remove, delete) take it for writing; lookups, fault resolution,
//! cloning and the dump take it for reading, so nobody ever observes a half-updated
//! table.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;

use pmm::{PAGE_SIZE, Pmap, PmapKind, Protection, VirtualAddress};

use crate::{
    Result, VmError,
    object::VmObject,
    segment::{Segment, SegmentInfo},
};

bitflags::bitflags! {
    /// Placement flags for [`Map::insert`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapFlags: u32 {
        /// The segment must be placed exactly at its requested start.
        const FIXED = 1 << 0;
    }
}

/// An address space.
pub struct Map {
    segments: spin::RwLock<Vec<Segment>>,
    pmap: Pmap,
}

/// Read access to a map's segments. Segments cannot change while the guard is held.
pub struct MapReadGuard<'a> {
    segments: spin::RwLockReadGuard<'a, Vec<Segment>>,
}

impl MapReadGuard<'_> {
    /// Returns the segment covering `addr`.
    pub fn find(&self, addr: VirtualAddress) -> Option<&Segment> {
        find_index(&self.segments, addr).map(|index| &self.segments[index])
    }

    /// Iterates over segments in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Index of the segment covering `addr`, by binary search on the ordered table.
fn find_index(segments: &[Segment], addr: VirtualAddress) -> Option<usize> {
    let index = segments.partition_point(|segment| segment.end() <= addr);
    segments
        .get(index)
        .filter(|segment| segment.contains(addr))
        .map(|_| index)
}

/// Index of the segment starting exactly at `start`.
fn start_index(segments: &[Segment], start: VirtualAddress) -> Result<usize> {
    segments
        .binary_search_by_key(&start, Segment::start)
        .map_err(|_| VmError::InvalidArgument)
}

fn check_aligned(addr: VirtualAddress) -> Result<()> {
    if addr.is_page_aligned() {
        Ok(())
    } else {
        Err(VmError::InvalidArgument)
    }
}

impl Map {
    /// Creates an empty user address space with a fresh pmap.
    ///
    /// The pmap has no kernel half, so the map cannot be activated. Address spaces that
    /// run come from [`crate::SpaceRegistry::new_user_map`].
    pub fn new() -> Self {
        Self::with_pmap(Pmap::new(PmapKind::User))
    }

    /// Creates an empty address space over an existing pmap.
    pub fn with_pmap(pmap: Pmap) -> Self {
        log::debug!("new address space {} - {}", pmap.start(), pmap.end());
        Self {
            segments: spin::RwLock::new(Vec::new()),
            pmap,
        }
    }

    /// Builds a map from segments that are already ordered and non-overlapping.
    pub(crate) fn from_parts(pmap: Pmap, segments: Vec<Segment>) -> Self {
        debug_assert!(segments.windows(2).all(|w| w[0].end() <= w[1].start()));
        Self {
            segments: spin::RwLock::new(segments),
            pmap,
        }
    }

    pub fn pmap(&self) -> &Pmap {
        &self.pmap
    }

    /// The addressable range `[start, end)`.
    pub fn range(&self) -> (VirtualAddress, VirtualAddress) {
        (self.pmap.start(), self.pmap.end())
    }

    /// Returns true if `addr` falls inside the addressable range.
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        self.pmap.contains(addr)
    }

    /// Number of segments.
    pub fn len(&self) -> usize {
        self.segments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.read().is_empty()
    }

    /// Locks the segment table for reading.
    pub fn read(&self) -> MapReadGuard<'_> {
        MapReadGuard {
            segments: self.segments.read(),
        }
    }

    /// Snapshot of every segment's placement, in address order.
    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.segments.read().iter().map(Segment::info).collect()
    }

    /// Returns the placement of the segment covering `addr`.
    pub fn find_segment(&self, addr: VirtualAddress) -> Option<SegmentInfo> {
        self.read().find(addr).map(Segment::info)
    }

    /// Finds the lowest address at or above `hint` where `length` bytes fit.
    ///
    /// The hint is rounded up to a page boundary and clamped into the addressable range.
    /// Placement is first-fit in ascending address order.
    pub fn find_free_range(&self, hint: VirtualAddress, length: usize) -> Result<VirtualAddress> {
        let segments = self.segments.read();
        self.free_range(&segments, hint, length)
            .map(|(start, _)| start)
    }

    /// First-fit search. Also returns the table index a segment placed there would take.
    fn free_range(
        &self,
        segments: &[Segment],
        hint: VirtualAddress,
        length: usize,
    ) -> Result<(VirtualAddress, usize)> {
        if length == 0 || length % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }
        let hint = hint
            .as_usize()
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or(VmError::OutOfSpace)?;

        let map_end = self.pmap.end().as_usize();
        let fits_before = |start: usize, limit: usize| {
            start.checked_add(length).is_some_and(|end| end <= limit)
        };

        let mut start = hint.max(self.pmap.start().as_usize());
        if !fits_before(start, map_end) {
            return Err(VmError::OutOfSpace);
        }

        let found = |start: usize, index: usize| -> Result<(VirtualAddress, usize)> {
            Ok((VirtualAddress::new(start), index))
        };

        match segments.first() {
            None => return found(start, 0),
            Some(first) if fits_before(start, first.start().as_usize()) => return found(start, 0),
            Some(_) => {}
        }

        for (index, segment) in segments.iter().enumerate() {
            let gap_start = segment.end().as_usize();
            let gap_end = segments
                .get(index + 1)
                .map_or(map_end, |next| next.start().as_usize());

            // Skip past occupied space.
            start = start.max(gap_start);

            if fits_before(start, gap_end) {
                return found(start, index + 1);
            }
        }

        Err(VmError::OutOfSpace)
    }

    /// Places `segment` in the map, returning the address it ended up at.
    ///
    /// The search starts at the segment's requested start. With [`MapFlags::FIXED`] the
    /// segment must land exactly there; otherwise it is moved to the first gap that fits.
    pub fn insert(&self, mut segment: Segment, flags: MapFlags) -> Result<VirtualAddress> {
        let mut segments = self.segments.write();
        let (start, index) = self.free_range(&segments, segment.start(), segment.len())?;

        if flags.contains(MapFlags::FIXED) && start != segment.start() {
            return Err(VmError::OutOfSpace);
        }

        segment.relocate(start);
        log::debug!("inserted segment {}", segment);
        segments.insert(index, segment);
        Ok(start)
    }

    /// Moves the end of the segment starting at `start` to `new_end`.
    ///
    /// Growing requires free space up to `new_end`. Shrinking removes the hardware
    /// translations of the cut-off tail and releases its pages from the object unless
    /// something else may still map them.
    pub fn resize(&self, start: VirtualAddress, new_end: VirtualAddress) -> Result<()> {
        check_aligned(new_end)?;

        let mut segments = self.segments.write();
        let index = start_index(&segments, start)?;
        let old_end = segments[index].end();

        if new_end > old_end {
            let limit = segments
                .get(index + 1)
                .map_or(self.pmap.end(), Segment::start);
            if new_end > limit {
                return Err(VmError::OutOfSpace);
            }
        } else if new_end < old_end {
            let segment = &segments[index];
            if new_end <= segment.start() {
                return Err(VmError::InvalidArgument);
            }
            self.pmap.remove_range(new_end, old_end);
            let tail = segment.object_offset(new_end)..segment.object_offset(old_end);
            segments[index].set_end(new_end);
            release_unshared(&segments, segments[index].object(), 0, tail);
        }

        segments[index].set_end(new_end);
        log::debug!("resized segment {}", segments[index]);
        Ok(())
    }

    /// Unmaps the segment starting at `start` and drops it.
    pub fn remove_segment(&self, start: VirtualAddress) -> Result<()> {
        let mut segments = self.segments.write();
        let index = start_index(&segments, start)?;
        let segment = segments.remove(index);

        self.pmap.remove_range(segment.start(), segment.end());
        let window = segment.offset()..segment.object_offset(segment.end());
        release_unshared(&segments, segment.object(), 1, window);
        log::debug!("removed segment {}", segment);
        Ok(())
    }

    /// Drops the page at `offset` from `object` if no segment of this map covers it
    /// any more and nobody else may map it. `object` is the caller's own reference.
    pub(crate) fn release_stranded(&self, object: &Arc<VmObject>, offset: usize) {
        let segments = self.segments.read();
        release_unshared(&segments, object, 1, offset..offset + PAGE_SIZE);
    }

    /// Changes the protection of `[start, end)`.
    ///
    /// The range must be fully covered by segments. Segments straddling either bound are
    /// split, existing translations are updated in place (removed for
    /// [`Protection::NONE`]), and neighbours that end up identical are merged again.
    pub fn protect(&self, start: VirtualAddress, end: VirtualAddress, prot: Protection) -> Result<()> {
        check_aligned(start)?;
        check_aligned(end)?;
        if start >= end {
            return Err(VmError::InvalidArgument);
        }

        let mut segments = self.segments.write();

        let mut first = find_index(&segments, start).ok_or(VmError::Unmapped)?;
        let mut last = first;
        while segments[last].end() < end {
            match segments.get(last + 1) {
                Some(next) if next.start() == segments[last].end() => last += 1,
                _ => return Err(VmError::Unmapped),
            }
        }

        if segments[first].start() < start {
            let tail = segments[first].split_at(start);
            segments.insert(first + 1, tail);
            first += 1;
            last += 1;
        }
        if segments[last].end() > end {
            let tail = segments[last].split_at(end);
            segments.insert(last + 1, tail);
        }

        for segment in &mut segments[first..=last] {
            segment.set_protection(prot);
        }
        self.pmap.protect_range(start, end, prot);
        log::debug!("protected {} - {} [{}]", start, end, prot);

        merge_neighbours(&mut segments);
        Ok(())
    }

    /// Logs every segment with its protection and backing object.
    pub fn dump(&self) {
        let segments = self.segments.read();
        log::info!(
            "Virtual memory map ({} - {}):",
            self.pmap.start(),
            self.pmap.end()
        );
        for segment in segments.iter() {
            log::info!(" * {}", segment);
            log::info!("   {}", segment.object());
        }
    }

    /// Destroys an address space.
    ///
    /// # Panics
    /// Panics if anything else still holds a strong reference to the map.
    pub fn delete(this: Arc<Map>) {
        match Arc::try_unwrap(this) {
            Ok(map) => drop(map),
            Err(_) => panic!("address space deleted while still referenced"),
        }
    }
}

/// Releases `window` of `object` unless it may still be mapped.
///
/// `segments` is the whole table of the map doing the release and `held` counts the
/// references to `object` its caller holds outside the table. The pages stay if any
/// segment in the table still covers part of the window, or if the object has
/// references beyond the table and the caller (another map, a fault in flight). Those
/// pages are freed when the object itself goes away.
fn release_unshared(
    segments: &[Segment],
    object: &Arc<VmObject>,
    held: usize,
    window: Range<usize>,
) {
    let mut local = held;
    for segment in segments.iter().filter(|s| Arc::ptr_eq(s.object(), object)) {
        let covered = segment.offset()..segment.object_offset(segment.end());
        if covered.start < window.end && window.start < covered.end {
            return;
        }
        local += 1;
    }

    if Arc::strong_count(object) > local {
        log::debug!(
            "keeping object pages {:#x} - {:#x}, object is still shared",
            window.start,
            window.end
        );
        return;
    }
    object.release_range(window.start, window.end);
}

/// Folds adjacent segments that share an object, protection and contiguous offsets.
fn merge_neighbours(segments: &mut Vec<Segment>) {
    let mut index = 0;
    while index + 1 < segments.len() {
        if segments[index].can_merge(&segments[index + 1]) {
            let next = segments.remove(index + 1);
            segments[index].set_end(next.end());
        } else {
            index += 1;
        }
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        let segments = core::mem::take(self.segments.get_mut());
        log::debug!(
            "deleting address space {} - {} with {} segments",
            self.pmap.start(),
            self.pmap.end(),
            segments.len()
        );
        // Segments release their object references here; the pmap frees its tables
        // when the field is dropped.
        drop(segments);
    }
}
