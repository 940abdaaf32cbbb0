//! Page fault resolution.
//!
//! The trap handler calls [`resolve`] with the map that owns the faulting address. On
//! success the faulting page has a hardware translation and the access can be retried.
//! Errors are returned to the trap path, which decides what happens to the process.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use pmm::{PAGE_SIZE, PhysicalAddress, Protection, VirtualAddress};

use crate::{Map, Result, VmError, object::VmObject};

/// The kind of access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    /// The protection bit a segment must carry to allow this access.
    pub fn required(self) -> Protection {
        match self {
            Access::Read => Protection::READ,
            Access::Write => Protection::WRITE,
            Access::Execute => Protection::EXEC,
        }
    }
}

static FAULT_STATS: FaultStats = FaultStats::new();

/// Fault statistics counters.
pub struct FaultStats {
    /// Every call to [`resolve`].
    pub total: AtomicU64,
    /// Faults that ended with a translation installed.
    pub resolved: AtomicU64,
    /// Faults that had to ask an object's pager for a page.
    pub page_in: AtomicU64,
    /// Faults that found the segment table changed under them and started over.
    pub retries: AtomicU64,
    pub failures: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
            page_in: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for FaultStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the global fault statistics.
pub fn stats() -> &'static FaultStats {
    &FAULT_STATS
}

/// What the fault path learned about the faulting page under the map lock.
struct Lookup {
    page: VirtualAddress,
    offset: usize,
    object: Arc<VmObject>,
}

fn lookup(map: &Map, addr: VirtualAddress, access: Access) -> Result<Lookup> {
    let segments = map.read();
    let segment = segments.find(addr).ok_or(VmError::Unmapped)?;

    let protection = segment.protection();
    if protection.is_empty() || !protection.contains(access.required()) {
        return Err(VmError::AccessDenied);
    }

    let page = addr.align_down(PAGE_SIZE);
    Ok(Lookup {
        page,
        offset: segment.object_offset(page),
        object: Arc::clone(segment.object()),
    })
}

/// Installs the translation if the segment still binds `page` to `frame` with a
/// protection that allows `access`. Returns false if the map changed in the meantime.
fn install(map: &Map, lookup: &Lookup, frame: PhysicalAddress, access: Access) -> bool {
    let segments = map.read();
    let Some(segment) = segments.find(lookup.page) else {
        return false;
    };

    let unchanged = Arc::ptr_eq(segment.object(), &lookup.object)
        && segment.object_offset(lookup.page) == lookup.offset
        && segment.protection().contains(access.required())
        && lookup.object.find_page(lookup.offset) == Some(frame);
    if unchanged {
        map.pmap().enter(lookup.page, frame, segment.protection());
    }
    unchanged
}

/// Resolves a page fault at `addr` in `map`.
///
/// Looks up the covering segment, checks its protection against `access`, obtains the
/// frame from the segment's object (asking its pager if the page is not resident yet)
/// and installs the translation with the segment's protection.
///
/// The map lock is not held while the pager runs. Once a frame is available the lookup
/// is repeated, and if the segment was changed meanwhile the fault starts over. A page
/// the pager produced for a range that is no longer mapped is given back to the object.
pub fn resolve(map: &Map, addr: VirtualAddress, access: Access) -> Result<()> {
    FaultStats::incr(&FAULT_STATS.total);

    let result = resolve_inner(map, addr, access);
    match result {
        Ok(()) => FaultStats::incr(&FAULT_STATS.resolved),
        Err(err) => {
            FaultStats::incr(&FAULT_STATS.failures);
            log::warn!("{:?} fault at {} failed: {}", access, addr, err);
        }
    }
    result
}

fn resolve_inner(map: &Map, addr: VirtualAddress, access: Access) -> Result<()> {
    loop {
        let found = lookup(map, addr, access)?;

        let frame = match found.object.find_page(found.offset) {
            Some(frame) => frame,
            None => {
                FaultStats::incr(&FAULT_STATS.page_in);
                found.object.fault(found.offset).ok_or(VmError::Unmapped)?
            }
        };

        if install(map, &found, frame, access) {
            log::trace!("mapped {} -> {}", found.page, frame);
            return Ok(());
        }

        map.release_stranded(&found.object, found.offset);
        FaultStats::incr(&FAULT_STATS.retries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{frames, peek, user_map, va};
    use crate::{MapFlags, Segment};
    use alloc::boxed::Box;
    use pmm::FrameAllocator;

    /// Hands out frames from the shared test memory, but runs `before` first, the
    /// first time a frame is requested. Lets a test change the map while a fault is
    /// inside the pager.
    struct Interleaved {
        before: spin::Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl FrameAllocator for Interleaved {
        fn allocate_frame(&self) -> Option<PhysicalAddress> {
            let before = self.before.lock().take();
            if let Some(before) = before {
                before();
            }
            frames().allocate_frame()
        }

        fn deallocate_frame(&self, frame: PhysicalAddress) {
            frames().deallocate_frame(frame)
        }
    }

    fn interleaved(before: impl FnOnce() + Send + 'static) -> &'static dyn FrameAllocator {
        Box::leak(Box::new(Interleaved {
            before: spin::Mutex::new(Some(Box::new(before))),
        }))
    }

    fn map_with(object: Arc<VmObject>, start: usize, end: usize, prot: Protection) -> Map {
        let map = user_map(0x1000, 0x10000);
        let segment = Segment::new(object, va(start), va(end), prot).unwrap();
        map.insert(segment, MapFlags::FIXED).unwrap();
        map
    }

    #[test]
    fn uncovered_address_is_unmapped() {
        let map = map_with(VmObject::anonymous(frames()), 0x2000, 0x3000, Protection::READ_WRITE);
        assert_eq!(resolve(&map, va(0x1000), Access::Read), Err(VmError::Unmapped));
        assert_eq!(resolve(&map, va(0x3000), Access::Read), Err(VmError::Unmapped));
        assert_eq!(map.pmap().resident_count(), 0);
    }

    #[test]
    fn write_to_read_only_is_denied() {
        let object = VmObject::anonymous(frames());
        let map = map_with(Arc::clone(&object), 0x2000, 0x3000, Protection::READ);

        assert_eq!(resolve(&map, va(0x2010), Access::Write), Err(VmError::AccessDenied));
        assert_eq!(resolve(&map, va(0x2010), Access::Execute), Err(VmError::AccessDenied));
        assert_eq!(object.pager_calls(), 0);
        assert_eq!(resolve(&map, va(0x2010), Access::Read), Ok(()));
    }

    #[test]
    fn empty_protection_denies_everything() {
        let map = map_with(VmObject::anonymous(frames()), 0x2000, 0x3000, Protection::NONE);
        assert_eq!(resolve(&map, va(0x2000), Access::Read), Err(VmError::AccessDenied));
    }

    #[test]
    fn write_only_segment_denies_read() {
        let map = map_with(VmObject::anonymous(frames()), 0x2000, 0x3000, Protection::WRITE);
        assert_eq!(resolve(&map, va(0x2000), Access::Read), Err(VmError::AccessDenied));
        assert_eq!(resolve(&map, va(0x2000), Access::Write), Ok(()));
    }

    #[test]
    fn installs_exactly_one_translation() {
        let object = VmObject::anonymous(frames());
        let map = map_with(Arc::clone(&object), 0x2000, 0x6000, Protection::READ_WRITE);

        resolve(&map, va(0x4abc), Access::Write).unwrap();

        assert_eq!(map.pmap().resident_count(), 1);
        let (frame, prot) = map.pmap().extract(va(0x4000)).unwrap();
        assert_eq!(prot, Protection::READ_WRITE);
        assert_eq!(object.find_page(0x2000), Some(frame));
        assert_eq!(peek(frame, 0xabc), 0);
    }

    #[test]
    fn second_fault_reuses_resident_page() {
        let object = VmObject::anonymous(frames());
        let map = map_with(Arc::clone(&object), 0x2000, 0x3000, Protection::READ_WRITE);

        resolve(&map, va(0x2000), Access::Read).unwrap();
        let first = map.pmap().extract(va(0x2000));
        resolve(&map, va(0x2ff8), Access::Write).unwrap();

        assert_eq!(object.pager_calls(), 1);
        assert_eq!(map.pmap().extract(va(0x2000)), first);
        assert_eq!(map.pmap().resident_count(), 1);
    }

    #[test]
    fn unbacked_object_reports_unmapped() {
        let map = map_with(VmObject::unbacked(), 0x2000, 0x3000, Protection::READ);
        assert_eq!(resolve(&map, va(0x2000), Access::Read), Err(VmError::Unmapped));
        assert!(map.pmap().extract(va(0x2000)).is_none());
    }

    #[test]
    fn device_window_maps_fixed_frames() {
        let base = PhysicalAddress::new(0x40_0000);
        let object = VmObject::device(base, 2 * PAGE_SIZE);
        let map = map_with(object, 0x2000, 0x5000, Protection::READ_WRITE);

        resolve(&map, va(0x3000), Access::Read).unwrap();
        assert_eq!(map.pmap().extract(va(0x3000)).unwrap().0, base + PAGE_SIZE);
        // The segment is larger than the window it exposes.
        assert_eq!(resolve(&map, va(0x4000), Access::Read), Err(VmError::Unmapped));
    }

    #[test]
    fn segment_offset_selects_object_page() {
        let object = VmObject::anonymous(frames());
        let frame = object.fault(3 * PAGE_SIZE).unwrap();
        let map = user_map(0x1000, 0x10000);
        let segment =
            Segment::with_offset(object, 2 * PAGE_SIZE, va(0x8000), va(0xA000), Protection::READ)
                .unwrap();
        map.insert(segment, MapFlags::FIXED).unwrap();

        resolve(&map, va(0x9000), Access::Read).unwrap();
        assert_eq!(map.pmap().extract(va(0x9000)).unwrap().0, frame);
    }

    #[test]
    fn counts_faults() {
        let map = map_with(VmObject::anonymous(frames()), 0x2000, 0x3000, Protection::READ);
        let before = stats().total.load(Ordering::Relaxed);
        let failures = stats().failures.load(Ordering::Relaxed);

        resolve(&map, va(0x2000), Access::Read).unwrap();
        let _ = resolve(&map, va(0x8000), Access::Read);

        // Other tests fault concurrently, so only lower bounds hold.
        assert!(stats().total.load(Ordering::Relaxed) >= before + 2);
        assert!(stats().failures.load(Ordering::Relaxed) >= failures + 1);
    }

    #[test]
    fn concurrent_faults_share_one_frame() {
        let object = VmObject::anonymous(frames());
        let map = map_with(Arc::clone(&object), 0x2000, 0x3000, Protection::READ_WRITE);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| resolve(&map, va(0x2000), Access::Write).unwrap());
            }
        });

        assert_eq!(object.pager_calls(), 1);
        assert_eq!(object.resident_pages(), 1);
        assert_eq!(map.pmap().resident_count(), 1);
    }

    #[test]
    fn protect_during_page_in_is_honoured() {
        let map = Arc::new(user_map(0x1000, 0x10000));
        let during = Arc::clone(&map);
        let object = VmObject::anonymous(interleaved(move || {
            during
                .protect(va(0x2000), va(0x3000), Protection::READ)
                .unwrap();
        }));
        let segment =
            Segment::new(Arc::clone(&object), va(0x2000), va(0x3000), Protection::READ_WRITE)
                .unwrap();
        map.insert(segment, MapFlags::FIXED).unwrap();
        let retries = stats().retries.load(Ordering::Relaxed);

        assert_eq!(resolve(&map, va(0x2000), Access::Write), Err(VmError::AccessDenied));

        assert!(stats().retries.load(Ordering::Relaxed) >= retries + 1);
        assert!(map.pmap().extract(va(0x2000)).is_none());
        // The page is still covered, so the object keeps it.
        assert_eq!(object.resident_pages(), 1);
        assert_eq!(resolve(&map, va(0x2000), Access::Read), Ok(()));
        assert_eq!(map.pmap().extract(va(0x2000)).unwrap().1, Protection::READ);
    }

    #[test]
    fn shrink_during_page_in_gives_page_back() {
        let map = Arc::new(user_map(0x1000, 0x10000));
        let during = Arc::clone(&map);
        let object = VmObject::anonymous(interleaved(move || {
            during.resize(va(0x2000), va(0x3000)).unwrap();
        }));
        let weak = Arc::downgrade(&object);
        let segment =
            Segment::new(object, va(0x2000), va(0x4000), Protection::READ_WRITE).unwrap();
        map.insert(segment, MapFlags::FIXED).unwrap();
        let retries = stats().retries.load(Ordering::Relaxed);

        assert_eq!(resolve(&map, va(0x3000), Access::Write), Err(VmError::Unmapped));

        assert!(stats().retries.load(Ordering::Relaxed) >= retries + 1);
        assert_eq!(map.pmap().resident_count(), 0);
        let object = weak.upgrade().unwrap();
        assert_eq!(object.find_page(0x1000), None);
        assert_eq!(object.resident_pages(), 0);
    }

    #[test]
    fn translations_follow_segments_under_concurrent_changes() {
        let map = user_map(0x1000, 0x10000);
        let low = VmObject::anonymous(frames());
        let high = VmObject::anonymous(frames());
        let rw = Protection::READ_WRITE;
        map.insert(
            Segment::new(Arc::clone(&low), va(0x2000), va(0x6000), rw).unwrap(),
            MapFlags::FIXED,
        )
        .unwrap();
        map.insert(
            Segment::new(Arc::clone(&high), va(0x8000), va(0xA000), rw).unwrap(),
            MapFlags::FIXED,
        )
        .unwrap();

        let pages: Vec<usize> = (0x2000..0x6000)
            .step_by(PAGE_SIZE)
            .chain((0x8000..0xA000).step_by(PAGE_SIZE))
            .collect();

        std::thread::scope(|scope| {
            for worker in 0..3 {
                let (map, pages) = (&map, &pages);
                scope.spawn(move || {
                    for round in 0..200 {
                        for (i, page) in pages.iter().enumerate() {
                            let access = if (i + round + worker) % 2 == 0 {
                                Access::Write
                            } else {
                                Access::Read
                            };
                            let _ = resolve(map, va(*page), access);
                        }
                    }
                });
            }

            scope.spawn(|| {
                for _ in 0..200 {
                    map.protect(va(0x3000), va(0x4000), Protection::READ).unwrap();
                    map.resize(va(0x8000), va(0x9000)).unwrap();
                    map.protect(va(0x3000), va(0x4000), rw).unwrap();
                    map.resize(va(0x8000), va(0xA000)).unwrap();
                    map.remove_segment(va(0x8000)).unwrap();
                    let segment =
                        Segment::new(Arc::clone(&high), va(0x8000), va(0xA000), rw).unwrap();
                    map.insert(segment, MapFlags::FIXED).unwrap();
                }
            });
        });

        let segments = map.read();
        for page in (0x1000..0x10000).step_by(PAGE_SIZE) {
            let Some((frame, prot)) = map.pmap().extract(va(page)) else {
                continue;
            };
            let segment = segments
                .find(va(page))
                .unwrap_or_else(|| panic!("{:#x} is translated outside every segment", page));
            assert_eq!(prot, segment.protection(), "stale protection at {:#x}", page);
            assert_eq!(
                segment.object().find_page(segment.object_offset(va(page))),
                Some(frame),
                "{:#x} is translated to a page its object does not hold",
                page
            );
        }
    }
}
