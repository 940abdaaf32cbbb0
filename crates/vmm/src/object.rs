//! Backing memory objects.
//!
//! A [`VmObject`] supplies the physical frames behind a segment. Segments address it by
//! page offset; how a missing page is produced is decided by its [`Pager`]. Objects are
//! reference counted so that a segment split in two keeps sharing one object.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use pmm::{FrameAllocator, PAGE_SIZE, PhysicalAddress, copy_frame, zero_frame};

/// How an object produces pages it does not have yet.
pub enum Pager {
    /// Zero-filled frames on first touch. Duplicating copies every resident page.
    Anonymous { frames: &'static dyn FrameAllocator },
    /// A fixed window of physical memory, e.g. device registers or a framebuffer.
    /// Duplicates share the same frames.
    Device { base: PhysicalAddress, size: usize },
    /// Never produces a page. Faults on it always fail.
    Unbacked,
}

/// A memory object: a sparse set of resident pages keyed by offset, plus a pager.
pub struct VmObject {
    pager: Pager,
    pages: spin::Mutex<BTreeMap<usize, PhysicalAddress>>,
    /// Number of pages the pager produced and the object kept.
    pager_calls: AtomicUsize,
}

impl VmObject {
    fn with_pager(pager: Pager) -> Arc<Self> {
        Arc::new(Self {
            pager,
            pages: spin::Mutex::new(BTreeMap::new()),
            pager_calls: AtomicUsize::new(0),
        })
    }

    /// Creates an anonymous object drawing zeroed frames from `frames`.
    pub fn anonymous(frames: &'static dyn FrameAllocator) -> Arc<Self> {
        Self::with_pager(Pager::Anonymous { frames })
    }

    /// Creates an object exposing `size` bytes of physical memory starting at `base`.
    pub fn device(base: PhysicalAddress, size: usize) -> Arc<Self> {
        debug_assert!(base.is_page_aligned(), "device window must be page-aligned");
        Self::with_pager(Pager::Device { base, size })
    }

    /// Creates an object whose pages can never be produced.
    pub fn unbacked() -> Arc<Self> {
        Self::with_pager(Pager::Unbacked)
    }

    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    /// Returns the resident frame at `offset`, if the object already has one.
    pub fn find_page(&self, offset: usize) -> Option<PhysicalAddress> {
        debug_assert!(offset % PAGE_SIZE == 0, "object offsets are page-aligned");
        self.pages.lock().get(&offset).copied()
    }

    /// Asks the pager to produce the page at `offset`.
    ///
    /// The pager runs without the object lock held, so it may block or call back into
    /// the memory system. Concurrent faults on the same offset still agree on one frame:
    /// whoever installs second throws its own page away and returns the first one.
    pub fn fault(&self, offset: usize) -> Option<PhysicalAddress> {
        debug_assert!(offset % PAGE_SIZE == 0, "object offsets are page-aligned");
        if let Some(frame) = self.find_page(offset) {
            return Some(frame);
        }

        let produced = match &self.pager {
            Pager::Anonymous { frames } => {
                let frame = frames.allocate_frame()?;
                zero_frame(frame);
                frame
            }
            Pager::Device { base, size } => {
                if offset >= *size {
                    return None;
                }
                *base + offset
            }
            Pager::Unbacked => return None,
        };

        let mut pages = self.pages.lock();
        if let Some(frame) = pages.get(&offset) {
            if let Pager::Anonymous { frames } = &self.pager {
                frames.deallocate_frame(produced);
            }
            return Some(*frame);
        }
        self.pager_calls.fetch_add(1, Ordering::Relaxed);
        pages.insert(offset, produced);
        Some(produced)
    }

    /// Creates a new object with the same contents.
    ///
    /// Anonymous objects are copied eagerly, page by page; device windows are shared.
    ///
    /// # Panics
    /// Panics if physical memory runs out while copying.
    pub fn duplicate(&self) -> Arc<Self> {
        match &self.pager {
            Pager::Anonymous { frames } => {
                let copy = Self::anonymous(*frames);
                {
                    let source = self.pages.lock();
                    let mut target = copy.pages.lock();
                    for (offset, frame) in source.iter() {
                        let new_frame = frames
                            .allocate_frame()
                            .expect("out of physical memory while duplicating an object");
                        copy_frame(*frame, new_frame);
                        target.insert(*offset, new_frame);
                    }
                }
                copy
            }
            Pager::Device { base, size } => Self::device(*base, *size),
            Pager::Unbacked => Self::unbacked(),
        }
    }

    /// Drops every resident page in `[start, end)`, returning anonymous frames to
    /// their allocator. Returns how many pages were dropped.
    pub fn release_range(&self, start: usize, end: usize) -> usize {
        let mut pages = self.pages.lock();
        let mut released = 0;
        pages.retain(|offset, frame| {
            if *offset < start || *offset >= end {
                return true;
            }
            if let Pager::Anonymous { frames } = &self.pager {
                frames.deallocate_frame(*frame);
            }
            released += 1;
            false
        });
        released
    }

    /// Number of pages currently resident.
    pub fn resident_pages(&self) -> usize {
        self.pages.lock().len()
    }

    /// Number of pages the pager materialized for this object.
    pub fn pager_calls(&self) -> usize {
        self.pager_calls.load(Ordering::Relaxed)
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        if let Pager::Anonymous { frames } = &self.pager {
            for frame in self.pages.get_mut().values() {
                frames.deallocate_frame(*frame);
            }
        }
    }
}

impl fmt::Display for VmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pager {
            Pager::Anonymous { .. } => {
                write!(f, "anonymous object, {} resident pages", self.resident_pages())
            }
            Pager::Device { base, size } => write!(f, "device object at {} (+{:#x})", base, size),
            Pager::Unbacked => write!(f, "unbacked object"),
        }
    }
}

impl fmt::Debug for VmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VmObject({})", self)
    }
}
