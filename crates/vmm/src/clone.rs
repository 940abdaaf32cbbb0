//! Address space duplication for process creation.

use alloc::sync::Arc;
use alloc::vec::Vec;

use pmm::PmapKind;

use crate::{Map, Result, VmError, object::VmObject};

/// Duplicates `source` into a fresh user address space.
///
/// Every segment is copied in order with the same placement and protection, bound to a
/// duplicate of its object. Segments that share an object in the source share its single
/// duplicate in the clone. The new pmap starts empty apart from the kernel half it
/// shares with the source; user translations come back through faults.
///
/// The source's segment table stays read-locked for the whole copy, so the clone is a
/// consistent snapshot. Cloning the kernel space fails with [`VmError::NotSupported`].
pub fn clone_map(source: &Map) -> Result<Map> {
    let pmap = source.pmap();
    if pmap.kind() != PmapKind::User {
        return Err(VmError::NotSupported);
    }

    let segments = source.read();
    let mut duplicates: Vec<(Arc<VmObject>, Arc<VmObject>)> = Vec::new();
    let mut copied = Vec::with_capacity(segments.len());

    for segment in segments.iter() {
        let original = segment.object();
        let duplicate = match duplicates.iter().find(|(o, _)| Arc::ptr_eq(o, original)) {
            Some((_, duplicate)) => Arc::clone(duplicate),
            None => {
                let duplicate = original.duplicate();
                duplicates.push((Arc::clone(original), Arc::clone(&duplicate)));
                duplicate
            }
        };
        copied.push(segment.rebind(duplicate));
    }

    log::debug!(
        "cloned address space {} - {}: {} segments, {} objects",
        pmap.start(),
        pmap.end(),
        copied.len(),
        duplicates.len()
    );

    Ok(Map::from_parts(pmap.new_like(), copied))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{frames, peek, poke, user_map, va};
    use crate::{Access, MapFlags, Pmap, Protection, Segment, SpaceRegistry, resolve};

    fn populated() -> Map {
        let map = user_map(0x1000, 0x20000);
        let layout = [
            (0x2000, 0x4000, Protection::READ | Protection::EXEC),
            (0x6000, 0x7000, Protection::READ),
            (0x9000, 0xC000, Protection::READ_WRITE),
        ];
        for (start, end, prot) in layout {
            let segment =
                Segment::new(VmObject::anonymous(frames()), va(start), va(end), prot).unwrap();
            map.insert(segment, MapFlags::FIXED).unwrap();
        }
        map
    }

    #[test]
    fn clone_matches_layout_with_new_objects() {
        let source = populated();
        let clone = clone_map(&source).unwrap();

        assert_eq!(clone.segments(), source.segments());
        assert_eq!(clone.range(), source.range());

        let (a, b) = (source.read(), clone.read());
        for (original, copy) in a.iter().zip(b.iter()) {
            assert!(!Arc::ptr_eq(original.object(), copy.object()));
        }
    }

    #[test]
    fn clone_starts_without_translations() {
        let source = populated();
        resolve(&source, va(0x9000), Access::Write).unwrap();

        let clone = clone_map(&source).unwrap();
        assert_eq!(clone.pmap().resident_count(), 0);
        assert_ne!(clone.pmap().root(), source.pmap().root());
    }

    #[test]
    fn clone_copies_contents() {
        let source = populated();
        resolve(&source, va(0xA000), Access::Write).unwrap();
        let (frame, _) = source.pmap().extract(va(0xA000)).unwrap();
        poke(frame, 7, 0xC3);

        let clone = clone_map(&source).unwrap();
        resolve(&clone, va(0xA000), Access::Read).unwrap();
        let (copied, _) = clone.pmap().extract(va(0xA000)).unwrap();

        assert_ne!(copied, frame);
        assert_eq!(peek(copied, 7), 0xC3);

        poke(copied, 7, 0x01);
        assert_eq!(peek(frame, 7), 0xC3);
    }

    #[test]
    fn clone_survives_source_deletion() {
        let source = Arc::new(populated());
        resolve(&source, va(0x9000), Access::Write).unwrap();
        let (frame, _) = source.pmap().extract(va(0x9000)).unwrap();
        poke(frame, 0, 0x42);

        let clone = clone_map(&source).unwrap();
        let layout = clone.segments();
        Map::delete(source);

        assert_eq!(clone.segments(), layout);
        resolve(&clone, va(0x9000), Access::Read).unwrap();
        let (copied, _) = clone.pmap().extract(va(0x9000)).unwrap();
        assert_eq!(peek(copied, 0), 0x42);
    }

    #[test]
    fn split_segments_share_one_duplicate() {
        let source = user_map(0x1000, 0x10000);
        let segment = Segment::new(
            VmObject::anonymous(frames()),
            va(0x2000),
            va(0x5000),
            Protection::READ_WRITE,
        )
        .unwrap();
        source.insert(segment, MapFlags::FIXED).unwrap();
        source.protect(va(0x3000), va(0x4000), Protection::READ).unwrap();

        let clone = clone_map(&source).unwrap();
        let segments = clone.read();
        assert_eq!(segments.len(), 3);

        let objects: Vec<_> = segments.iter().map(|s| s.object()).collect();
        assert!(Arc::ptr_eq(objects[0], objects[1]));
        assert!(Arc::ptr_eq(objects[1], objects[2]));
    }

    #[test]
    fn empty_map_clones_to_empty_map() {
        let source = user_map(0x1000, 0x10000);
        let clone = clone_map(&source).unwrap();
        assert!(clone.is_empty());
    }

    #[test]
    fn clone_keeps_kernel_half() {
        frames();
        let registry = SpaceRegistry::new(Map::with_pmap(Pmap::new(PmapKind::Kernel)));
        let source = registry.new_user_map();
        let clone = clone_map(&source).unwrap();

        assert!(clone.pmap().has_kernel_half());
        assert_eq!(clone.range(), source.range());
        assert!(!user_map(0x1000, 0x10000).pmap().has_kernel_half());
    }

    #[test]
    fn kernel_space_cannot_be_cloned() {
        frames();
        let kernel = Map::with_pmap(Pmap::new(PmapKind::Kernel));
        assert_eq!(clone_map(&kernel).err(), Some(VmError::NotSupported));
    }
}
