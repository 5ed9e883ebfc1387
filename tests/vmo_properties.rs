//! Property-based tests for memory objects
//!
//! Random sizes, offsets and buffers against the object invariants:
//! page-rounded sizes, clipped transfers, write/read agreement and
//! mapping consistency across shrinks.

use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use vmkern::vm::{AddressRegion, PagePool, VmMapping, VmObject, PAGE_SIZE};

const PAGE: u64 = PAGE_SIZE as u64;
const MAX: u64 = 1 << 40;

/// Region that records every unmap request
#[derive(Default)]
struct Region {
    unmaps: Mutex<Vec<(u64, u64)>>,
}

impl AddressRegion for Region {
    fn unmap(&self, base: u64, len: u64) {
        self.unmaps.lock().unwrap().push((base, len));
    }
}

// ════════════════════════════════════════════════════════════
// Size Properties
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Created size is the request rounded up to a page
    #[test]
    fn create_rounds_to_pages(size in 0u64..(64 * PAGE)) {
        let pool = PagePool::new(1).unwrap();
        let vmo = VmObject::create_paged(&pool, size, MAX).unwrap();
        let expected = (size + PAGE - 1) / PAGE * PAGE;
        prop_assert_eq!(vmo.size(), expected);
        prop_assert_eq!(vmo.committed_pages(), 0);
    }

    /// Transfers starting at or past the end move nothing and do not fail
    #[test]
    fn transfers_past_end_are_empty(pages in 0u64..4, past in 0u64..(4 * PAGE), len in 0usize..512) {
        let pool = PagePool::new(4).unwrap();
        let vmo = VmObject::create_paged(&pool, pages * PAGE, MAX).unwrap();
        let offset = vmo.size() + past;

        let mut buf = vec![0u8; len];
        prop_assert_eq!(vmo.read(&mut buf, offset).unwrap(), 0);
        prop_assert_eq!(vmo.write(&buf, offset).unwrap(), 0);
        prop_assert_eq!(pool.available(), 4);
    }
}

// ════════════════════════════════════════════════════════════
// Data Properties
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Whatever is written in range reads back unchanged
    #[test]
    fn write_then_read_agrees(
        offset in 0u64..(3 * PAGE),
        data in proptest::collection::vec(any::<u8>(), 1..(2 * PAGE_SIZE)),
    ) {
        let pool = PagePool::new(8).unwrap();
        let vmo = VmObject::create_paged(&pool, 5 * PAGE, MAX).unwrap();

        prop_assert_eq!(vmo.write(&data, offset).unwrap(), data.len());
        let mut back = vec![0u8; data.len()];
        prop_assert_eq!(vmo.read(&mut back, offset).unwrap(), data.len());
        prop_assert_eq!(back, data);
    }

    /// A transfer crossing the end is clipped to the bytes that exist
    #[test]
    fn transfers_clip_at_end(back_off in 1u64..PAGE, len in 1usize..(2 * PAGE_SIZE)) {
        let pool = PagePool::new(2).unwrap();
        let vmo = VmObject::create_paged(&pool, 2 * PAGE, MAX).unwrap();
        let offset = 2 * PAGE - back_off;
        let expected = len.min(back_off as usize);

        let data = vec![0x3Cu8; len];
        prop_assert_eq!(vmo.write(&data, offset).unwrap(), expected);
        let mut out = vec![0u8; len];
        prop_assert_eq!(vmo.read(&mut out, offset).unwrap(), expected);
        prop_assert!(out[..expected].iter().all(|&b| b == 0x3C));
    }
}

// ════════════════════════════════════════════════════════════
// Mapping Properties
// ════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// After a shrink no mapping reaches past the new size
    #[test]
    fn shrink_leaves_no_mapping_past_end(
        spans in proptest::collection::vec((0u64..8, 1u64..8), 1..6),
        new_pages in 0u64..8,
    ) {
        let pool = PagePool::new(1).unwrap();
        let vmo = VmObject::create_paged(&pool, 8 * PAGE, MAX).unwrap();
        let region = Arc::new(Region::default());

        let mut mappings = Vec::new();
        for (i, (start, len)) in spans.iter().enumerate() {
            let len = (*len).min(8 - start);
            if len == 0 {
                continue;
            }
            let base = 0x1000_0000 * (i as u64 + 1);
            mappings.push(
                VmMapping::create(&vmo, region.clone(), base, start * PAGE, len * PAGE).unwrap(),
            );
        }
        let overlapping = mappings
            .iter()
            .filter(|m| m.object_offset() + m.len() > new_pages * PAGE)
            .count();

        vmo.set_size(new_pages * PAGE).unwrap();

        prop_assert_eq!(region.unmaps.lock().unwrap().len(), overlapping);
        for m in &mappings {
            prop_assert!(m.object_offset() + m.len() <= new_pages * PAGE || m.is_empty());
        }
        prop_assert_eq!(vmo.mapping_count(), mappings.len());

        drop(mappings);
        prop_assert_eq!(vmo.mapping_count(), 0);
    }
}

#[test]
fn every_mapping_notified_on_full_shrink() {
    let pool = PagePool::new(1).unwrap();
    let vmo = VmObject::create_paged(&pool, 4 * PAGE, MAX).unwrap();
    let region = Arc::new(Region::default());

    let mappings: Vec<_> = (0..4)
        .map(|i| VmMapping::create(&vmo, region.clone(), i * 0x10_0000, i * PAGE, PAGE).unwrap())
        .collect();

    vmo.set_size(0).unwrap();
    assert_eq!(region.unmaps.lock().unwrap().len(), vmo.mapping_count());
    assert!(mappings.iter().all(|m| m.is_empty()));
}

#[test]
fn mapping_keeps_object_alive() {
    let pool = PagePool::new(1).unwrap();
    let vmo = VmObject::create_paged(&pool, PAGE, MAX).unwrap();
    vmo.write(b"kept", 0).unwrap();
    let region: Arc<dyn AddressRegion> = Arc::new(Region::default());
    let mapping = VmMapping::create(&vmo, region, 0, 0, PAGE).unwrap();

    let weak = Arc::downgrade(&vmo);
    drop(vmo);
    assert!(weak.upgrade().is_some());
    assert_eq!(pool.available(), 0);

    drop(mapping);
    assert!(weak.upgrade().is_none());
    assert_eq!(pool.available(), 1);
}
