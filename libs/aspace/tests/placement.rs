mod common;

use kaspace::arch::PAGE_SIZE;
use kaspace::test_utils::TestVmObject;
use kaspace::{AllocationStrategy, Error, MemoryType, Placement, Protection};

use crate::common::*;

const ANYWHERE: Placement = Placement::Anywhere { randomize: false };
const RANDOMIZED: Placement = Placement::Anywhere { randomize: true };

#[test_log::test]
fn first_fit_fills_the_address_space() {
    let mut aspace = aspace();

    for i in 0..16 {
        let region = mmap(&mut aspace, ANYWHERE, PAGE_SIZE, RW).unwrap();
        assert_eq!(region, range(0x1000 + i * PAGE_SIZE, PAGE_SIZE));
    }

    assert_eq!(
        mmap(&mut aspace, ANYWHERE, PAGE_SIZE, RW),
        Err(Error::NoMemory)
    );
    assert_eq!(aspace.region_tree().gaps().count(), 0);
    assert_consistent(&aspace);
}

#[test_log::test]
fn first_fit_reuses_holes() {
    let mut aspace = aspace();
    for _ in 0..4 {
        mmap(&mut aspace, ANYWHERE, 2 * PAGE_SIZE, RW).unwrap();
    }
    aspace.unmap_range(va(0x3000), 2 * PAGE_SIZE).unwrap();

    // too large for the hole
    let large = mmap(&mut aspace, ANYWHERE, 3 * PAGE_SIZE, RW).unwrap();
    assert_eq!(large, range(0x9000, 3 * PAGE_SIZE));

    let small = mmap(&mut aspace, ANYWHERE, PAGE_SIZE, RW).unwrap();
    assert_eq!(small, range(0x3000, PAGE_SIZE));
    assert_consistent(&aspace);
}

#[test_log::test]
fn aligned_placement() {
    let mut aspace = aspace();

    let region = aspace
        .allocate_region(
            ANYWHERE,
            PAGE_SIZE,
            4 * PAGE_SIZE,
            None,
            Protection::READ,
            AllocationStrategy::Reserve,
        )
        .unwrap()
        .range();
    assert_eq!(region, range(0x4000, PAGE_SIZE));

    // sub-page alignments round up to a page
    let region = aspace
        .allocate_region(
            ANYWHERE,
            0x10,
            0x10,
            None,
            Protection::READ,
            AllocationStrategy::Reserve,
        )
        .unwrap()
        .range();
    assert_eq!(region, range(0x1000, PAGE_SIZE));

    assert_eq!(
        aspace
            .allocate_region(
                ANYWHERE,
                PAGE_SIZE,
                3 * PAGE_SIZE,
                None,
                Protection::READ,
                AllocationStrategy::Reserve,
            )
            .map(|region| region.range()),
        Err(Error::InvalidArgument)
    );
}

#[test_log::test]
fn randomized_placement_never_overlaps() {
    let total = range(0x10_0000, 256 * PAGE_SIZE);
    let mut aspace = seeded_aspace(total, 42);

    let mut bases = Vec::new();
    for _ in 0..64 {
        let region = mmap(&mut aspace, RANDOMIZED, 2 * PAGE_SIZE, RW).unwrap();
        assert!(total.contains(region));
        bases.push(region.base());
    }

    assert!(
        !bases.is_sorted(),
        "randomized placements should not be handed out in address order"
    );
    assert_eq!(aspace.region_tree().len(), 64);
    assert_eq!(aspace.amount_virtual(), 128 * PAGE_SIZE);
    assert_consistent(&aspace);
}

#[test_log::test]
fn randomized_placement_is_reproducible() {
    let total = range(0x10_0000, 256 * PAGE_SIZE);

    let run = |seed| {
        let mut aspace = seeded_aspace(total, seed);
        (0..16)
            .map(|_| mmap(&mut aspace, RANDOMIZED, PAGE_SIZE, RW).unwrap())
            .collect::<Vec<_>>()
    };

    assert_eq!(run(7), run(7));
    assert_ne!(run(7), run(8));
}

#[test_log::test]
fn randomized_placement_falls_back_to_first_fit() {
    // 2^28 pages with only the last one free, probing virtually never lands on it
    let total = range(0x1_0000_0000, 1 << 40);
    let taken = total.size() - PAGE_SIZE;
    let mut aspace = seeded_aspace(total, 3);
    aspace
        .allocate_region_with_vmobject(
            Placement::Fixed(total.base()),
            taken,
            0,
            TestVmObject::anonymous(taken).into_arc(),
            0,
            Some("filler"),
            RW,
            false,
            MemoryType::Normal,
        )
        .unwrap();

    let last = mmap(&mut aspace, RANDOMIZED, PAGE_SIZE, RW).unwrap();
    assert_eq!(last, range(0x1_0000_0000 + taken, PAGE_SIZE));
    assert_eq!(
        mmap(&mut aspace, RANDOMIZED, PAGE_SIZE, RW),
        Err(Error::NoMemory)
    );
    assert_consistent(&aspace);
}

#[test_log::test]
fn randomize_without_rng_is_first_fit() {
    let mut aspace = aspace();
    let region = mmap(&mut aspace, RANDOMIZED, 2 * PAGE_SIZE, RW).unwrap();
    assert_eq!(region, range(0x1000, 2 * PAGE_SIZE));
}
