#![allow(unused, reason = "not used by all tests")]

use std::sync::Arc;

use kaspace::arch::PAGE_SIZE;
use kaspace::test_utils::TestPageDirectory;
use kaspace::{
    AddressSpace, AllocationStrategy, Placement, Protection, VirtualAddress, VirtualRange,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// Total range of the small address spaces most tests use: 16 pages starting at `0x1000`.
pub const TOTAL: VirtualRange = VirtualRange::new(VirtualAddress::new(0x1000), 16 * PAGE_SIZE);

pub const RW: Protection = Protection::READ.union(Protection::WRITE);

pub fn va(raw: usize) -> VirtualAddress {
    VirtualAddress::new(raw)
}

pub fn range(base: usize, size: usize) -> VirtualRange {
    VirtualRange::new(VirtualAddress::new(base), size)
}

pub fn aspace_with(total: VirtualRange) -> AddressSpace<TestPageDirectory> {
    AddressSpace::with_total_range(Arc::new(TestPageDirectory::new()), total, None).unwrap()
}

pub fn aspace() -> AddressSpace<TestPageDirectory> {
    aspace_with(TOTAL)
}

pub fn seeded_aspace(total: VirtualRange, seed: u8) -> AddressSpace<TestPageDirectory> {
    AddressSpace::with_total_range(
        Arc::new(TestPageDirectory::new()),
        total,
        Some(ChaCha20Rng::from_seed([seed; 32])),
    )
    .unwrap()
}

/// Allocates an anonymous `mmap` region the way the syscall layer would.
pub fn mmap(
    aspace: &mut AddressSpace<TestPageDirectory>,
    placement: Placement,
    size: usize,
    prot: Protection,
) -> kaspace::Result<VirtualRange> {
    let region = aspace.allocate_region(
        placement,
        size,
        0,
        Some("mmap"),
        prot,
        AllocationStrategy::Reserve,
    )?;
    region.set_mmap(true);
    Ok(region.range())
}

pub fn mmap_fixed(
    aspace: &mut AddressSpace<TestPageDirectory>,
    base: usize,
    size: usize,
) -> VirtualRange {
    mmap(aspace, Placement::Fixed(va(base)), size, RW).unwrap()
}

/// Region ranges in address order.
pub fn layout(aspace: &AddressSpace<TestPageDirectory>) -> Vec<VirtualRange> {
    aspace.regions().map(|region| region.range()).collect()
}

/// Checks the tree invariants and that the page directory agrees with the tree.
pub fn assert_consistent(aspace: &AddressSpace<TestPageDirectory>) {
    aspace.assert_valid("");
    aspace
        .page_directory()
        .assert_matches_regions(aspace.regions());

    for region in aspace.regions() {
        assert_eq!(
            region.is_mapped(),
            !region.access().is_empty(),
            "only accessible regions are mapped; region={region:?}"
        );
    }
}
