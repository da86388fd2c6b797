mod common;

use std::sync::Arc;

use kaspace::arch::PAGE_SIZE;
use kaspace::test_utils::{TestPageDirectory, TestVmObject};
use kaspace::{
    Access, AddressSpace, AllocationStrategy, AnonymousVmObject, Error, MappingState, MemoryType,
    Placement, Protection, TeardownContext, VirtualRange, VmObject, VmObjectId,
};

use crate::common::*;

#[test_log::test]
fn unmapping_inside_a_region_splits_it() {
    let mut aspace = aspace();

    let a = aspace
        .allocate_region(
            Placement::Fixed(va(0x1000)),
            4 * PAGE_SIZE,
            0,
            Some("A"),
            RW,
            AllocationStrategy::Reserve,
        )
        .unwrap();
    a.set_mmap(true);
    let a_range = a.range();
    let a_vmobject = VmObjectId::of(a.vmobject());

    let b = mmap(&mut aspace, Placement::Anywhere { randomize: false }, 4 * PAGE_SIZE, RW)
        .unwrap();
    assert!(!b.intersects(a_range));

    aspace.unmap_range(va(0x2000), 0x1000).unwrap();

    let head = aspace.find_region_from_range(range(0x1000, 0x1000)).unwrap();
    assert_eq!(head.offset_in_vmobject(), 0);
    assert_eq!(VmObjectId::of(head.vmobject()), a_vmobject);
    assert_eq!(head.name(), Some("A"));
    assert!(head.is_mmap());

    let tail = aspace.find_region_from_range(range(0x3000, 0x2000)).unwrap();
    assert_eq!(tail.offset_in_vmobject(), 0x2000);
    assert_eq!(VmObjectId::of(tail.vmobject()), a_vmobject);

    assert_eq!(layout(&aspace), [range(0x1000, 0x1000), range(0x3000, 0x2000), b]);
    assert_consistent(&aspace);
}

#[test_log::test]
fn split_round_trip() {
    let mut aspace = aspace();
    mmap_fixed(&mut aspace, 0x1000, 8 * PAGE_SIZE);
    let original = VmObjectId::of(aspace.regions().next().unwrap().vmobject());

    aspace.unmap_range(va(0x3000), 2 * PAGE_SIZE).unwrap();
    let hole = mmap_fixed(&mut aspace, 0x3000, 2 * PAGE_SIZE);
    assert_eq!(hole, range(0x3000, 2 * PAGE_SIZE));

    assert_eq!(
        layout(&aspace),
        [
            range(0x1000, 2 * PAGE_SIZE),
            range(0x3000, 2 * PAGE_SIZE),
            range(0x5000, 4 * PAGE_SIZE)
        ]
    );

    let regions: Vec<_> = aspace.regions().collect();
    assert_eq!(VmObjectId::of(regions[0].vmobject()), original);
    assert_eq!(VmObjectId::of(regions[2].vmobject()), original);
    assert_ne!(VmObjectId::of(regions[1].vmobject()), original);
    assert_eq!(regions[0].offset_in_vmobject(), 0);
    assert_eq!(regions[2].offset_in_vmobject(), 4 * PAGE_SIZE);

    assert_consistent(&aspace);
}

#[test_log::test]
fn exact_unmap_is_idempotent() {
    let mut aspace = aspace();
    let region = mmap_fixed(&mut aspace, 0x4000, 2 * PAGE_SIZE);

    aspace.unmap_range(region.base(), region.size()).unwrap();
    assert!(aspace.region_tree().is_empty());
    assert!(aspace.page_directory().mapped_ranges().is_empty());

    aspace.unmap_range(region.base(), region.size()).unwrap();
    assert!(aspace.region_tree().is_empty());
}

#[test_log::test]
fn unmap_expands_to_page_boundaries() {
    let mut aspace = aspace();
    mmap_fixed(&mut aspace, 0x1000, 4 * PAGE_SIZE);

    // touches the second and third page
    aspace.unmap_range(va(0x2ff0), 0x20).unwrap();

    assert_eq!(
        layout(&aspace),
        [range(0x1000, PAGE_SIZE), range(0x4000, PAGE_SIZE)]
    );
    assert_consistent(&aspace);
}

#[test_log::test]
fn unmap_across_multiple_regions() {
    let mut aspace = aspace();
    mmap_fixed(&mut aspace, 0x1000, 2 * PAGE_SIZE);
    mmap_fixed(&mut aspace, 0x3000, 2 * PAGE_SIZE);
    mmap_fixed(&mut aspace, 0x5000, 2 * PAGE_SIZE);
    mmap_fixed(&mut aspace, 0x9000, 2 * PAGE_SIZE);

    aspace.unmap_range(va(0x2000), 4 * PAGE_SIZE).unwrap();

    assert_eq!(
        layout(&aspace),
        [
            range(0x1000, PAGE_SIZE),
            range(0x6000, PAGE_SIZE),
            range(0x9000, 2 * PAGE_SIZE)
        ]
    );
    let tail = aspace.find_region_from_range(range(0x6000, PAGE_SIZE)).unwrap();
    assert_eq!(tail.offset_in_vmobject(), PAGE_SIZE);
    assert_consistent(&aspace);
}

#[test_log::test]
fn multi_region_unmap_is_all_or_nothing() {
    let mut aspace = aspace();
    mmap_fixed(&mut aspace, 0x1000, 2 * PAGE_SIZE);
    mmap_fixed(&mut aspace, 0x3000, 2 * PAGE_SIZE);
    mmap_fixed(&mut aspace, 0x5000, 2 * PAGE_SIZE);
    aspace.set_range_immutable(va(0x3000), 2 * PAGE_SIZE).unwrap();

    let before = layout(&aspace);
    let mapped_before = aspace.page_directory().mapped_ranges();

    assert_eq!(
        aspace.unmap_range(va(0x2000), 4 * PAGE_SIZE),
        Err(Error::PermissionDenied)
    );

    assert_eq!(layout(&aspace), before);
    assert_eq!(aspace.page_directory().mapped_ranges(), mapped_before);
    assert_consistent(&aspace);
}

#[test_log::test]
fn only_user_modifiable_regions_can_be_unmapped() {
    let mut aspace = aspace();
    aspace
        .allocate_region(
            Placement::Fixed(va(0x1000)),
            4 * PAGE_SIZE,
            0,
            Some("kernel owned"),
            RW,
            AllocationStrategy::Reserve,
        )
        .unwrap();

    assert_eq!(
        aspace.unmap_range(va(0x1000), 4 * PAGE_SIZE),
        Err(Error::PermissionDenied)
    );
    assert_eq!(
        aspace.unmap_range(va(0x2000), PAGE_SIZE),
        Err(Error::PermissionDenied)
    );
    assert_eq!(layout(&aspace), [range(0x1000, 4 * PAGE_SIZE)]);

    let sealed = mmap_fixed(&mut aspace, 0x8000, PAGE_SIZE);
    aspace
        .set_range_immutable(sealed.base(), sealed.size())
        .unwrap();
    assert_eq!(
        aspace.unmap_range(sealed.base(), sealed.size()),
        Err(Error::PermissionDenied)
    );
}

#[test_log::test]
fn unmap_argument_checks() {
    let mut aspace = aspace();

    assert_eq!(aspace.unmap_range(va(0x1000), 0), Err(Error::InvalidArgument));
    assert_eq!(
        aspace.unmap_range(va(usize::MAX - 0x10), 0x20),
        Err(Error::InvalidArgument)
    );
    assert_eq!(aspace.unmap_range(va(0x0), PAGE_SIZE), Err(Error::Fault));
    assert_eq!(
        aspace.unmap_range(va(0x10000), 2 * PAGE_SIZE),
        Err(Error::Fault)
    );
    // nothing mapped here
    assert_eq!(aspace.unmap_range(va(0x4000), PAGE_SIZE), Ok(()));
}

#[test_log::test]
fn fixed_placement_errors() {
    let mut aspace = aspace();
    mmap_fixed(&mut aspace, 0x2000, 2 * PAGE_SIZE);

    assert_eq!(
        mmap(&mut aspace, Placement::Fixed(va(0x3000)), PAGE_SIZE, RW),
        Err(Error::AddressInUse)
    );
    assert_eq!(
        mmap(&mut aspace, Placement::Fixed(va(0x3800)), PAGE_SIZE, RW),
        Err(Error::InvalidArgument)
    );
    assert_eq!(
        mmap(&mut aspace, Placement::Fixed(va(0x10000)), 2 * PAGE_SIZE, RW),
        Err(Error::Fault)
    );
    assert_eq!(
        mmap(&mut aspace, Placement::Anywhere { randomize: false }, 0, RW),
        Err(Error::InvalidArgument)
    );
    assert_eq!(layout(&aspace), [range(0x2000, 2 * PAGE_SIZE)]);
}

#[test_log::test]
fn vmobject_window_validation() {
    let mut aspace = aspace();
    let vmobject = TestVmObject::anonymous(4 * PAGE_SIZE).into_arc();

    let mut allocate = |offset: usize, size: usize| {
        aspace
            .allocate_region_with_vmobject(
                Placement::Anywhere { randomize: false },
                size,
                0,
                vmobject.clone(),
                offset,
                None,
                Protection::READ,
                false,
                MemoryType::Normal,
            )
            .map(|region| region.range())
    };

    assert_eq!(allocate(4 * PAGE_SIZE, PAGE_SIZE), Err(Error::InvalidArgument));
    assert_eq!(allocate(2 * PAGE_SIZE, 3 * PAGE_SIZE), Err(Error::InvalidArgument));
    assert_eq!(allocate(0x800, PAGE_SIZE), Err(Error::InvalidArgument));
    assert_eq!(
        allocate(2 * PAGE_SIZE, 2 * PAGE_SIZE),
        Ok(range(0x1000, 2 * PAGE_SIZE))
    );
}

#[test_log::test]
fn failed_mapping_rolls_back_the_placement() {
    let mut aspace = aspace();
    let vmobject = TestVmObject::anonymous(2 * PAGE_SIZE).into_arc();

    aspace.page_directory().fail_next_map();
    let err = aspace
        .allocate_region_with_vmobject(
            Placement::Fixed(va(0x4000)),
            2 * PAGE_SIZE,
            0,
            vmobject.clone(),
            0,
            Some("rolled back"),
            RW,
            true,
            MemoryType::Normal,
        )
        .unwrap_err();

    assert_eq!(err, Error::NoMemory);
    assert!(aspace.region_tree().is_empty());
    assert_eq!(aspace.region_tree().gaps().count(), 1);
    // the vmobject is only referenced by us again
    assert_eq!(Arc::strong_count(&vmobject), 1);

    // the range is free again
    let region = aspace
        .allocate_region_with_vmobject(
            Placement::Fixed(va(0x4000)),
            2 * PAGE_SIZE,
            0,
            vmobject,
            0,
            Some("second try"),
            RW,
            true,
            MemoryType::Normal,
        )
        .unwrap();
    assert!(region.is_shared());
    assert_consistent(&aspace);
}

#[test_log::test]
fn inaccessible_regions_are_mapped_lazily() {
    let mut aspace = aspace();
    let vmobject = TestVmObject::anonymous(4 * PAGE_SIZE).into_arc();

    let region = aspace
        .allocate_region_with_vmobject(
            Placement::Fixed(va(0x2000)),
            4 * PAGE_SIZE,
            0,
            vmobject,
            0,
            Some("guard"),
            Protection::NONE,
            false,
            MemoryType::Normal,
        )
        .unwrap();
    region.set_mmap(true);
    let range = region.range();

    assert_eq!(region.mapping_state(), MappingState::Attached);
    assert_eq!(aspace.page_directory().map_count(), 0);

    aspace
        .protect_range(range.base(), range.size(), Protection::READ)
        .unwrap();
    assert_eq!(
        aspace.page_directory().mapped_access(range),
        Some(Access::READ)
    );

    aspace
        .protect_range(range.base(), range.size(), Protection::NONE)
        .unwrap();
    assert!(aspace.page_directory().mapped_ranges().is_empty());
    assert_eq!(
        aspace.find_region_from_range(range).unwrap().mapping_state(),
        MappingState::Attached
    );
    assert_consistent(&aspace);
}

#[test_log::test]
fn protect_splits_partially_covered_regions() {
    let mut aspace = aspace();
    mmap_fixed(&mut aspace, 0x1000, 4 * PAGE_SIZE);
    mmap_fixed(&mut aspace, 0x5000, 2 * PAGE_SIZE);

    aspace
        .protect_range(va(0x2000), 4 * PAGE_SIZE, Protection::READ)
        .unwrap();

    let regions: Vec<_> = aspace
        .regions()
        .map(|region| (region.range(), region.access(), region.offset_in_vmobject()))
        .collect();
    let rw = Access::READ | Access::WRITE;
    assert_eq!(
        regions,
        [
            (range(0x1000, PAGE_SIZE), rw, 0),
            (range(0x2000, 3 * PAGE_SIZE), Access::READ, PAGE_SIZE),
            (range(0x5000, PAGE_SIZE), Access::READ, 0),
            (range(0x6000, PAGE_SIZE), rw, PAGE_SIZE),
        ]
    );
    assert!(aspace.regions().all(|region| region.is_mmap()));
    assert_consistent(&aspace);
}

#[test_log::test]
fn protect_rejections_leave_everything_untouched() {
    let mut aspace = aspace();
    mmap_fixed(&mut aspace, 0x1000, 2 * PAGE_SIZE);
    mmap_fixed(&mut aspace, 0x4000, 2 * PAGE_SIZE);
    let before = layout(&aspace);

    // there is a hole at 0x3000
    assert_eq!(
        aspace.protect_range(va(0x1000), 5 * PAGE_SIZE, Protection::READ),
        Err(Error::Fault)
    );
    assert_eq!(
        aspace.protect_range(va(0x10000), 2 * PAGE_SIZE, Protection::READ),
        Err(Error::Fault)
    );

    aspace.set_range_immutable(va(0x4000), 2 * PAGE_SIZE).unwrap();
    // the writable part before the sealed region must not change either
    assert_eq!(
        aspace.protect_range(va(0x2000), 3 * PAGE_SIZE, Protection::READ),
        Err(Error::PermissionDenied)
    );
    assert_eq!(
        aspace.protect_range(va(0x4000), PAGE_SIZE, Protection::READ),
        Err(Error::PermissionDenied)
    );

    assert_eq!(layout(&aspace), before);
    assert!(
        aspace
            .regions()
            .all(|region| region.access() == Access::READ | Access::WRITE)
    );
    assert_consistent(&aspace);
}

#[test_log::test]
fn sealing() {
    let mut aspace = aspace();
    aspace
        .allocate_region(
            Placement::Fixed(va(0x1000)),
            PAGE_SIZE,
            0,
            None,
            RW,
            AllocationStrategy::Reserve,
        )
        .unwrap();
    mmap_fixed(&mut aspace, 0x4000, 2 * PAGE_SIZE);

    assert_eq!(
        aspace.set_range_immutable(va(0x1000), PAGE_SIZE),
        Err(Error::PermissionDenied)
    );
    assert_eq!(
        aspace.set_range_immutable(va(0x4000), PAGE_SIZE),
        Err(Error::InvalidArgument)
    );
    assert_eq!(
        aspace.set_range_immutable(va(0x8000), PAGE_SIZE),
        Err(Error::InvalidArgument)
    );

    aspace.set_range_immutable(va(0x4000), 2 * PAGE_SIZE).unwrap();
    assert!(
        aspace
            .find_region_containing_address(va(0x4000))
            .unwrap()
            .is_immutable()
    );
    assert_eq!(
        aspace.set_range_immutable(va(0x4000), 2 * PAGE_SIZE),
        Err(Error::PermissionDenied)
    );
}

#[test_log::test]
fn syscall_regions() {
    let mut aspace = aspace();
    aspace
        .allocate_region(
            Placement::Fixed(va(0x1000)),
            PAGE_SIZE,
            0,
            None,
            Protection::READ | Protection::EXEC,
            AllocationStrategy::Reserve,
        )
        .unwrap();
    let text = mmap(
        &mut aspace,
        Placement::Fixed(va(0x4000)),
        2 * PAGE_SIZE,
        Protection::READ | Protection::EXEC,
    )
    .unwrap();

    assert_eq!(
        aspace.enable_syscall_region(va(0x1000)),
        Err(Error::PermissionDenied)
    );
    assert_eq!(
        aspace.enable_syscall_region(va(0x3000)),
        Err(Error::InvalidArgument)
    );

    aspace.enable_syscall_region(va(0x5123)).unwrap();
    assert!(
        aspace
            .find_region_from_range(text)
            .unwrap()
            .is_syscall_region()
    );

    // the flag survives a split
    aspace.unmap_range(va(0x4000), PAGE_SIZE).unwrap();
    assert!(
        aspace
            .find_region_containing_address(va(0x5000))
            .unwrap()
            .is_syscall_region()
    );
}

#[test_log::test]
fn deallocate_and_take() {
    let mut aspace = aspace();
    let a = mmap_fixed(&mut aspace, 0x1000, PAGE_SIZE);
    let b = mmap_fixed(&mut aspace, 0x2000, PAGE_SIZE);

    assert_eq!(
        aspace.deallocate_region(va(0x1800)),
        Err(Error::InvalidArgument)
    );
    aspace.deallocate_region(a.base()).unwrap();
    assert!(!aspace.page_directory().is_mapped(a));

    let mut taken = aspace.take_region(b.base()).unwrap();
    // taking does not touch the hardware mapping
    assert!(aspace.page_directory().is_mapped(b));
    taken.unmap(&**aspace.page_directory(), kaspace::ShouldFlushTlb::Yes);
    assert!(aspace.region_tree().is_empty());
}

#[test_log::test]
fn teardown_unmaps_everything_under_one_lock() {
    let mut aspace = aspace();
    mmap_fixed(&mut aspace, 0x1000, 2 * PAGE_SIZE);
    mmap_fixed(&mut aspace, 0x4000, PAGE_SIZE);
    mmap(
        &mut aspace,
        Placement::Fixed(va(0x8000)),
        PAGE_SIZE,
        Protection::NONE,
    )
    .unwrap();

    let pd = aspace.page_directory().clone();
    let locks = pd.lock_count();
    let flushes = pd.flush_count();

    aspace.remove_all_regions(TeardownContext::Finalizer);

    assert_eq!(pd.lock_count(), locks + 1);
    assert_eq!(pd.flush_count(), flushes);
    assert_eq!(pd.unmap_count(), 2);
    assert!(pd.mapped_ranges().is_empty());
    assert!(aspace.region_tree().is_empty());
}

#[test_log::test]
fn forked_address_space_inherits_the_total_range() {
    let pd = Arc::new(TestPageDirectory::new());
    let mut parent = AddressSpace::new(pd, None, Some(rand_seeded(9)));
    mmap(
        &mut parent,
        Placement::Anywhere { randomize: true },
        4 * PAGE_SIZE,
        RW,
    )
    .unwrap();

    let child = AddressSpace::new(Arc::new(TestPageDirectory::new()), Some(&parent), None);
    assert_eq!(child.total_range(), parent.total_range());
    assert!(child.region_tree().is_empty());
    assert_eq!(child.amount_virtual(), 0);
}

fn rand_seeded(seed: u8) -> rand_chacha::ChaCha20Rng {
    rand::SeedableRng::from_seed([seed; 32])
}

#[test_log::test]
fn statistics() {
    let mut aspace = aspace_with(range(0x1000, 64 * PAGE_SIZE));

    // one inode mapped twice, its clean pages count once
    let inode = TestVmObject::inode(8 * PAGE_SIZE)
        .resident()
        .with_clean(3 * PAGE_SIZE)
        .into_arc();
    for offset in [0, 4 * PAGE_SIZE] {
        aspace
            .allocate_region_with_vmobject(
                Placement::Anywhere { randomize: false },
                2 * PAGE_SIZE,
                0,
                inode.clone(),
                offset,
                Some("lib.so"),
                Protection::READ,
                false,
                MemoryType::Normal,
            )
            .unwrap();
    }

    let shared = TestVmObject::anonymous(2 * PAGE_SIZE)
        .resident()
        .shared()
        .into_arc();
    aspace
        .allocate_region_with_vmobject(
            Placement::Anywhere { randomize: false },
            2 * PAGE_SIZE,
            0,
            shared,
            0,
            Some("shm"),
            RW,
            true,
            MemoryType::Normal,
        )
        .unwrap();

    let purgeable = AnonymousVmObject::try_create_purgeable_with_size(
        2 * PAGE_SIZE,
        AllocationStrategy::AllocateNow,
    )
    .unwrap();
    purgeable.set_volatile(true).unwrap();
    aspace
        .allocate_region_with_vmobject(
            Placement::Anywhere { randomize: false },
            2 * PAGE_SIZE,
            0,
            purgeable,
            0,
            Some("cache"),
            RW,
            false,
            MemoryType::Normal,
        )
        .unwrap();

    let lazy = aspace
        .allocate_region(
            Placement::Anywhere { randomize: false },
            4 * PAGE_SIZE,
            0,
            Some("heap"),
            RW,
            AllocationStrategy::None,
        )
        .unwrap();
    assert_eq!(lazy.amount_resident(), 0);

    assert_eq!(aspace.amount_virtual(), 12 * PAGE_SIZE);
    assert_eq!(aspace.amount_resident(), 8 * PAGE_SIZE);
    assert_eq!(aspace.amount_shared(), 2 * PAGE_SIZE);
    assert_eq!(aspace.amount_dirty_private(), 6 * PAGE_SIZE);
    assert_eq!(aspace.amount_clean_inode(), 3 * PAGE_SIZE);
    assert_eq!(aspace.amount_purgeable_volatile(), 2 * PAGE_SIZE);
    assert_eq!(aspace.amount_purgeable_nonvolatile(), 0);
}

#[test_log::test]
fn debug_output_lists_regions() {
    let mut aspace = aspace();
    mmap_fixed(&mut aspace, 0x1000, PAGE_SIZE);

    let debug = format!("{aspace:?}");
    assert!(debug.contains("mmap"));
    assert!(debug.contains("RW-"));
    aspace.dump_regions();
}

#[test_log::test]
fn vmobject_identity_is_shared_by_clones() {
    let vmobject: Arc<dyn VmObject> = TestVmObject::inode(PAGE_SIZE).into_arc();
    assert_eq!(VmObjectId::of(&vmobject), VmObjectId::of(&vmobject.clone()));
}

fn states(aspace: &AddressSpace<TestPageDirectory>) -> Vec<(VirtualRange, Access, MappingState)> {
    aspace
        .regions()
        .map(|region| (region.range(), region.access(), region.mapping_state()))
        .collect()
}

#[test_log::test]
fn failed_remap_after_splitting_one_region() {
    let mut aspace = aspace();
    mmap_fixed(&mut aspace, 0x1000, 4 * PAGE_SIZE);
    let rw = Access::READ | Access::WRITE;

    aspace.page_directory().fail_next_map();
    assert_eq!(
        aspace.unmap_range(va(0x2000), PAGE_SIZE),
        Err(Error::NoMemory)
    );

    // the hole is gone, neither remainder is mapped, the second one was never attempted
    assert_eq!(
        states(&aspace),
        [
            (range(0x1000, PAGE_SIZE), rw, MappingState::Detached),
            (range(0x3000, 2 * PAGE_SIZE), rw, MappingState::Detached),
        ]
    );
    assert!(aspace.page_directory().mapped_ranges().is_empty());
    aspace.assert_valid("");
    aspace
        .page_directory()
        .assert_matches_regions(aspace.regions());

    // reprotecting installs both remainders again
    aspace.protect_range(va(0x1000), PAGE_SIZE, RW).unwrap();
    aspace.protect_range(va(0x3000), 2 * PAGE_SIZE, RW).unwrap();
    assert_eq!(
        aspace.page_directory().mapped_ranges(),
        [range(0x1000, PAGE_SIZE), range(0x3000, 2 * PAGE_SIZE)]
    );
    assert_consistent(&aspace);
}

#[test_log::test]
fn failed_remap_after_splitting_multiple_regions() {
    let mut aspace = aspace();
    mmap_fixed(&mut aspace, 0x1000, 2 * PAGE_SIZE);
    mmap_fixed(&mut aspace, 0x3000, 2 * PAGE_SIZE);
    let rw = Access::READ | Access::WRITE;

    aspace.page_directory().fail_next_map();
    assert_eq!(
        aspace.unmap_range(va(0x2000), 2 * PAGE_SIZE),
        Err(Error::NoMemory)
    );

    assert_eq!(
        states(&aspace),
        [
            (range(0x1000, PAGE_SIZE), rw, MappingState::Detached),
            (range(0x4000, PAGE_SIZE), rw, MappingState::Detached),
        ]
    );
    assert!(aspace.page_directory().mapped_ranges().is_empty());
    aspace.assert_valid("");

    // unmapping the leftovers succeeds without touching the page directory
    let unmaps = aspace.page_directory().unmap_count();
    aspace.unmap_range(va(0x1000), 4 * PAGE_SIZE).unwrap();
    assert!(aspace.region_tree().is_empty());
    assert_eq!(aspace.page_directory().unmap_count(), unmaps);
}

#[test_log::test]
fn failed_remap_while_protecting_part_of_a_region() {
    let mut aspace = aspace();
    mmap_fixed(&mut aspace, 0x1000, 4 * PAGE_SIZE);
    let rw = Access::READ | Access::WRITE;

    aspace.page_directory().fail_next_map();
    assert_eq!(
        aspace.protect_range(va(0x2000), PAGE_SIZE, Protection::READ),
        Err(Error::NoMemory)
    );

    // all three pieces are in the tree with their new access, none of them is mapped
    assert_eq!(
        states(&aspace),
        [
            (range(0x1000, PAGE_SIZE), rw, MappingState::Detached),
            (range(0x2000, PAGE_SIZE), Access::READ, MappingState::Detached),
            (range(0x3000, 2 * PAGE_SIZE), rw, MappingState::Detached),
        ]
    );
    assert!(aspace.page_directory().mapped_ranges().is_empty());
    aspace.assert_valid("");

    // protecting the whole range again maps every piece in place
    aspace.protect_range(va(0x1000), 4 * PAGE_SIZE, RW).unwrap();
    assert_eq!(layout(&aspace).len(), 3);
    assert_eq!(aspace.page_directory().mapped_ranges(), layout(&aspace));
    assert_consistent(&aspace);
}
