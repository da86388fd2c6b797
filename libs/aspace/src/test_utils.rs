// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! In-memory stand-ins for the collaborators of an [`AddressSpace`][crate::AddressSpace].

extern crate std;

pub mod proptest;

use core::ops::Range;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::vec::Vec;

use parking_lot::Mutex;

use crate::{
    Access, Error, PageDirectory, PageDirectoryGuard, Region, ShouldFlushTlb, VirtualAddress,
    VirtualRange, VmObject, VmObjectKind, arch,
};

/// A page directory that records which ranges are "mapped in hardware".
///
/// Mapping a range that overlaps a different existing mapping, or unmapping a range that is not
/// mapped, panics.
#[derive(Debug, Default)]
pub struct TestPageDirectory {
    lock: Mutex<()>,
    mappings: Mutex<BTreeMap<VirtualAddress, (VirtualRange, Access)>>,
    flushes: AtomicUsize,
    lock_acquisitions: AtomicUsize,
    maps: AtomicUsize,
    unmaps: AtomicUsize,
    fail_next_map: AtomicBool,
}

impl TestPageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call to [`PageDirectory::map`] fail with [`Error::NoMemory`].
    pub fn fail_next_map(&self) {
        self.fail_next_map.store(true, Ordering::Release);
    }

    pub fn is_mapped(&self, range: VirtualRange) -> bool {
        self.mappings
            .lock()
            .get(&range.base())
            .is_some_and(|(mapped, _)| *mapped == range)
    }

    pub fn mapped_access(&self, range: VirtualRange) -> Option<Access> {
        self.mappings
            .lock()
            .get(&range.base())
            .filter(|(mapped, _)| *mapped == range)
            .map(|(_, access)| *access)
    }

    /// All hardware mappings in address order.
    pub fn mapped_ranges(&self) -> Vec<VirtualRange> {
        self.mappings
            .lock()
            .values()
            .map(|(range, _)| *range)
            .collect()
    }

    /// Number of TLB flushes requested so far.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Acquire)
    }

    /// Number of times [`PageDirectory::lock`] was called.
    pub fn lock_count(&self) -> usize {
        self.lock_acquisitions.load(Ordering::Acquire)
    }

    pub fn map_count(&self) -> usize {
        self.maps.load(Ordering::Acquire)
    }

    pub fn unmap_count(&self) -> usize {
        self.unmaps.load(Ordering::Acquire)
    }

    /// Asserts that exactly the mapped ones among `regions` are present, with their current access.
    ///
    /// # Panics
    ///
    /// Panics if the recorded hardware mappings differ from the mapped regions.
    #[track_caller]
    pub fn assert_matches_regions<'a>(&self, regions: impl IntoIterator<Item = &'a Region>) {
        let mut expected = BTreeMap::new();
        for region in regions {
            if region.is_mapped() {
                expected.insert(region.base(), (region.range(), region.access()));
            }
        }

        assert_eq!(
            *self.mappings.lock(),
            expected,
            "hardware mappings diverged from the mapped regions"
        );
    }

    fn record_flush(&self, flush: ShouldFlushTlb) {
        if flush == ShouldFlushTlb::Yes {
            self.flushes.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl PageDirectory for TestPageDirectory {
    type RawMutex = parking_lot::RawMutex;

    fn lock(&self) -> PageDirectoryGuard<'_, Self> {
        self.lock_acquisitions.fetch_add(1, Ordering::AcqRel);
        self.lock.lock()
    }

    fn map(&self, region: &Region, flush: ShouldFlushTlb) -> crate::Result<()> {
        let _guard = self.lock.lock();

        if self.fail_next_map.swap(false, Ordering::AcqRel) {
            return Err(Error::NoMemory);
        }

        let range = region.range();
        let mut mappings = self.mappings.lock();
        // remapping the exact same range updates its access
        if let Some((previous, _)) = mappings.remove(&range.base()) {
            assert_eq!(
                previous, range,
                "mapping {range:?} would replace a different mapping"
            );
        }
        if let Some((other, _)) = mappings
            .values()
            .find(|(other, _)| other.intersects(range))
        {
            panic!("mapping {range:?} overlaps the existing mapping {other:?}");
        }

        mappings.insert(range.base(), (range, region.access()));
        self.maps.fetch_add(1, Ordering::AcqRel);
        self.record_flush(flush);
        Ok(())
    }

    fn unmap(&self, region: &Region, flush: ShouldFlushTlb, _guard: &PageDirectoryGuard<'_, Self>) {
        let range = region.range();
        let removed = self.mappings.lock().remove(&range.base());

        assert!(
            removed.is_some_and(|(mapped, _)| mapped == range),
            "unmapping {range:?} which is not mapped"
        );
        self.unmaps.fetch_add(1, Ordering::AcqRel);
        self.record_flush(flush);
    }
}

/// A [`VmObject`] with fixed, configurable accounting.
#[derive(Debug)]
pub struct TestVmObject {
    size: usize,
    kind: VmObjectKind,
    resident: bool,
    shared: bool,
    clean: usize,
    purgeable: bool,
    volatile: AtomicBool,
}

impl TestVmObject {
    /// # Panics
    ///
    /// Panics if `size` is zero or not page-aligned.
    pub fn new(kind: VmObjectKind, size: usize) -> Self {
        assert!(size > 0 && arch::is_page_aligned(size));

        Self {
            size,
            kind,
            resident: false,
            shared: false,
            clean: 0,
            purgeable: false,
            volatile: AtomicBool::new(false),
        }
    }

    pub fn inode(size: usize) -> Self {
        Self::new(VmObjectKind::Inode, size)
    }

    pub fn anonymous(size: usize) -> Self {
        Self::new(VmObjectKind::Anonymous, size)
    }

    /// Every page is resident.
    #[must_use]
    pub fn resident(mut self) -> Self {
        self.resident = true;
        self
    }

    /// Every resident page is shared.
    #[must_use]
    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    #[must_use]
    pub fn with_clean(mut self, clean: usize) -> Self {
        self.clean = clean;
        self
    }

    #[must_use]
    pub fn purgeable(mut self, volatile: bool) -> Self {
        self.purgeable = true;
        self.volatile = AtomicBool::new(volatile);
        self
    }

    pub fn into_arc(self) -> Arc<dyn VmObject> {
        Arc::new(self)
    }

    fn resident_in(&self, range: Range<usize>) -> usize {
        if self.resident {
            range.end.min(self.size).saturating_sub(range.start)
        } else {
            0
        }
    }
}

impl VmObject for TestVmObject {
    fn size(&self) -> usize {
        self.size
    }

    fn kind(&self) -> VmObjectKind {
        self.kind
    }

    fn is_purgeable(&self) -> bool {
        self.purgeable
    }

    fn is_volatile(&self) -> bool {
        self.volatile.load(Ordering::Acquire)
    }

    fn amount_resident(&self, range: Range<usize>) -> usize {
        self.resident_in(range)
    }

    fn amount_shared(&self, range: Range<usize>) -> usize {
        if self.shared {
            self.resident_in(range)
        } else {
            0
        }
    }

    fn amount_clean(&self) -> usize {
        self.clean
    }
}
