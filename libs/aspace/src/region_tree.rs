// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::collections::BTreeMap;
use alloc::collections::btree_map::{self, Entry};
use alloc::vec::Vec;
use core::iter::FusedIterator;
use core::{fmt, mem};

use rand::Rng;
use rand::distr::Uniform;
use rand_chacha::ChaCha20Rng;

use crate::{Error, Region, UnplacedRegion, VirtualAddress, VirtualRange, arch};

/// How many random candidates a randomized placement probes before it falls back to first-fit.
const MAX_RANDOMIZATION_ATTEMPTS: usize = 1000;

/// The address-ordered set of non-overlapping regions of an address space.
///
/// Regions are keyed by their base address and owned by the tree. Taking a region out of the tree
/// moves it to the caller, there are no outstanding references into the tree after that.
pub struct RegionTree {
    total_range: VirtualRange,
    regions: BTreeMap<VirtualAddress, Region>,
}

impl fmt::Debug for RegionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionTree")
            .field("total_range", &self.total_range)
            .field("regions", &self.regions.values())
            .finish()
    }
}

impl RegionTree {
    pub const fn new(total_range: VirtualRange) -> Self {
        Self {
            total_range,
            regions: BTreeMap::new(),
        }
    }

    pub fn total_range(&self) -> VirtualRange {
        self.total_range
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Regions in address order.
    pub fn iter(&self) -> btree_map::Values<'_, VirtualAddress, Region> {
        self.regions.values()
    }

    pub fn iter_mut(&mut self) -> btree_map::ValuesMut<'_, VirtualAddress, Region> {
        self.regions.values_mut()
    }

    pub fn get(&self, base: VirtualAddress) -> Option<&Region> {
        self.regions.get(&base)
    }

    pub fn get_mut(&mut self, base: VirtualAddress) -> Option<&mut Region> {
        self.regions.get_mut(&base)
    }

    /// Places `region` at exactly `range`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `range` is empty or not page-aligned, or the region's
    ///   backing object is too small for it.
    /// - [`Error::Fault`] if `range` is not contained in the tree's total range.
    /// - [`Error::AddressInUse`] if any existing region overlaps `range`.
    ///
    /// The tree is unchanged on error.
    pub fn place_specifically(
        &mut self,
        region: UnplacedRegion,
        range: VirtualRange,
    ) -> crate::Result<&mut Region> {
        if range.is_empty() || !range.is_page_aligned() {
            return Err(Error::InvalidArgument);
        }
        if !self.total_range.contains(range) {
            log::debug!(
                "fixed placement {range:?} lies outside of {:?}",
                self.total_range
            );
            return Err(Error::Fault);
        }
        if !self.is_free(range) {
            log::debug!("fixed placement {range:?} overlaps an existing region");
            return Err(Error::AddressInUse);
        }

        let region = region.place(range)?;
        log::trace!("placed region at {range:?}");
        Ok(self.insert(region))
    }

    /// Places `region` in a free part of the total range that is `size` bytes large and aligned
    /// to `alignment`.
    ///
    /// With an `rng` a bounded number of random candidates is probed first; without one, or if
    /// none of them are free, the lowest suitable spot is chosen.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `size` is zero or not page-aligned, `alignment` is not a
    ///   power of two of at least [`arch::PAGE_SIZE`], or the region's backing object is too small.
    /// - [`Error::NoMemory`] if no gap can hold the region.
    ///
    /// The tree is unchanged on error.
    pub fn place_anywhere(
        &mut self,
        region: UnplacedRegion,
        rng: Option<&mut ChaCha20Rng>,
        size: usize,
        alignment: usize,
    ) -> crate::Result<&mut Region> {
        if size == 0 || !arch::is_page_aligned(size) {
            return Err(Error::InvalidArgument);
        }
        if !alignment.is_power_of_two() || alignment < arch::PAGE_SIZE {
            return Err(Error::InvalidArgument);
        }

        let range = rng
            .and_then(|rng| self.find_random_spot(rng, size, alignment))
            .or_else(|| self.find_first_fit(size, alignment))
            .ok_or_else(|| {
                log::debug!(
                    "no free spot for {size:#x} bytes aligned to {alignment:#x} in {:?}",
                    self.total_range
                );
                Error::NoMemory
            })?;

        let region = region.place(range)?;
        log::trace!("placed region at {range:?}");
        Ok(self.insert(region))
    }

    fn find_random_spot(
        &self,
        rng: &mut ChaCha20Rng,
        size: usize,
        alignment: usize,
    ) -> Option<VirtualRange> {
        let max_offset = self.total_range.size().checked_sub(size)?;
        let Ok(distr) = Uniform::new_inclusive(0, max_offset) else {
            return None;
        };

        for _ in 0..MAX_RANDOMIZATION_ATTEMPTS {
            let offset: usize = rng.sample(&distr);
            let Some(base) = self
                .total_range
                .base()
                .add(offset)
                .checked_align_up(alignment)
            else {
                continue;
            };
            let Some(end) = base.checked_add(size) else {
                continue;
            };

            let candidate = VirtualRange::from_bounds(base, end);
            if self.total_range.contains(candidate) && self.is_free(candidate) {
                return Some(candidate);
            }
        }

        log::trace!("randomized placement of {size:#x} bytes failed, falling back to first fit");
        None
    }

    fn find_first_fit(&self, size: usize, alignment: usize) -> Option<VirtualRange> {
        self.gaps().find_map(|gap| {
            let base = gap.base().checked_align_up(alignment)?;
            let end = base.checked_add(size)?;

            (end <= gap.end()).then_some(VirtualRange::from_bounds(base, end))
        })
    }

    /// Returns `true` if no region overlaps `range`.
    fn is_free(&self, range: VirtualRange) -> bool {
        self.regions
            .range(..range.end())
            .next_back()
            .is_none_or(|(_, region)| region.end() <= range.base())
    }

    fn insert(&mut self, region: Region) -> &mut Region {
        match self.regions.entry(region.base()) {
            Entry::Vacant(entry) => entry.insert(region),
            Entry::Occupied(entry) => panic!(
                "region {:?} collides with {:?} after the overlap check, this is a bug",
                region.range(),
                entry.get().range()
            ),
        }
    }

    /// Takes the region starting at `base` out of the tree.
    ///
    /// The region is *not* unmapped, that is the caller's responsibility.
    pub fn remove(&mut self, base: VirtualAddress) -> Option<Region> {
        self.regions.remove(&base)
    }

    /// Takes all regions out of the tree at once, returning them in address order.
    pub fn remove_all(&mut self) -> BTreeMap<VirtualAddress, Region> {
        mem::take(&mut self.regions)
    }

    /// The region whose base is `range.base` and whose size is `range.size` rounded up to pages.
    pub fn find_region_from_range(&self, range: VirtualRange) -> Option<&Region> {
        let size = arch::page_round_up(range.size()).ok()?;

        self.regions
            .get(&range.base())
            .filter(|region| region.size() == size)
    }

    /// The region that contains all of `range`.
    pub fn find_region_containing(&self, range: VirtualRange) -> Option<&Region> {
        self.regions
            .range(..=range.base())
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.range().contains(range))
    }

    /// The region that contains `addr`.
    pub fn find_region_containing_address(&self, addr: VirtualAddress) -> Option<&Region> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.range().contains_address(addr))
    }

    /// All regions overlapping `range`, in address order.
    pub fn find_regions_intersecting(&self, range: VirtualRange) -> Vec<&Region> {
        let mut found = Vec::new();
        if range.is_empty() {
            return found;
        }

        // the last region starting at or below `range`'s base may reach into it, if there is none
        // start at the very first region
        let start = self
            .regions
            .range(..=range.base())
            .next_back()
            .map_or(VirtualAddress::MIN, |(base, _)| *base);

        let mut found_size = 0;
        for region in self.regions.range(start..).map(|(_, region)| region) {
            if region.base() >= range.end() {
                break;
            }

            let intersection = region.range().intersect(range);
            if intersection.is_empty() {
                continue;
            }

            found_size += intersection.size();
            found.push(region);

            // regions never overlap, so once the intersections add up to the whole range there
            // cannot be any more
            if found_size == range.size() {
                break;
            }
        }
        debug_assert!(found_size <= range.size());

        found
    }

    /// The free parts of the total range, in address order.
    pub fn gaps(&self) -> Gaps<'_> {
        Gaps {
            regions: self.regions.values(),
            cursor: self.total_range.base(),
            end: self.total_range.end(),
            done: false,
        }
    }

    /// Checks the tree's invariants, prefixing every panic message with `msg`.
    ///
    /// # Panics
    ///
    /// Panics if a region is stored under the wrong key, lies outside of the total range,
    /// overlaps its predecessor, or fails [`Region::assert_valid`].
    #[track_caller]
    pub fn assert_valid(&self, msg: &str) {
        let mut prev_end = self.total_range.base();

        for (base, region) in &self.regions {
            assert_eq!(
                *base,
                region.base(),
                "{msg}region is stored under the wrong key; region={region:?}"
            );
            assert!(
                self.total_range.contains(region.range()),
                "{msg}region cannot lie outside of the total range {:?}; region={region:?}",
                self.total_range
            );
            assert!(
                region.base() >= prev_end,
                "{msg}region cannot overlap previous region; region={region:?}"
            );
            region.assert_valid(msg);

            prev_end = region.end();
        }
    }
}

/// Iterator over the free ranges of a [`RegionTree`], see [`RegionTree::gaps`].
pub struct Gaps<'a> {
    regions: btree_map::Values<'a, VirtualAddress, Region>,
    cursor: VirtualAddress,
    end: VirtualAddress,
    done: bool,
}

impl Iterator for Gaps<'_> {
    type Item = VirtualRange;

    fn next(&mut self) -> Option<Self::Item> {
        for region in self.regions.by_ref() {
            let gap_start = self.cursor;
            self.cursor = region.end();

            if region.base() > gap_start {
                return Some(VirtualRange::from_bounds(gap_start, region.base()));
            }
        }

        if self.done {
            return None;
        }
        self.done = true;

        (self.cursor < self.end).then(|| VirtualRange::from_bounds(self.cursor, self.end))
    }
}

impl FusedIterator for Gaps<'_> {}
