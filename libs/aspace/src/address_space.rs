// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

mod modify;
mod statistics;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use rand::Rng;
use rand::distr::Uniform;
use rand_chacha::ChaCha20Rng;
use smallvec::SmallVec;

use crate::{
    Access, AllocationStrategy, AnonymousVmObject, Error, MemoryType, PageDirectory, Protection,
    Region, RegionTree, ShouldFlushTlb, UnplacedRegion, VirtualAddress, VirtualRange, VmObject,
    arch,
};

/// Where a new region should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Anywhere inside the address space, at a random spot if `randomize` is set and the address
    /// space has a random number generator.
    Anywhere { randomize: bool },
    /// Exactly at the given page-aligned address.
    Fixed(VirtualAddress),
}

impl Placement {
    /// The `mmap` convention: a null `requested_addr` means "anywhere".
    pub fn new(randomize: bool, requested_addr: VirtualAddress) -> Self {
        if requested_addr.is_null() {
            Self::Anywhere { randomize }
        } else {
            Self::Fixed(requested_addr)
        }
    }
}

/// The context [`AddressSpace::remove_all_regions`] is invoked from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownContext {
    /// The finalizer reaping a dead process.
    Finalizer,
    /// The system is shutting down.
    SystemShutdown,
    /// Anything else. Tearing down from here is a bug.
    Other,
}

/// The virtual address space of a single process.
///
/// Mutating operations must be serialized by the owner, see the [crate-level docs](crate).
pub struct AddressSpace<P: PageDirectory> {
    page_directory: Arc<P>,
    region_tree: RegionTree,
    /// The pseudo-random number generator used for address space layout randomization or `None`
    /// if ASLR is disabled.
    rng: Option<ChaCha20Rng>,
}

impl<P: PageDirectory> fmt::Debug for AddressSpace<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("total_range", &self.region_tree.total_range())
            .field("regions", &RegionList(&self.region_tree))
            .field("aslr", &self.rng.is_some())
            .finish_non_exhaustive()
    }
}

/// One line per region instead of the full [`Region`] debug output.
struct RegionList<'a>(&'a RegionTree);

impl fmt::Debug for RegionList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for region in self.0.iter() {
            list.entry(&format_args!(
                "{:<24} {:?} {}",
                region.name().unwrap_or("<anonymous>"),
                region.range(),
                region.access()
            ));
        }
        list.finish()
    }
}

impl<P: PageDirectory> AddressSpace<P> {
    /// Creates an empty address space.
    ///
    /// A forked address space inherits the `parent`'s total range (but none of its regions), a
    /// fresh one covers the user range starting at a random page-aligned offset above
    /// [`arch::USER_RANGE_BASE`] (no offset without `rng`).
    pub fn new(
        page_directory: Arc<P>,
        parent: Option<&AddressSpace<P>>,
        mut rng: Option<ChaCha20Rng>,
    ) -> Self {
        let total_range = match parent {
            Some(parent) => parent.total_range(),
            None => {
                let offset = random_base_offset(rng.as_mut());
                VirtualRange::from_bounds(
                    arch::USER_RANGE_BASE.add(offset),
                    arch::USER_RANGE_CEILING,
                )
            }
        };

        log::trace!("new address space spanning {total_range:?}");

        Self {
            page_directory,
            region_tree: RegionTree::new(total_range),
            rng,
        }
    }

    /// Creates an empty address space spanning exactly `total_range`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `total_range` is empty or not page-aligned.
    pub fn with_total_range(
        page_directory: Arc<P>,
        total_range: VirtualRange,
        rng: Option<ChaCha20Rng>,
    ) -> crate::Result<Self> {
        if total_range.is_empty() || !total_range.is_page_aligned() {
            return Err(Error::InvalidArgument);
        }

        Ok(Self {
            page_directory,
            region_tree: RegionTree::new(total_range),
            rng,
        })
    }

    pub fn page_directory(&self) -> &Arc<P> {
        &self.page_directory
    }

    pub fn total_range(&self) -> VirtualRange {
        self.region_tree.total_range()
    }

    pub fn region_tree(&self) -> &RegionTree {
        &self.region_tree
    }

    /// All regions in address order.
    pub fn regions(&self) -> impl Iterator<Item = &Region> + '_ {
        self.region_tree.iter()
    }

    /// Allocates a region backed by a fresh anonymous memory object and maps it.
    ///
    /// `size` and `alignment` are rounded up to whole pages. A region with an empty access is not
    /// mapped until its protection changes.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if a fixed address is not page-aligned, `size` is zero,
    ///   rounding overflows, or the rounded alignment is not a power of two.
    /// - [`Error::NoMemory`] if no spot is free or the memory object cannot be allocated.
    /// - [`Error::AddressInUse`] or [`Error::Fault`] for fixed placements that are taken or out of
    ///   bounds.
    /// - Any error of [`PageDirectory::map`]. The address space is unchanged in that case.
    pub fn allocate_region(
        &mut self,
        placement: Placement,
        size: usize,
        alignment: usize,
        name: Option<&str>,
        prot: Protection,
        strategy: AllocationStrategy,
    ) -> crate::Result<&mut Region> {
        check_fixed_address(placement)?;
        let (size, alignment) = round_size_and_alignment(size, alignment)?;

        let vmobject = AnonymousVmObject::try_create_with_size(size, strategy)?;
        let region = UnplacedRegion::new(
            vmobject,
            0,
            name.map(String::from),
            Access::from(prot),
            MemoryType::Normal,
            false,
        );

        let base = self.place(region, placement, size, alignment)?;
        self.commit_placement(base)
    }

    /// Allocates a region mapping the window `[offset, offset + size)` of `vmobject`.
    ///
    /// Regions with [`Protection::NONE`] are only attached, their hardware mappings are created
    /// once they become accessible.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if a fixed address or `offset` is not page-aligned, `size`
    ///   is zero, rounding overflows, the rounded alignment is not a power of two, `offset` lies
    ///   at or past the end of `vmobject`, or the window extends past it.
    /// - [`Error::NoMemory`] if no spot is free.
    /// - [`Error::AddressInUse`] or [`Error::Fault`] for fixed placements that are taken or out of
    ///   bounds.
    /// - Any error of [`PageDirectory::map`]. The address space is unchanged in that case.
    pub fn allocate_region_with_vmobject(
        &mut self,
        placement: Placement,
        size: usize,
        alignment: usize,
        vmobject: Arc<dyn VmObject>,
        offset_in_vmobject: usize,
        name: Option<&str>,
        prot: Protection,
        shared: bool,
        memory_type: MemoryType,
    ) -> crate::Result<&mut Region> {
        check_fixed_address(placement)?;
        let (size, alignment) = round_size_and_alignment(size, alignment)?;

        if !arch::is_page_aligned(offset_in_vmobject) || offset_in_vmobject >= vmobject.size() {
            log::debug!(
                "offset {offset_in_vmobject:#x} is invalid for vmobject of {:#x} bytes",
                vmobject.size()
            );
            return Err(Error::InvalidArgument);
        }
        let window_end = offset_in_vmobject
            .checked_add(size)
            .ok_or(Error::InvalidArgument)?;
        if window_end > vmobject.size() {
            log::debug!(
                "window ends at {window_end:#x} past the end of vmobject of {:#x} bytes",
                vmobject.size()
            );
            return Err(Error::InvalidArgument);
        }

        let region = UnplacedRegion::new(
            vmobject,
            offset_in_vmobject,
            name.map(String::from),
            Access::from(prot),
            memory_type,
            shared,
        );

        let base = self.place(region, placement, size, alignment)?;
        self.commit_placement(base)
    }

    fn place(
        &mut self,
        region: UnplacedRegion,
        placement: Placement,
        size: usize,
        alignment: usize,
    ) -> crate::Result<VirtualAddress> {
        let region = match placement {
            Placement::Fixed(addr) => {
                let end = addr.checked_add(size).ok_or(Error::InvalidArgument)?;
                self.region_tree
                    .place_specifically(region, VirtualRange::from_bounds(addr, end))?
            }
            Placement::Anywhere { randomize } => {
                let rng = if randomize { self.rng.as_mut() } else { None };
                self.region_tree
                    .place_anywhere(region, rng, size, alignment)?
            }
        };

        Ok(region.base())
    }

    /// Installs the freshly placed region at `base`, taking it out of the tree again if that
    /// fails.
    fn commit_placement(&mut self, base: VirtualAddress) -> crate::Result<&mut Region> {
        let mut guard = PlacementGuard::new(&mut self.region_tree, base);
        install(guard.region(), &*self.page_directory, ShouldFlushTlb::No)?;

        Ok(guard.disarm())
    }

    /// Installs the region at `base` into the page directory according to its access: accessible
    /// regions are (re)mapped, inaccessible ones unmapped and kept attached.
    fn install_region(&mut self, base: VirtualAddress, flush: ShouldFlushTlb) -> crate::Result<()> {
        let region = self
            .region_tree
            .get_mut(base)
            .ok_or(Error::InvalidArgument)?;

        install(region, &*self.page_directory, flush)
    }

    /// Takes the region at `base` out of the address space and unmaps it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if no region starts at `base`.
    pub fn deallocate_region(&mut self, base: VirtualAddress) -> crate::Result<()> {
        let mut region = self.take_region(base).ok_or(Error::InvalidArgument)?;
        region.unmap(&*self.page_directory, ShouldFlushTlb::Yes);
        log::trace!("deallocated region {:?}", region.range());
        Ok(())
    }

    /// Moves the region at `base` out of the address space without touching the page directory.
    pub fn take_region(&mut self, base: VirtualAddress) -> Option<Region> {
        self.region_tree.remove(base)
    }

    /// Places new regions over the parts of `source` that lie outside of `range`, returning their
    /// base addresses in address order.
    ///
    /// `source` must already be out of the tree. The new regions are placed but not installed.
    ///
    /// # Errors
    ///
    /// Propagates placement errors, which indicate `source` is still in the tree.
    ///
    /// # Panics
    ///
    /// Panics if `range` is not contained in `source`.
    pub fn try_split_region_around_range(
        &mut self,
        source: &Region,
        range: VirtualRange,
    ) -> crate::Result<SmallVec<[VirtualAddress; 2]>> {
        let mut bases = SmallVec::new();
        for remainder in source.range().carve(range) {
            let region = self.try_allocate_split_region(source, remainder, source.access())?;
            bases.push(region.base());
        }

        log::trace!(
            "split {:?} around {range:?} into {} region(s)",
            source.range(),
            bases.len()
        );
        Ok(bases)
    }

    /// Places a new region over `range` of `source` with the given access.
    ///
    /// # Errors
    ///
    /// Propagates placement errors, which indicate the range is still occupied.
    ///
    /// # Panics
    ///
    /// Panics if `range` is not contained in `source`.
    pub fn try_allocate_split_region(
        &mut self,
        source: &Region,
        range: VirtualRange,
        access: Access,
    ) -> crate::Result<&mut Region> {
        let region = source.split_off(range, access);
        self.region_tree.place_specifically(region, range)
    }

    /// Unmaps and drops every region.
    ///
    /// All regions are unmapped under a single acquisition of the page directory's lock and
    /// without per-region TLB flushes.
    ///
    /// # Panics
    ///
    /// Panics if `ctx` is [`TeardownContext::Other`].
    pub fn remove_all_regions(&mut self, ctx: TeardownContext) {
        assert!(
            matches!(
                ctx,
                TeardownContext::Finalizer | TeardownContext::SystemShutdown
            ),
            "address space may only be torn down by the finalizer or during shutdown, not {ctx:?}"
        );

        let page_directory = &*self.page_directory;
        {
            let guard = page_directory.lock();
            for region in self.region_tree.iter_mut() {
                region.unmap_with_lock_held(page_directory, ShouldFlushTlb::No, &guard);
            }
        }

        let regions = self.region_tree.remove_all();
        log::trace!("removed all {} regions ({ctx:?})", regions.len());
    }

    pub fn find_region_from_range(&self, range: VirtualRange) -> Option<&Region> {
        self.region_tree.find_region_from_range(range)
    }

    pub fn find_region_containing(&self, range: VirtualRange) -> Option<&Region> {
        self.region_tree.find_region_containing(range)
    }

    pub fn find_region_containing_address(&self, addr: VirtualAddress) -> Option<&Region> {
        self.region_tree.find_region_containing_address(addr)
    }

    pub fn find_regions_intersecting(&self, range: VirtualRange) -> Vec<&Region> {
        self.region_tree.find_regions_intersecting(range)
    }

    pub fn region_mut(&mut self, base: VirtualAddress) -> Option<&mut Region> {
        self.region_tree.get_mut(base)
    }

    /// Logs every region at `debug` level.
    pub fn dump_regions(&self) {
        log::debug!(
            "address space {:?}, {} regions",
            self.total_range(),
            self.region_tree.len()
        );
        for region in self.region_tree.iter() {
            log::debug!(
                "{}..{} {:#10x} {} {:?} {:?} {}",
                region.base(),
                region.end(),
                region.size(),
                region.access(),
                region.flags(),
                region.mapping_state(),
                region.name().unwrap_or("<anonymous>")
            );
        }
    }

    /// Checks the region tree's invariants, prefixing every panic message with `msg`.
    ///
    /// # Panics
    ///
    /// Panics if regions overlap, lie outside of the total range or are malformed.
    #[track_caller]
    pub fn assert_valid(&self, msg: &str) {
        self.region_tree.assert_valid(msg);
    }
}

/// Brings `region`'s hardware state in line with its access.
fn install<P: PageDirectory>(
    region: &mut Region,
    page_directory: &P,
    flush: ShouldFlushTlb,
) -> crate::Result<()> {
    if region.access().is_empty() {
        region.unmap(page_directory, flush);
        region.attach();
        Ok(())
    } else {
        region.map(page_directory, flush)
    }
}

/// Removes a just-placed region from the tree again unless disarmed.
struct PlacementGuard<'a> {
    tree: Option<&'a mut RegionTree>,
    base: VirtualAddress,
}

impl<'a> PlacementGuard<'a> {
    fn new(tree: &'a mut RegionTree, base: VirtualAddress) -> Self {
        Self {
            tree: Some(tree),
            base,
        }
    }

    fn region(&mut self) -> &mut Region {
        let base = self.base;
        self.tree
            .as_mut()
            .and_then(|tree| tree.get_mut(base))
            .expect("placed region vanished from the tree, this is a bug")
    }

    fn disarm(mut self) -> &'a mut Region {
        let base = self.base;
        self.tree
            .take()
            .and_then(|tree| tree.get_mut(base))
            .expect("placed region vanished from the tree, this is a bug")
    }
}

impl Drop for PlacementGuard<'_> {
    fn drop(&mut self) {
        if let Some(tree) = self.tree.take() {
            if let Some(region) = tree.remove(self.base) {
                log::trace!("rolled back placement of {:?}", region.range());
            }
        }
    }
}

fn check_fixed_address(placement: Placement) -> crate::Result<()> {
    if matches!(placement, Placement::Fixed(addr) if !addr.is_page_aligned()) {
        log::debug!("fixed placement {placement:?} is not page aligned");
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

fn round_size_and_alignment(size: usize, alignment: usize) -> crate::Result<(usize, usize)> {
    let size = arch::page_round_up(size)?;
    if size == 0 {
        return Err(Error::InvalidArgument);
    }

    let alignment = arch::page_round_up(alignment)?.max(arch::PAGE_SIZE);
    if !alignment.is_power_of_two() {
        return Err(Error::InvalidArgument);
    }

    Ok((size, alignment))
}

fn random_base_offset(rng: Option<&mut ChaCha20Rng>) -> usize {
    let Some(rng) = rng else {
        return 0;
    };
    let Ok(distr) = Uniform::new(0, arch::MAX_ASPACE_RANDOM_OFFSET) else {
        return 0;
    };

    arch::page_round_down(rng.sample(distr))
}
