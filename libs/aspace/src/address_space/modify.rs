// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Userspace-driven changes to existing regions: `munmap`, `mprotect`, sealing and syscall
//! regions.

use smallvec::SmallVec;

use super::{AddressSpace, install};
use crate::{
    Access, Error, PageDirectory, Protection, Region, ShouldFlushTlb, VirtualAddress, VirtualRange,
};

impl<P: PageDirectory> AddressSpace<P> {
    /// Removes `[addr, addr + size)`, expanded to page boundaries, from the address space.
    ///
    /// Regions partially covered by the range are split and only the covered part is removed.
    /// Unmapping a range that holds no regions succeeds without doing anything.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `size` is zero or the range overflows.
    /// - [`Error::Fault`] if the range lies outside of the address space.
    /// - [`Error::PermissionDenied`] if any affected region was not created through `mmap` or is
    ///   immutable. Nothing is unmapped in that case.
    /// - Any error of [`PageDirectory::map`] while installing the split-off remainders. The range
    ///   is unmapped regardless, remainders not installed yet stay in the tree detached.
    ///
    /// # Panics
    ///
    /// Panics if the tree's lookups disagree with each other, which is a bug.
    pub fn unmap_range(&mut self, addr: VirtualAddress, size: usize) -> crate::Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        let range = VirtualRange::expand_to_page_boundaries(addr.get(), size)?;
        if !self.total_range().contains(range) {
            log::debug!("cannot unmap {range:?} outside of {:?}", self.total_range());
            return Err(Error::Fault);
        }

        // the range is exactly one region
        if let Some(region) = self.region_tree.find_region_from_range(range) {
            region.check_user_modifiable()?;
            let base = region.base();

            return self.deallocate_region(base);
        }

        // the range lies within one larger region
        if let Some(region) = self.region_tree.find_region_containing(range) {
            region.check_user_modifiable()?;
            let base = region.base();

            let mut old = self
                .take_region(base)
                .expect("region found by lookup must be in the tree");
            old.unmap(&*self.page_directory, ShouldFlushTlb::Yes);

            let new_bases = self.try_split_region_around_range(&old, range)?;
            drop(old);

            for base in new_bases {
                self.install_region(base, ShouldFlushTlb::No)?;
            }

            log::trace!("unmapped {range:?} from within a single region");
            return Ok(());
        }

        // the range spans multiple regions, check all of them before touching any
        let affected = self
            .region_tree
            .find_regions_intersecting(range)
            .into_iter()
            .map(|region| {
                region.check_user_modifiable()?;
                Ok(region.base())
            })
            .collect::<crate::Result<SmallVec<[VirtualAddress; 8]>>>()?;

        if affected.is_empty() {
            return Ok(());
        }

        let mut new_bases = SmallVec::<[VirtualAddress; 4]>::new();
        for base in affected {
            let mut old = self
                .take_region(base)
                .expect("region found by lookup must be in the tree");
            old.unmap(&*self.page_directory, ShouldFlushTlb::Yes);

            if !range.contains(old.range()) {
                let covered = old.range().intersect(range);
                new_bases.extend(self.try_split_region_around_range(&old, covered)?);
            }
        }

        for base in new_bases {
            self.install_region(base, ShouldFlushTlb::No)?;
        }

        log::trace!("unmapped {range:?} across multiple regions");
        Ok(())
    }

    /// Changes the access of `[addr, addr + size)`, expanded to page boundaries, to `prot`.
    ///
    /// Partially covered regions are split so only the covered part changes. Regions that become
    /// inaccessible are unmapped but stay attached, regions that become accessible are mapped.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `size` is zero or the range overflows.
    /// - [`Error::Fault`] if the range lies outside of the address space or is not completely
    ///   covered by regions.
    /// - [`Error::PermissionDenied`] if any affected region is immutable.
    /// - Any error of [`PageDirectory::map`]. Split pieces not installed yet stay in the tree
    ///   detached, with their new access.
    ///
    /// Nothing is changed if validation fails.
    ///
    /// # Panics
    ///
    /// Panics if the tree's lookups disagree with each other, which is a bug.
    pub fn protect_range(
        &mut self,
        addr: VirtualAddress,
        size: usize,
        prot: Protection,
    ) -> crate::Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        let range = VirtualRange::expand_to_page_boundaries(addr.get(), size)?;
        if !self.total_range().contains(range) {
            log::debug!("cannot protect {range:?} outside of {:?}", self.total_range());
            return Err(Error::Fault);
        }
        let access = Access::from(prot);

        let mut covered = 0;
        let mut affected = SmallVec::<[VirtualAddress; 8]>::new();
        for region in self.region_tree.find_regions_intersecting(range) {
            if region.is_immutable() {
                log::debug!("cannot protect immutable region {:?}", region.range());
                return Err(Error::PermissionDenied);
            }
            covered += region.range().intersect(range).size();
            affected.push(region.base());
        }
        if covered != range.size() {
            log::debug!("cannot protect {range:?}, it is not fully mapped");
            return Err(Error::Fault);
        }

        for base in affected {
            let region = self
                .region_tree
                .get_mut(base)
                .expect("region found by lookup must be in the tree");

            if range.contains(region.range()) {
                region.set_access(access);
                install(region, &*self.page_directory, ShouldFlushTlb::Yes)?;
                continue;
            }

            let mut old = self
                .take_region(base)
                .expect("region found by lookup must be in the tree");
            old.unmap(&*self.page_directory, ShouldFlushTlb::Yes);

            let inner = old.range().intersect(range);
            let mut new_bases = self.try_split_region_around_range(&old, inner)?;
            new_bases.push(self.try_allocate_split_region(&old, inner, access)?.base());
            drop(old);

            for base in new_bases {
                self.install_region(base, ShouldFlushTlb::No)?;
            }
        }

        log::trace!("protected {range:?} as {access}");
        Ok(())
    }

    /// Seals the region spanning exactly `[addr, addr + size)`, after which it can no longer be
    /// unmapped, split or reprotected.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `size` is zero, the range overflows, or no region spans it
    ///   exactly.
    /// - [`Error::PermissionDenied`] if the region was not created through `mmap` or is already
    ///   sealed.
    pub fn set_range_immutable(&mut self, addr: VirtualAddress, size: usize) -> crate::Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        let range = VirtualRange::expand_to_page_boundaries(addr.get(), size)?;

        let base = self
            .region_tree
            .find_region_from_range(range)
            .ok_or(Error::InvalidArgument)
            .and_then(|region| {
                region.check_user_modifiable()?;
                Ok(region.base())
            })?;

        self.user_region_mut(base)?.set_immutable();
        log::trace!("sealed {range:?}");
        Ok(())
    }

    /// Allows system calls from code inside the region containing `addr`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if no region contains `addr`.
    /// - [`Error::PermissionDenied`] if the region was not created through `mmap`.
    pub fn enable_syscall_region(&mut self, addr: VirtualAddress) -> crate::Result<()> {
        let base = self
            .region_tree
            .find_region_containing_address(addr)
            .ok_or(Error::InvalidArgument)?
            .base();

        let region = self.user_region_mut(base)?;
        region.set_syscall_region(true);
        log::trace!("enabled syscalls from {:?}", region.range());
        Ok(())
    }

    fn user_region_mut(&mut self, base: VirtualAddress) -> crate::Result<&mut Region> {
        let region = self
            .region_tree
            .get_mut(base)
            .ok_or(Error::InvalidArgument)?;
        if !region.is_mmap() {
            return Err(Error::PermissionDenied);
        }
        Ok(region)
    }
}
