// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Memory usage accounting. All numbers are in bytes and are best-effort snapshots, they are not
//! synchronized with concurrent page faults.

use hashbrown::HashSet;

use super::AddressSpace;
use crate::{PageDirectory, Region, VmObjectId};

impl<P: PageDirectory> AddressSpace<P> {
    /// Virtual memory covered by regions.
    pub fn amount_virtual(&self) -> usize {
        self.regions().map(Region::size).sum()
    }

    /// Memory backed by physical pages.
    pub fn amount_resident(&self) -> usize {
        self.regions().map(Region::amount_resident).sum()
    }

    /// Memory whose physical pages are also referenced from elsewhere.
    pub fn amount_shared(&self) -> usize {
        self.regions().map(Region::amount_shared).sum()
    }

    /// Modified memory of regions private to this address space.
    pub fn amount_dirty_private(&self) -> usize {
        self.regions()
            .filter(|region| !region.is_shared())
            .map(Region::amount_dirty)
            .sum()
    }

    /// Clean memory of inode-backed objects. Objects mapped by multiple regions count once.
    pub fn amount_clean_inode(&self) -> usize {
        let mut seen = HashSet::new();

        self.regions()
            .map(Region::vmobject)
            .filter(|vmobject| vmobject.is_inode())
            .filter(|vmobject| seen.insert(VmObjectId::of(vmobject)))
            .map(|vmobject| vmobject.amount_clean())
            .sum()
    }

    /// Resident memory of purgeable anonymous objects that are currently volatile.
    pub fn amount_purgeable_volatile(&self) -> usize {
        self.amount_purgeable(true)
    }

    /// Resident memory of purgeable anonymous objects that are currently not volatile.
    pub fn amount_purgeable_nonvolatile(&self) -> usize {
        self.amount_purgeable(false)
    }

    fn amount_purgeable(&self, volatile: bool) -> usize {
        self.regions()
            .filter(|region| {
                let vmobject = region.vmobject();
                vmobject.is_anonymous()
                    && vmobject.is_purgeable()
                    && vmobject.is_volatile() == volatile
            })
            .map(Region::amount_resident)
            .sum()
    }
}
