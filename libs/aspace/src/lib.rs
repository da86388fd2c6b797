// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg_attr(not(any(test, feature = "test_utils")), no_std)]

//! Bookkeeping for the virtual address space of a user process.
//!
//! An [`AddressSpace`] carves a flat range of virtual addresses into non-overlapping [`Region`]s,
//! each of which maps a window of a reference-counted [`VmObject`]. Regions live in an
//! address-ordered [`RegionTree`] which is the source of truth for "this address range is taken".
//! Hardware mappings are materialized through the [`PageDirectory`] collaborator; the tree itself
//! never touches page tables.
//!
//! ## Ordering between the tree and the page directory
//!
//! Every multi-step operation inserts into the tree *before* it asks the page directory to install
//! a mapping, and removes a region from the tree again if installing the mapping fails. Operations
//! spanning multiple regions validate all of them up front so they either fully succeed or leave
//! the address space untouched.
//!
//! ## Concurrency
//!
//! Mutating operations take `&mut self` and must be serialized by the owner (usually the process).
//! The only internal lock is the page directory's own, taken once by
//! [`AddressSpace::remove_all_regions`] to interlock teardown against lazy fault-driven mapping on
//! other cores.

extern crate alloc;

mod access;
mod address;
mod address_space;
pub mod arch;
mod error;
mod page_directory;
mod region;
mod region_tree;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
mod virtual_range;
mod vmobject;

pub use access::{Access, AllocationStrategy, MemoryType, Protection};
pub use address::VirtualAddress;
pub use address_space::{AddressSpace, Placement, TeardownContext};
pub use error::Error;
pub use page_directory::{PageDirectory, PageDirectoryGuard, ShouldFlushTlb};
pub use region::{MappingState, Region, RegionFlags, UnplacedRegion};
pub use region_tree::{Gaps, RegionTree};
pub use virtual_range::{CarvedRanges, VirtualRange};
pub use vmobject::{AnonymousVmObject, VmObject, VmObjectId, VmObjectKind};

pub type Result<T> = core::result::Result<T, Error>;

pub const KIB: usize = 1024;
pub const MIB: usize = KIB * 1024;
pub const GIB: usize = MIB * 1024;
