// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use core::ops::Range;

use crate::{
    Access, Error, MemoryType, PageDirectory, PageDirectoryGuard, ShouldFlushTlb, VirtualAddress,
    VirtualRange, VmObject,
};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegionFlags: u8 {
        /// The backing pages are shared with other mappings, writes are visible to them.
        const SHARED = 1 << 0;
        /// The region was created through `mmap` and may be unmapped or resealed by userspace.
        const MMAP = 1 << 1;
        /// The region is a thread stack.
        const STACK = 1 << 2;
        /// System calls may be issued from code inside this region.
        const SYSCALL = 1 << 3;
        /// The region is sealed, its layout and access can no longer change.
        const IMMUTABLE = 1 << 4;
    }
}

/// Where a region stands with respect to the page directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    /// Not associated with any page directory.
    Detached,
    /// Associated with the page directory but no hardware mappings were created (deferred
    /// mapping of inaccessible regions).
    Attached,
    /// Present in the page directory.
    Mapped,
}

/// A region that has been described but not yet placed into an address space.
///
/// Converting it into a [`Region`] requires a concrete range, which only the
/// [`RegionTree`][crate::RegionTree] hands out.
#[derive(Debug)]
pub struct UnplacedRegion {
    vmobject: Arc<dyn VmObject>,
    offset_in_vmobject: usize,
    name: Option<String>,
    access: Access,
    memory_type: MemoryType,
    flags: RegionFlags,
}

impl UnplacedRegion {
    pub fn new(
        vmobject: Arc<dyn VmObject>,
        offset_in_vmobject: usize,
        name: Option<String>,
        access: Access,
        memory_type: MemoryType,
        shared: bool,
    ) -> Self {
        let mut flags = RegionFlags::empty();
        flags.set(RegionFlags::SHARED, shared);

        Self {
            vmobject,
            offset_in_vmobject,
            name,
            access,
            memory_type,
            flags,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: RegionFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn vmobject(&self) -> &Arc<dyn VmObject> {
        &self.vmobject
    }

    pub fn offset_in_vmobject(&self) -> usize {
        self.offset_in_vmobject
    }

    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    /// Binds this description to `range`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `range` is empty or misaligned or if the window
    /// `[offset, offset + range.size)` does not fit into the backing object.
    pub(crate) fn place(self, range: VirtualRange) -> crate::Result<Region> {
        if range.is_empty() || !range.is_page_aligned() {
            return Err(Error::InvalidArgument);
        }

        let window_end = self
            .offset_in_vmobject
            .checked_add(range.size())
            .ok_or(Error::InvalidArgument)?;
        if window_end > self.vmobject.size() {
            log::debug!(
                "window {:#x}..{window_end:#x} exceeds vmobject of {:#x} bytes",
                self.offset_in_vmobject,
                self.vmobject.size()
            );
            return Err(Error::InvalidArgument);
        }

        Ok(Region {
            range,
            vmobject: self.vmobject,
            offset_in_vmobject: self.offset_in_vmobject,
            name: self.name,
            access: self.access,
            memory_type: self.memory_type,
            flags: self.flags,
            state: MappingState::Detached,
        })
    }
}

/// One mapping: a window of a [`VmObject`] placed at a fixed range of virtual addresses.
pub struct Region {
    range: VirtualRange,
    vmobject: Arc<dyn VmObject>,
    offset_in_vmobject: usize,
    name: Option<String>,
    access: Access,
    memory_type: MemoryType,
    flags: RegionFlags,
    state: MappingState,
}

impl Region {
    #[inline]
    pub fn range(&self) -> VirtualRange {
        self.range
    }

    #[inline]
    pub fn base(&self) -> VirtualAddress {
        self.range.base()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.range.size()
    }

    #[inline]
    pub fn end(&self) -> VirtualAddress {
        self.range.end()
    }

    pub fn vmobject(&self) -> &Arc<dyn VmObject> {
        &self.vmobject
    }

    pub fn offset_in_vmobject(&self) -> usize {
        self.offset_in_vmobject
    }

    /// The offsets into the backing object covered by this region.
    pub fn vmobject_range(&self) -> Range<usize> {
        self.offset_in_vmobject..self.offset_in_vmobject + self.range.size()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn set_access(&mut self, access: Access) {
        self.access = access;
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(RegionFlags::SHARED)
    }

    pub fn is_mmap(&self) -> bool {
        self.flags.contains(RegionFlags::MMAP)
    }

    pub fn set_mmap(&mut self, mmap: bool) {
        self.flags.set(RegionFlags::MMAP, mmap);
    }

    pub fn is_stack(&self) -> bool {
        self.flags.contains(RegionFlags::STACK)
    }

    pub fn set_stack(&mut self, stack: bool) {
        self.flags.set(RegionFlags::STACK, stack);
    }

    pub fn is_syscall_region(&self) -> bool {
        self.flags.contains(RegionFlags::SYSCALL)
    }

    pub fn set_syscall_region(&mut self, syscall: bool) {
        self.flags.set(RegionFlags::SYSCALL, syscall);
    }

    pub fn is_immutable(&self) -> bool {
        self.flags.contains(RegionFlags::IMMUTABLE)
    }

    pub fn set_immutable(&mut self) {
        self.flags.insert(RegionFlags::IMMUTABLE);
    }

    pub fn mapping_state(&self) -> MappingState {
        self.state
    }

    pub fn is_mapped(&self) -> bool {
        self.state == MappingState::Mapped
    }

    /// Whether userspace may remove or reshape this region.
    pub(crate) fn check_user_modifiable(&self) -> crate::Result<()> {
        if !self.is_mmap() || self.is_immutable() {
            log::debug!(
                "rejecting modification of {:?} ({}), mmap={} immutable={}",
                self.range,
                self.name().unwrap_or("<anonymous>"),
                self.is_mmap(),
                self.is_immutable()
            );
            return Err(Error::PermissionDenied);
        }
        Ok(())
    }

    pub fn amount_resident(&self) -> usize {
        self.vmobject.amount_resident(self.vmobject_range())
    }

    pub fn amount_dirty(&self) -> usize {
        self.vmobject.amount_dirty(self.vmobject_range())
    }

    pub fn amount_shared(&self) -> usize {
        self.vmobject.amount_shared(self.vmobject_range())
    }

    /// Installs hardware mappings for this region.
    ///
    /// # Errors
    ///
    /// Propagates the page directory's error, in which case the region's state is unchanged.
    pub fn map<P: PageDirectory>(&mut self, page_directory: &P, flush: ShouldFlushTlb) -> crate::Result<()> {
        page_directory.map(self, flush)?;
        self.state = MappingState::Mapped;
        log::trace!("mapped {:?} {}", self.range, self.access);
        Ok(())
    }

    /// Associates this region with the page directory without creating hardware mappings.
    ///
    /// # Panics
    ///
    /// Panics if the region is currently mapped.
    pub fn attach(&mut self) {
        assert_ne!(
            self.state,
            MappingState::Mapped,
            "attaching {:?} would leak its hardware mappings",
            self.range
        );
        self.state = MappingState::Attached;
    }

    /// Removes this region's hardware mappings, acquiring the page directory's lock for it.
    pub fn unmap<P: PageDirectory>(&mut self, page_directory: &P, flush: ShouldFlushTlb) {
        match self.state {
            MappingState::Detached => {}
            MappingState::Attached => self.state = MappingState::Detached,
            MappingState::Mapped => {
                let guard = page_directory.lock();
                self.unmap_with_lock_held(page_directory, flush, &guard);
            }
        }
    }

    /// Like [`unmap`][Self::unmap] but for callers that already hold the page directory's lock.
    pub fn unmap_with_lock_held<P: PageDirectory>(
        &mut self,
        page_directory: &P,
        flush: ShouldFlushTlb,
        guard: &PageDirectoryGuard<'_, P>,
    ) {
        if self.state == MappingState::Mapped {
            page_directory.unmap(self, flush, guard);
            log::trace!("unmapped {:?}", self.range);
        }
        self.state = MappingState::Detached;
    }

    /// # Panics
    ///
    /// Panics if the range is empty or misaligned, the window extends past the end of the
    /// vmobject, or the region is mapped without any access.
    #[track_caller]
    pub fn assert_valid(&self, msg: &str) {
        assert!(!self.range.is_empty(), "{msg}region range cannot be empty");
        assert!(
            self.range.is_page_aligned(),
            "{msg}region range must be page aligned; region={self:?}"
        );
        assert!(
            self.vmobject_range().end <= self.vmobject.size(),
            "{msg}region cannot extend past the end of its vmobject; region={self:?}"
        );
        assert!(
            !(self.access.is_empty() && self.is_mapped()),
            "{msg}inaccessible region must not be mapped; region={self:?}"
        );
    }

    /// Describes a new region covering `range` (which must lie within this region) over the same
    /// backing object, with the offset adjusted to where `range` starts.
    ///
    /// Name, memory type and flags are inherited, the seal is not.
    ///
    /// # Panics
    ///
    /// Panics if `range` is not contained in this region.
    pub fn split_off(&self, range: VirtualRange, access: Access) -> UnplacedRegion {
        assert!(
            self.range.contains(range),
            "cannot split {range:?} off {:?}",
            self.range
        );

        let offset = self.offset_in_vmobject + range.base().offset_from_unsigned(self.base());

        UnplacedRegion {
            vmobject: self.vmobject.clone(),
            offset_in_vmobject: offset,
            name: self.name.clone(),
            access,
            memory_type: self.memory_type,
            flags: self.flags.difference(RegionFlags::IMMUTABLE),
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("range", &self.range)
            .field("name", &self.name)
            .field("access", &self.access)
            .field("memory_type", &self.memory_type)
            .field("flags", &self.flags)
            .field("offset_in_vmobject", &format_args!("{:#x}", self.offset_in_vmobject))
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.state == MappingState::Mapped {
            log::error!(
                "region {:?} ({}) dropped while still mapped",
                self.range,
                self.name().unwrap_or("<anonymous>")
            );
        }
    }
}
