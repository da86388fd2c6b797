// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

bitflags::bitflags! {
    /// `mmap`-style protection bits as requested by userspace.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Rules that dictate how the memory covered by a region may be accessed.
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        /// If set, reading from the region is allowed.
        const READ = 1 << 0;
        /// If set, writing to the region is allowed.
        const WRITE = 1 << 1;
        /// If set, executing code from the region is allowed.
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    /// `PROT_NONE`: the mapping may not be accessed at all.
    pub const NONE: Self = Self::empty();
}

impl From<Protection> for Access {
    fn from(prot: Protection) -> Self {
        let mut access = Access::empty();
        access.set(Access::READ, prot.contains(Protection::READ));
        access.set(Access::WRITE, prot.contains(Protection::WRITE));
        access.set(Access::EXECUTE, prot.contains(Protection::EXEC));
        access
    }
}

impl fmt::Debug for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };

        write!(
            f,
            "{}{}{}",
            flag(self.contains(Access::READ), 'R'),
            flag(self.contains(Access::WRITE), 'W'),
            flag(self.contains(Access::EXECUTE), 'X'),
        )
    }
}

/// The kind of physical memory behind a region, which decides how it is cached.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// Regular, cacheable memory.
    #[default]
    Normal,
    /// Device memory that must not be cached.
    Io,
}

impl MemoryType {
    pub const fn is_cacheable(self) -> bool {
        matches!(self, MemoryType::Normal)
    }
}

/// How eagerly an anonymous memory object commits its backing pages.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationStrategy {
    /// Count all pages against the commit limit up front but populate them lazily on first access.
    #[default]
    Reserve,
    /// Populate every page right away.
    AllocateNow,
    /// Neither commit nor populate anything; pages are provided on demand.
    None,
}
