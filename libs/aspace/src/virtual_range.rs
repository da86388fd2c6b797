// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ops::Range;

use arrayvec::ArrayVec;

use crate::{Error, VirtualAddress, arch};

/// What is left of a range after carving a sub-range out of it: the prefix and/or the suffix,
/// in address order.
pub type CarvedRanges = ArrayVec<VirtualRange, 2>;

/// A half-open interval `[base, base + size)` of virtual addresses.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualRange {
    base: VirtualAddress,
    size: usize,
}

impl VirtualRange {
    #[must_use]
    pub const fn new(base: VirtualAddress, size: usize) -> Self {
        Self { base, size }
    }

    /// Builds the range `[start, end)`.
    ///
    /// # Panics
    ///
    /// Panics if `end` is less than `start`.
    #[must_use]
    pub const fn from_bounds(start: VirtualAddress, end: VirtualAddress) -> Self {
        Self {
            base: start,
            size: end.offset_from_unsigned(start),
        }
    }

    /// Returns the smallest page-aligned range covering `[addr, addr + size)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `addr + size` or rounding it up to the next page
    /// boundary overflows.
    pub fn expand_to_page_boundaries(addr: usize, size: usize) -> crate::Result<Self> {
        let end = addr.checked_add(size).ok_or(Error::InvalidArgument)?;
        let base = arch::page_round_down(addr);
        let end = arch::page_round_up(end)?;

        Ok(Self {
            base: VirtualAddress::new(base),
            size: end - base,
        })
    }

    #[inline]
    pub const fn base(self) -> VirtualAddress {
        self.base
    }

    #[inline]
    pub const fn size(self) -> usize {
        self.size
    }

    /// The first address past the end of this range.
    #[inline]
    pub const fn end(self) -> VirtualAddress {
        self.base.add(self.size)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.size == 0
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.base.is_page_aligned() && arch::is_page_aligned(self.size)
    }

    /// Number of pages covered by this range, assuming it is page-aligned.
    #[inline]
    pub const fn page_count(self) -> usize {
        self.size >> arch::PAGE_SHIFT
    }

    /// Returns `true` if `addr` lies within this range.
    pub fn contains_address(self, addr: VirtualAddress) -> bool {
        self.base <= addr && addr < self.end()
    }

    /// Returns `true` if all of `other` lies within this range.
    pub fn contains(self, other: VirtualRange) -> bool {
        other.base >= self.base && other.end() <= self.end()
    }

    /// Returns `true` if there exists an address present in both ranges.
    pub fn intersects(self, other: VirtualRange) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.base < other.end()
            && other.base < self.end()
    }

    /// Returns the intersection of `self` and `other`, which is empty if they are disjoint.
    #[must_use]
    pub fn intersect(self, other: VirtualRange) -> VirtualRange {
        let base = self.base.max(other.base);
        let end = self.end().min(other.end());

        if base < end {
            VirtualRange::from_bounds(base, end)
        } else {
            VirtualRange::new(base, 0)
        }
    }

    /// Removes `taken` from this range, returning the non-empty prefix `[self.base, taken.base)`
    /// and the non-empty suffix `[taken.end, self.end)`, in that order.
    ///
    /// # Panics
    ///
    /// Panics if `taken` is not contained in this range.
    #[must_use]
    pub fn carve(self, taken: VirtualRange) -> CarvedRanges {
        assert!(
            self.contains(taken),
            "cannot carve {taken:?} out of {self:?}, it is not contained"
        );

        let mut parts = CarvedRanges::new();
        if taken == self {
            return parts;
        }
        if taken.base > self.base {
            parts.push(VirtualRange::from_bounds(self.base, taken.base));
        }
        if taken.end() < self.end() {
            parts.push(VirtualRange::from_bounds(taken.end(), self.end()));
        }
        parts
    }

    pub const fn as_range(self) -> Range<VirtualAddress> {
        self.base..self.end()
    }
}

impl fmt::Debug for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.base, self.end())
    }
}

impl fmt::Display for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{} ({:#x} bytes)", self.base, self.end(), self.size)
    }
}
