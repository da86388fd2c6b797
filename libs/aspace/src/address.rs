// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::arch;

#[repr(transparent)]
#[derive(Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    pub const MAX: Self = Self(usize::MAX);
    pub const MIN: Self = Self(usize::MIN);
    pub const BITS: u32 = usize::BITS;

    #[must_use]
    pub const fn new(n: usize) -> Self {
        Self(n)
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    /// Returns `true` if this is the null address, which callers use to mean "no particular
    /// address requested".
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Adds an unsigned offset to this address, panicking if overflow occurred.
    #[must_use]
    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    /// Subtracts an unsigned offset from this address, panicking if overflow occurred.
    #[must_use]
    #[inline]
    pub const fn sub(self, offset: usize) -> Self {
        Self(self.0 - offset)
    }

    /// Adds an unsigned offset to this address, returning `None` if overflow occurred.
    #[must_use]
    #[inline]
    pub const fn checked_add(self, offset: usize) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    /// Subtracts an unsigned offset from this address, returning `None` if overflow occurred.
    #[must_use]
    #[inline]
    pub const fn checked_sub(self, offset: usize) -> Option<Self> {
        match self.0.checked_sub(offset) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    /// Calculates the distance between two addresses in bytes, _where it's known that `self`
    /// is equal to or greater than `origin`_.
    ///
    /// # Panics
    ///
    /// Panics if `self` is less than `origin`.
    #[must_use]
    #[inline]
    pub const fn offset_from_unsigned(self, origin: Self) -> usize {
        let (a, b) = self.0.overflowing_sub(origin.0);
        if b {
            panic!("attempt to subtract with overflow")
        } else {
            a
        }
    }

    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[must_use]
    #[inline]
    pub const fn is_aligned_to(self, align: usize) -> bool {
        assert!(
            align.is_power_of_two(),
            "is_aligned_to: align is not a power-of-two"
        );

        self.0 & (align - 1) == 0
    }

    /// Rounds this address up to `align`, returning `None` if that would overflow.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[must_use]
    #[inline]
    pub const fn checked_align_up(self, align: usize) -> Option<Self> {
        assert!(
            align.is_power_of_two(),
            "checked_align_up: align is not a power-of-two"
        );

        match self.0.checked_add(align - 1) {
            Some(n) => Some(Self(n & 0usize.wrapping_sub(align))),
            None => None,
        }
    }

    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[must_use]
    #[inline]
    pub const fn align_down(self, align: usize) -> Self {
        assert!(
            align.is_power_of_two(),
            "align_down: align is not a power-of-two"
        );

        let aligned = Self(self.0 & 0usize.wrapping_sub(align));
        debug_assert!(aligned.0 <= self.0);
        aligned
    }

    /// The base address of the page this address falls into.
    #[must_use]
    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & arch::PAGE_MASK)
    }

    #[must_use]
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & !arch::PAGE_MASK == 0
    }
}

impl From<usize> for VirtualAddress {
    fn from(value: usize) -> Self {
        VirtualAddress(value)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:#018x}", self.0)) // 18 digits to account for the leading 0x
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VirtualAddress")
            .field(&format_args!("{:#018x}", self.0)) // 18 digits to account for the leading 0x
            .finish()
    }
}
