// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Platform constants consumed by the address space manager.

use static_assertions::const_assert;

use crate::{Error, MIB, VirtualAddress};

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = (PAGE_SIZE - 1).count_ones() as usize;
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);
const_assert!(PAGE_SIZE.is_power_of_two());

pub const VIRT_ADDR_BITS: u32 = 38;

/// Virtual address where the user address space starts.
///
/// The first 2MiB are reserved for catching null pointer dereferences.
pub const USER_RANGE_BASE: VirtualAddress = VirtualAddress::new(0x0000_0000_0020_0000);

/// First virtual address past the end of the user address space.
pub const USER_RANGE_CEILING: VirtualAddress = VirtualAddress::new(1 << VIRT_ADDR_BITS);

/// Upper bound (exclusive) for the random offset added to [`USER_RANGE_BASE`] when a fresh address
/// space picks its total range.
pub const MAX_ASPACE_RANDOM_OFFSET: usize = 32 * MIB;

const_assert!(USER_RANGE_BASE.is_page_aligned());
const_assert!(USER_RANGE_CEILING.is_page_aligned());
const_assert!(USER_RANGE_BASE.get() + MAX_ASPACE_RANDOM_OFFSET < USER_RANGE_CEILING.get());

#[inline]
pub const fn is_page_aligned(n: usize) -> bool {
    n & !PAGE_MASK == 0
}

#[inline]
pub const fn page_round_down(n: usize) -> usize {
    n & PAGE_MASK
}

/// Rounds `n` up to the next multiple of [`PAGE_SIZE`].
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if the result does not fit in a `usize`.
#[inline]
pub const fn page_round_up(n: usize) -> crate::Result<usize> {
    match n.checked_add(PAGE_SIZE - 1) {
        Some(n) => Ok(n & PAGE_MASK),
        None => Err(Error::InvalidArgument),
    }
}
