// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `proptest` strategies for address space tests

use proptest::prelude::Strategy;

use crate::{VirtualAddress, VirtualRange, arch};

/// Produces page-aligned `VirtualAddress`s within `total`.
pub fn page_in(total: VirtualRange) -> impl Strategy<Value = VirtualAddress> {
    (0..total.page_count()).prop_map(move |page| total.base().add(page << arch::PAGE_SHIFT))
}

/// Produces non-empty page-aligned ranges of at most `max_pages` pages that lie within `total`.
///
/// # Panics
///
/// Panics if `total` is empty.
pub fn page_range_in(total: VirtualRange, max_pages: usize) -> impl Strategy<Value = VirtualRange> {
    let total_pages = total.page_count();
    assert!(total_pages > 0, "cannot pick a range out of an empty range");

    (0..total_pages, 1..=max_pages.max(1)).prop_map(move |(first, pages)| {
        let pages = pages.min(total_pages - first);
        VirtualRange::new(
            total.base().add(first << arch::PAGE_SHIFT),
            pages << arch::PAGE_SHIFT,
        )
    })
}

/// Produces ranges within `total` that are *not* page-aligned, for exercising page expansion.
pub fn unaligned_range_in(
    total: VirtualRange,
    max_size: usize,
) -> impl Strategy<Value = (VirtualAddress, usize)> {
    (0..total.size(), 1..=max_size.max(1)).prop_map(move |(offset, size)| {
        let size = size.min(total.size() - offset);
        (total.base().add(offset), size)
    })
}
