// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::Region;

/// Whether the page directory should invalidate stale TLB entries for the affected range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldFlushTlb {
    No,
    Yes,
}

/// Proof that the page directory's lock is held.
pub type PageDirectoryGuard<'a, P> =
    lock_api::MutexGuard<'a, <P as PageDirectory>::RawMutex, ()>;

/// The hardware-facing mapping context of an address space.
///
/// Implementations own the page tables and are shared with remote cores for TLB shootdown, hence
/// the `&self` receivers.
pub trait PageDirectory: Send + Sync {
    type RawMutex: lock_api::RawMutex;

    /// Acquires the directory's lock. Lazy fault-driven mapping holds the same lock, so holding
    /// the guard keeps mappings from appearing underneath the caller.
    fn lock(&self) -> PageDirectoryGuard<'_, Self>;

    /// Installs hardware mappings for the whole of `region`.
    ///
    /// Implementations acquire their lock internally.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoMemory`][crate::Error::NoMemory] if the page tables needed to map the
    /// region cannot be allocated.
    fn map(&self, region: &Region, flush: ShouldFlushTlb) -> crate::Result<()>;

    /// Removes all hardware mappings covering `region`. The caller already holds the lock.
    fn unmap(&self, region: &Region, flush: ShouldFlushTlb, guard: &PageDirectoryGuard<'_, Self>);
}
