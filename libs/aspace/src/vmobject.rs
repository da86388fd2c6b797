// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::{AllocationStrategy, Error, arch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmObjectKind {
    /// Zero-initialized memory not backed by any file.
    Anonymous,
    /// Memory backed by the contents of an inode.
    Inode,
}

/// A reference-counted store of pages that one or more regions map a window of.
///
/// Byte-count queries take a range of offsets *into the object*; implementations round it out to
/// page boundaries.
pub trait VmObject: fmt::Debug + Send + Sync {
    /// Size of the object in bytes. Always a multiple of [`arch::PAGE_SIZE`].
    fn size(&self) -> usize;

    fn kind(&self) -> VmObjectKind;

    fn is_anonymous(&self) -> bool {
        self.kind() == VmObjectKind::Anonymous
    }

    fn is_inode(&self) -> bool {
        self.kind() == VmObjectKind::Inode
    }

    /// Whether the object's pages may be discarded under memory pressure while volatile.
    fn is_purgeable(&self) -> bool {
        false
    }

    fn is_volatile(&self) -> bool {
        false
    }

    /// Bytes in `range` currently backed by physical pages.
    fn amount_resident(&self, range: Range<usize>) -> usize;

    /// Bytes in `range` that differ from the backing store.
    fn amount_dirty(&self, range: Range<usize>) -> usize {
        self.amount_resident(range)
    }

    /// Bytes in `range` whose physical pages are also referenced from elsewhere.
    fn amount_shared(&self, _range: Range<usize>) -> usize {
        0
    }

    /// Bytes of the whole object that are resident but identical to the backing store.
    fn amount_clean(&self) -> usize {
        0
    }
}

/// Stable identity of a [`VmObject`], derived from its shared allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmObjectId(usize);

impl VmObjectId {
    pub fn of(vmobject: &Arc<dyn VmObject>) -> Self {
        Self(Arc::as_ptr(vmobject).cast::<()>().addr())
    }
}

/// Anonymous memory, the backing store for plain allocations.
///
/// Residency is tracked per page in a bitmap so that windows of the object (as used by split
/// regions) can be accounted for independently.
pub struct AnonymousVmObject {
    size: usize,
    strategy: AllocationStrategy,
    purgeable: bool,
    volatile: AtomicBool,
    committed_pages: AtomicUsize,
    resident: Vec<AtomicU64>,
}

impl fmt::Debug for AnonymousVmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnonymousVmObject")
            .field("size", &self.size)
            .field("strategy", &self.strategy)
            .field("purgeable", &self.purgeable)
            .field("volatile", &self.volatile.load(Ordering::Relaxed))
            .field("committed_pages", &self.committed_pages.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl AnonymousVmObject {
    /// Creates a new anonymous memory object of `size` bytes, committing its pages according to
    /// `strategy`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `size` is zero or not page-aligned and
    /// [`Error::NoMemory`] if the residency bookkeeping cannot be allocated.
    pub fn try_create_with_size(size: usize, strategy: AllocationStrategy) -> crate::Result<Arc<Self>> {
        Self::try_create(size, strategy, false)
    }

    /// Like [`try_create_with_size`][Self::try_create_with_size] but the object is purgeable:
    /// userspace may mark it volatile to allow the kernel to reclaim its pages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `size` is zero or not page-aligned and
    /// [`Error::NoMemory`] if the residency bookkeeping cannot be allocated.
    pub fn try_create_purgeable_with_size(
        size: usize,
        strategy: AllocationStrategy,
    ) -> crate::Result<Arc<Self>> {
        Self::try_create(size, strategy, true)
    }

    fn try_create(
        size: usize,
        strategy: AllocationStrategy,
        purgeable: bool,
    ) -> crate::Result<Arc<Self>> {
        if size == 0 || !arch::is_page_aligned(size) {
            return Err(Error::InvalidArgument);
        }

        let page_count = size >> arch::PAGE_SHIFT;
        let words = page_count.div_ceil(64);

        let mut resident = Vec::new();
        resident
            .try_reserve_exact(words)
            .map_err(|_| Error::NoMemory)?;

        let fill = if strategy == AllocationStrategy::AllocateNow {
            u64::MAX
        } else {
            0
        };
        resident.resize_with(words, || AtomicU64::new(fill));
        // clear the bits past the last page so they never count as resident
        if let Some(last) = resident.last_mut() {
            let tail = page_count % 64;
            if tail != 0 {
                *last.get_mut() &= (1 << tail) - 1;
            }
        }

        let committed_pages = match strategy {
            AllocationStrategy::Reserve | AllocationStrategy::AllocateNow => page_count,
            AllocationStrategy::None => 0,
        };

        log::trace!("created anonymous vmobject of {size:#x} bytes ({strategy:?})");

        Ok(Arc::new(Self {
            size,
            strategy,
            purgeable,
            volatile: AtomicBool::new(false),
            committed_pages: AtomicUsize::new(committed_pages),
            resident,
        }))
    }

    pub fn strategy(&self) -> AllocationStrategy {
        self.strategy
    }

    pub fn page_count(&self) -> usize {
        self.size >> arch::PAGE_SHIFT
    }

    /// Number of pages counted against the commit limit.
    pub fn committed_pages(&self) -> usize {
        self.committed_pages.load(Ordering::Relaxed)
    }

    /// Populates the page at `page_index` (as a page fault would), returning `true` if it was not
    /// resident before.
    ///
    /// # Panics
    ///
    /// Panics if `page_index` is out of bounds.
    pub fn commit_page(&self, page_index: usize) -> bool {
        assert!(
            page_index < self.page_count(),
            "page index {page_index} out of bounds for object with {} pages",
            self.page_count()
        );

        let bit = 1 << (page_index % 64);
        let prev = self.resident[page_index / 64].fetch_or(bit, Ordering::AcqRel);
        let newly_resident = prev & bit == 0;

        if newly_resident && self.strategy == AllocationStrategy::None {
            self.committed_pages.fetch_add(1, Ordering::Relaxed);
        }

        newly_resident
    }

    pub fn is_page_resident(&self, page_index: usize) -> bool {
        page_index < self.page_count()
            && self.resident[page_index / 64].load(Ordering::Acquire) & (1 << (page_index % 64)) != 0
    }

    /// Marks a purgeable object volatile (its pages may be reclaimed) or non-volatile.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the object is not purgeable.
    pub fn set_volatile(&self, volatile: bool) -> crate::Result<()> {
        if !self.purgeable {
            return Err(Error::InvalidArgument);
        }
        self.volatile.store(volatile, Ordering::Release);
        Ok(())
    }
}

impl VmObject for AnonymousVmObject {
    fn size(&self) -> usize {
        self.size
    }

    fn kind(&self) -> VmObjectKind {
        VmObjectKind::Anonymous
    }

    fn is_purgeable(&self) -> bool {
        self.purgeable
    }

    fn is_volatile(&self) -> bool {
        self.volatile.load(Ordering::Acquire)
    }

    fn amount_resident(&self, range: Range<usize>) -> usize {
        let first_page = range.start >> arch::PAGE_SHIFT;
        let last_page = range.end.div_ceil(arch::PAGE_SIZE).min(self.page_count());

        (first_page..last_page)
            .filter(|page| self.is_page_resident(*page))
            .count()
            * arch::PAGE_SIZE
    }
}
