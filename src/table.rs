//! Fixed-size array of bucket slots.
//!
//! Each slot is either empty (null) or holds one installed [`BucketCell`].
//! Slots change only by CAS: empty -> cell when the first key of a slot is
//! inserted, cell -> empty when a removal leaves the bucket with no nodes.
//! The table never grows.

use std::ptr as StdPtr;
use std::sync::atomic::AtomicPtr;

use seize::{Guard, LocalGuard};

use crate::bucket::BucketCell;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED};
use crate::tracing_helpers::debug_log;

/// Number of slots when no capacity is given.
pub const DEFAULT_CAPACITY: usize = 8;

/// Largest slot count a table accepts.
pub const MAXIMUM_CAPACITY: usize = 1 << 30;

/// Mix the high bits of a hash into the low bits used for indexing.
#[inline(always)]
#[must_use]
pub const fn spread(hash: u64) -> u64 {
    hash ^ (hash >> 16)
}

/// Round a requested capacity to the slot count actually allocated.
///
/// Zero becomes one; anything above [`MAXIMUM_CAPACITY`] is clamped.
#[must_use]
pub const fn table_size_for(capacity: usize) -> usize {
    if capacity >= MAXIMUM_CAPACITY {
        return MAXIMUM_CAPACITY;
    }
    if capacity <= 1 {
        return 1;
    }
    capacity.next_power_of_two()
}

pub(crate) struct BucketTable<B> {
    slots: Box<[AtomicPtr<BucketCell<B>>]>,
    mask: usize,
}

impl<B> BucketTable<B> {
    pub(crate) fn new(capacity: usize) -> Self {
        let len: usize = table_size_for(capacity);
        let slots: Box<[AtomicPtr<BucketCell<B>>]> = (0..len)
            .map(|_| AtomicPtr::new(StdPtr::null_mut()))
            .collect();

        Self {
            slots,
            mask: len - 1,
        }
    }

    #[inline]
    pub(crate) const fn len(&self) -> usize {
        self.slots.len()
    }

    /// Slot index for `hash`.
    #[inline(always)]
    #[expect(
        clippy::cast_possible_truncation,
        reason = "the mask is below 2^30, so truncating the spread hash keeps every used bit"
    )]
    pub(crate) const fn locate(&self, hash: u64) -> usize {
        (spread(hash) as usize) & self.mask
    }

    /// Bucket installed at `index`, if any.
    #[inline]
    pub(crate) fn load<'g>(&self, index: usize, guard: &'g LocalGuard<'_>) -> Option<&'g BucketCell<B>> {
        let ptr: *mut BucketCell<B> = guard.protect(&self.slots[index], READ_ORD);

        // SAFETY: installed cells are retired through the collector after
        // they are detached, so a protected pointer outlives `guard`.
        unsafe { ptr.as_ref() }
    }

    /// Publish `cell` into the empty slot at `index`.
    ///
    /// Returns `false` if another writer installed a bucket first; `cell` then
    /// still belongs to the caller.
    #[inline]
    pub(crate) fn install(&self, index: usize, cell: *mut BucketCell<B>) -> bool {
        let installed: bool = self.slots[index]
            .compare_exchange(StdPtr::null_mut(), cell, CAS_SUCCESS, CAS_FAILURE)
            .is_ok();

        if installed {
            debug_log!(slot = index, "bucket installed");
        } else {
            debug_log!(slot = index, "bucket install lost race");
        }
        installed
    }

    /// Empty the slot at `index` if it still holds `cell`, and retire the cell.
    ///
    /// The caller must hold the cell's lock and have marked it detached.
    pub(crate) fn detach(&self, index: usize, cell: &BucketCell<B>, guard: &LocalGuard<'_>) {
        let ptr: *mut BucketCell<B> = StdPtr::from_ref(cell).cast_mut();
        let detached: bool = self.slots[index]
            .compare_exchange(ptr, StdPtr::null_mut(), CAS_SUCCESS, CAS_FAILURE)
            .is_ok();

        if detached {
            debug_log!(slot = index, "bucket detached");
            // SAFETY: the slot no longer references the cell; concurrent
            // readers that loaded it are protected by their guards.
            unsafe { guard.defer_retire(ptr, BucketCell::<B>::reclaim) };
        }
    }

    /// Drain every installed cell. Teardown only.
    pub(crate) fn take_all(&mut self) -> impl Iterator<Item = *mut BucketCell<B>> + '_ {
        self.slots.iter_mut().filter_map(|slot| {
            let ptr: *mut BucketCell<B> = slot.swap(StdPtr::null_mut(), RELAXED);
            (!ptr.is_null()).then_some(ptr)
        })
    }
}
