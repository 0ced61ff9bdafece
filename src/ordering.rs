//! Memory orderings shared by the bucket table, the bucket snapshots and
//! the ordering list.
//!
//! Every atomic access in the crate goes through one of these names so the
//! pairing between a publisher and its readers stays visible at the call site.

use std::sync::atomic::Ordering;

/// Loads of links, slots, snapshots and value slots.
/// Pairs with [`WRITE_ORD`] and with successful CAS publication.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Stores that publish data written before them (value slots, snapshots).
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Successful compare-and-swap on a link, a slot or the tail.
pub const CAS_SUCCESS: Ordering = Ordering::AcqRel;

/// Failed compare-and-swap: only the current value is needed.
pub const CAS_FAILURE: Ordering = Ordering::Acquire;

/// Accesses already ordered by a held bucket lock or by exclusive ownership.
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Taking a bucket lock.
pub const LOCK_ORD: Ordering = Ordering::Acquire;

/// Releasing a bucket lock. Makes the critical section visible to the next holder.
pub const UNLOCK_ORD: Ordering = Ordering::Release;
