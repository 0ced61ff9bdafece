//! Lock word guarding one bucket.
//!
//! [`BucketLock`] packs the lock bit and a detached flag into a single `u32`.
//! Writers take the lock with [`BucketLock::lock`] and receive a
//! [`LockGuard`]; the guard releases on drop (panic-safe).
//!
//! # Type-State Pattern
//! Operations that need the lock take `&LockGuard` as proof:
//!
//! ```rust
//! use clhm::lock::BucketLock;
//!
//! let lock = BucketLock::new();
//! let mut guard = lock.lock();
//! guard.mark_detached();
//! drop(guard);
//!
//! assert!(lock.is_detached());
//! assert!(!lock.is_locked());
//! ```
//!
//! # Detach
//! A bucket that became empty is detached from its table slot while locked.
//! [`LockGuard::mark_detached`] sets a sticky flag; a writer that acquires the
//! lock of a detached bucket must release it and look the slot up again.

use std::hint;
use std::marker::PhantomData;
use std::sync::atomic::AtomicU32;
use std::thread;

use crate::ordering::{CAS_FAILURE, LOCK_ORD, READ_ORD, RELAXED, UNLOCK_ORD, WRITE_ORD};

/// Lock bit: a writer holds the bucket.
const LOCK_BIT: u32 = 1 << 0;

/// Detached bit: the bucket has been removed from its slot. Never cleared.
const DETACHED_BIT: u32 = 1 << 1;

/// Spins before the waiter starts yielding its time slice.
const SPIN_LIMIT: u32 = 6;

/// Lock word for a bucket.
///
/// # Layout
/// Bits 2-31: unused | Bit 1: `detached` | Bit 0: `locked`
#[derive(Debug, Default)]
pub struct BucketLock {
    value: AtomicU32,
}

/// Proof that a [`BucketLock`] is held.
///
/// Only [`BucketLock::lock`] and [`BucketLock::try_lock`] create one. The lock
/// is released when the guard drops, including during unwinding.
///
/// `PhantomData<*mut ()>` keeps the guard `!Send` and `!Sync`: a lock must be
/// released by the thread that took it.
#[derive(Debug)]
#[must_use = "dropping the guard immediately releases the bucket lock"]
pub struct LockGuard<'a> {
    lock: &'a BucketLock,
    locked_value: u32,
    _marker: PhantomData<*mut ()>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock
            .value
            .store(self.locked_value & !LOCK_BIT, UNLOCK_ORD);
    }
}

impl LockGuard<'_> {
    /// Flag the bucket as detached from the table. Sticky.
    #[inline]
    pub fn mark_detached(&mut self) {
        // INVARIANT: lock is held, so no concurrent modification of the word.
        let value: u32 = self.lock.value.load(RELAXED);
        self.lock.value.store(value | DETACHED_BIT, WRITE_ORD);
        self.locked_value |= DETACHED_BIT;
    }

    /// Whether the bucket was detached before or during this critical section.
    #[inline]
    #[must_use]
    pub const fn is_detached(&self) -> bool {
        self.locked_value & DETACHED_BIT != 0
    }
}

impl BucketLock {
    /// Create an unlocked, attached lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: AtomicU32::new(0),
        }
    }

    /// Whether a writer currently holds the lock.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.value.load(RELAXED) & LOCK_BIT != 0
    }

    /// Whether the bucket has been detached from its slot.
    #[inline]
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.value.load(READ_ORD) & DETACHED_BIT != 0
    }

    /// Acquire the lock, spinning and then yielding while it is held elsewhere.
    pub fn lock(&self) -> LockGuard<'_> {
        let mut spins: u32 = 0;

        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }

            if spins < SPIN_LIMIT {
                for _ in 0..(1 << spins) {
                    hint::spin_loop();
                }
                spins += 1;
            } else {
                thread::yield_now();
            }
        }
    }

    /// Acquire the lock if it is free.
    #[must_use]
    pub fn try_lock(&self) -> Option<LockGuard<'_>> {
        let value: u32 = self.value.load(RELAXED);
        if value & LOCK_BIT != 0 {
            return None;
        }

        let locked: u32 = value | LOCK_BIT;
        self.value
            .compare_exchange(value, locked, LOCK_ORD, CAS_FAILURE)
            .ok()
            .map(|_| LockGuard {
                lock: self,
                locked_value: locked,
                _marker: PhantomData,
            })
    }
}


#[cfg(all(test, loom))]
mod loom_tests;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lock_is_free() {
        let lock = BucketLock::new();
        assert!(!lock.is_locked());
        assert!(!lock.is_detached());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let lock = BucketLock::new();
        {
            let guard = lock.lock();
            assert!(lock.is_locked());
            assert!(!guard.is_detached());
        }
        assert!(!lock.is_locked());
        assert!(!lock.is_detached());
    }

    #[test]
    fn test_guard_releases_on_unwind() {
        let lock = BucketLock::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = lock.lock();
            panic!("inside critical section");
        }));
        assert!(result.is_err());
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock = BucketLock::new();
        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_detached_is_sticky() {
        let lock = BucketLock::new();
        {
            let mut guard = lock.lock();
            guard.mark_detached();
            assert!(guard.is_detached());
        }
        assert!(lock.is_detached());
        assert!(!lock.is_locked());

        // Later critical sections neither clear nor lose the flag.
        for _ in 0..3 {
            let guard = lock.lock();
            assert!(guard.is_detached());
        }
        assert_eq!(lock.value.load(RELAXED), DETACHED_BIT);
    }
}
