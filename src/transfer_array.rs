//! A fixed-length array of atomic `Arc` slots that can be resized while in use.
//!
//! [`AtomicTransferArray`] keeps its slots in a storage block behind an
//! `AtomicPtr`. `set` and `get` never lock. `resize` serializes on a mutex and
//! moves every slot into a new block:
//!
//! 1. each old slot is frozen by setting the low bit of its pointer (a
//!    "transfer mark"), which makes concurrent `set`s on it fail their CAS;
//! 2. the unmarked pointer is copied into the new block;
//! 3. the new block is published and the old one retired through seize.
//!
//! A `set` that lands before its slot is frozen is carried over; one that
//! finds the slot frozen waits for the new block and retries there. `get`
//! reads through the mark, since a frozen slot still holds the current value.

use std::fmt as StdFmt;
use std::ptr as StdPtr;
use std::sync::Arc;
use std::sync::atomic::AtomicPtr;
use std::thread;

use parking_lot::Mutex;
use seize::{Collector, Guard, LocalGuard};

use crate::node::retire_value;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};
use crate::tracing_helpers::debug_log;

const MARK_BIT: usize = 1;

/// Set the transfer mark (provenance-safe).
#[inline(always)]
fn mark_ptr<T>(p: *mut T) -> *mut T {
    p.map_addr(|a| a | MARK_BIT)
}

/// Clear the transfer mark (provenance-safe).
#[inline(always)]
fn unmark_ptr<T>(p: *mut T) -> *mut T {
    p.map_addr(|a| a & !MARK_BIT)
}

#[inline(always)]
fn is_marked<T>(p: *mut T) -> bool {
    p.addr() & MARK_BIT != 0
}

// ============================================================================
//  IndexOutOfBounds
// ============================================================================

/// An index at or past the current length of an [`AtomicTransferArray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOutOfBounds {
    /// The rejected index.
    pub index: usize,
    /// The array length observed when the index was rejected.
    pub len: usize,
}

impl StdFmt::Display for IndexOutOfBounds {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        write!(f, "index {} out of bounds for length {}", self.index, self.len)
    }
}

impl std::error::Error for IndexOutOfBounds {}

// ============================================================================
//  Storage
// ============================================================================

/// One generation of slots. Dropping it never drops values: ownership of the
/// `Arc`s moves to the next generation, or to the array's `Drop`.
struct Storage<T> {
    cells: Box<[AtomicPtr<T>]>,
}

impl<T> Storage<T> {
    fn new(len: usize) -> *mut Self {
        let cells: Box<[AtomicPtr<T>]> = (0..len)
            .map(|_| AtomicPtr::new(StdPtr::null_mut()))
            .collect();
        Box::into_raw(Box::new(Self { cells }))
    }

    #[inline]
    fn cell(&self, index: usize) -> Result<&AtomicPtr<T>, IndexOutOfBounds> {
        self.cells.get(index).ok_or(IndexOutOfBounds {
            index,
            len: self.cells.len(),
        })
    }
}

// ============================================================================
//  AtomicTransferArray
// ============================================================================

/// Concurrent array of optional `Arc<T>` values with a live `resize`.
///
/// ```rust
/// use clhm::AtomicTransferArray;
///
/// let array: AtomicTransferArray<u32> = AtomicTransferArray::new(2);
/// array.set(1, 10).unwrap();
/// array.resize(4);
/// array.set(3, 30).unwrap();
///
/// assert_eq!(array.get(1).unwrap().as_deref(), Some(&10));
/// assert_eq!(array.len(), 4);
/// assert!(array.set(4, 40).is_err());
/// ```
pub struct AtomicTransferArray<T> {
    collector: Collector,
    storage: AtomicPtr<Storage<T>>,
    resize_lock: Mutex<()>,
}

// SAFETY: values are shared between threads as `Arc<T>`.
unsafe impl<T: Send + Sync> Send for AtomicTransferArray<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicTransferArray<T> {}

impl<T> AtomicTransferArray<T> {
    /// Create an array of `len` empty slots.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            collector: Collector::new(),
            storage: AtomicPtr::new(Storage::new(len)),
            resize_lock: Mutex::new(()),
        }
    }

    #[inline]
    fn current<'g>(&self, guard: &'g LocalGuard<'_>) -> &'g Storage<T> {
        // SAFETY: never null; replaced storages are retired through the collector.
        unsafe { &*guard.protect(&self.storage, READ_ORD) }
    }

    /// Current number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        let guard = self.collector.enter();
        self.current(&guard).cells.len()
    }

    /// Whether the array has no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store `value` at `index` and return the previous value.
    ///
    /// # Errors
    /// [`IndexOutOfBounds`] if `index` is not below the current length. The
    /// value is dropped.
    pub fn set(&self, index: usize, value: T) -> Result<Option<Arc<T>>, IndexOutOfBounds> {
        let guard = self.collector.enter();
        let new: *mut T = Arc::into_raw(Arc::new(value)).cast_mut();

        loop {
            let storage: &Storage<T> = self.current(&guard);
            let cell: &AtomicPtr<T> = match storage.cell(index) {
                Ok(cell) => cell,
                Err(err) => {
                    // SAFETY: `new` was never published.
                    unsafe { drop(Arc::from_raw(new)) };
                    return Err(err);
                }
            };

            let current: *mut T = cell.load(READ_ORD);
            if is_marked(current) {
                self.wait_for_transfer(storage);
                continue;
            }

            if cell
                .compare_exchange(current, new, CAS_SUCCESS, CAS_FAILURE)
                .is_ok()
            {
                if current.is_null() {
                    return Ok(None);
                }
                // SAFETY: current came from Arc::into_raw and was just unlinked.
                return Ok(Some(unsafe { retire_value(current, &guard) }));
            }
        }
    }

    /// Value at `index`.
    ///
    /// # Errors
    /// [`IndexOutOfBounds`] if `index` is not below the current length.
    pub fn get(&self, index: usize) -> Result<Option<Arc<T>>, IndexOutOfBounds> {
        let guard = self.collector.enter();
        let cell: &AtomicPtr<T> = self.current(&guard).cell(index)?;
        let ptr: *mut T = unmark_ptr(guard.protect(cell, READ_ORD));
        if ptr.is_null() {
            return Ok(None);
        }

        // SAFETY: values are retired through the collector, so ptr is valid
        // while `guard` is held.
        unsafe {
            Arc::increment_strong_count(ptr);
            Ok(Some(Arc::from_raw(ptr)))
        }
    }

    /// Change the number of slots to `new_len`.
    ///
    /// Existing values keep their index. Growing adds empty slots; shrinking
    /// drops the values past `new_len`. Concurrent `set`s are never lost.
    pub fn resize(&self, new_len: usize) {
        let _resizing = self.resize_lock.lock();
        let guard = self.collector.enter();

        // Only resize replaces the storage, and we hold the resize lock.
        let old_ptr: *mut Storage<T> = self.storage.load(READ_ORD);
        // SAFETY: never null.
        let old: &Storage<T> = unsafe { &*old_ptr };
        let next_ptr: *mut Storage<T> = Storage::new(new_len);
        // SAFETY: fresh allocation, unpublished.
        let next: &Storage<T> = unsafe { &*next_ptr };

        for (index, cell) in old.cells.iter().enumerate() {
            let value: *mut T = freeze(cell);
            if let Some(target) = next.cells.get(index) {
                target.store(value, RELAXED);
            } else if !value.is_null() {
                // SAFETY: value left the array; readers may still hold it.
                drop(unsafe { retire_value(value, &guard) });
            }
        }

        self.storage.store(next_ptr, WRITE_ORD);
        debug_log!(old_len = old.cells.len(), new_len, "transfer array resized");

        // SAFETY: old storage is unreachable for new readers; its values now
        // belong to `next`.
        unsafe {
            guard.defer_retire(old_ptr, |ptr, _| {
                drop(Box::from_raw(ptr));
            });
        }
    }

    /// Yield until `storage` is no longer the published storage.
    fn wait_for_transfer(&self, storage: &Storage<T>) {
        while StdPtr::eq(self.storage.load(READ_ORD), storage) {
            thread::yield_now();
        }
    }
}

/// Set the transfer mark on `cell` and return the value it held.
fn freeze<T>(cell: &AtomicPtr<T>) -> *mut T {
    let mut current: *mut T = cell.load(RELAXED);
    loop {
        match cell.compare_exchange_weak(current, mark_ptr(current), CAS_SUCCESS, CAS_FAILURE) {
            Ok(_) => return current,
            Err(actual) => current = actual,
        }
    }
}

impl<T> Drop for AtomicTransferArray<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self`, no guards alive.
        unsafe { self.collector.reclaim_all() };

        // SAFETY: the current storage owns every remaining value.
        let storage: Box<Storage<T>> = unsafe { Box::from_raw(*self.storage.get_mut()) };
        for cell in &storage.cells {
            let ptr: *mut T = unmark_ptr(cell.load(RELAXED));
            if !ptr.is_null() {
                // SAFETY: from Arc::into_raw, owned by the array.
                unsafe { drop(Arc::from_raw(ptr)) };
            }
        }
    }
}

impl<T: StdFmt::Debug> StdFmt::Debug for AtomicTransferArray<T> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        let guard = self.collector.enter();
        let storage: &Storage<T> = self.current(&guard);
        let mut list = f.debug_list();
        for cell in &storage.cells {
            let ptr: *mut T = unmark_ptr(guard.protect(cell, READ_ORD));
            // SAFETY: protected by guard.
            list.entry(&unsafe { ptr.as_ref() });
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_roundtrip_on_null_and_real_pointers() {
        let null: *mut u64 = StdPtr::null_mut();
        assert!(!is_marked(null));
        assert!(is_marked(mark_ptr(null)));
        assert!(unmark_ptr(mark_ptr(null)).is_null());

        let boxed = Box::into_raw(Box::new(5u64));
        assert_eq!(unmark_ptr(mark_ptr(boxed)), boxed);
        // SAFETY: from Box::into_raw.
        unsafe { drop(Box::from_raw(boxed)) };
    }

    #[test]
    fn test_set_returns_previous() {
        let array = AtomicTransferArray::new(3);
        assert_eq!(array.set(0, "a"), Ok(None));
        assert_eq!(array.set(0, "b").unwrap().as_deref(), Some(&"a"));
        assert_eq!(array.get(0).unwrap().as_deref(), Some(&"b"));
        assert_eq!(array.get(2), Ok(None));
    }

    #[test]
    fn test_out_of_bounds_is_an_error() {
        let array: AtomicTransferArray<u8> = AtomicTransferArray::new(2);
        let err = array.set(2, 1).unwrap_err();
        assert_eq!(err, IndexOutOfBounds { index: 2, len: 2 });
        assert_eq!(err.to_string(), "index 2 out of bounds for length 2");
        assert!(array.get(5).is_err());
    }

    #[test]
    fn test_resize_grow_and_shrink() {
        let array = AtomicTransferArray::new(2);
        array.set(0, 1).unwrap();
        array.set(1, 2).unwrap();

        array.resize(4);
        assert_eq!(array.len(), 4);
        assert_eq!(array.get(1).unwrap().as_deref(), Some(&2));
        assert_eq!(array.get(3), Ok(None));
        array.set(3, 4).unwrap();

        array.resize(1);
        assert_eq!(array.len(), 1);
        assert_eq!(array.get(0).unwrap().as_deref(), Some(&1));
        assert!(array.get(1).is_err());
        assert_eq!(format!("{array:?}"), "[Some(1)]");
    }

    #[test]
    fn test_values_outlive_resize_and_drop() {
        let tracker = Arc::new(());
        let array = AtomicTransferArray::new(2);
        array.set(0, Arc::clone(&tracker)).unwrap();
        array.set(1, Arc::clone(&tracker)).unwrap();

        let held = array.get(1).unwrap().unwrap();
        array.resize(1);
        // The dropped slot's value is still readable through `held`.
        assert_eq!(Arc::strong_count(&held), 2);
        drop(held);
        drop(array);
        assert_eq!(Arc::strong_count(&tracker), 1);
    }
}
