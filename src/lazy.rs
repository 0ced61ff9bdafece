//! A value computed on first access, at most once.
//!
//! [`Lazy`] uses double-checked locking: the fast path is one acquire load of
//! a state byte. Threads that arrive before initialization finishes fall back
//! to a `parking_lot::Mutex` holding the initializer; the first one in runs it,
//! the rest block on the mutex and then read the published value.
//!
//! The uninitialized state is a separate flag, so every `T` (including
//! `Option::None` or `()`) is a valid cached value.

use std::cell::UnsafeCell;
use std::fmt as StdFmt;
use std::mem::MaybeUninit;
use std::ops::Deref;
use std::sync::atomic::AtomicU8;

use parking_lot::Mutex;

use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::tracing_helpers::{debug_log, error_log};

const UNINIT: u8 = 0;
const DONE: u8 = 1;

/// Lazily computed single value.
///
/// ```rust
/// use clhm::Lazy;
///
/// static GREETING: Lazy<String> = Lazy::new(|| "hello".repeat(2));
///
/// assert!(!GREETING.is_done());
/// assert_eq!(GREETING.get(), "hellohello");
/// assert!(GREETING.is_done());
/// ```
pub struct Lazy<T, F = fn() -> T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,

    /// `None` once the initializer has been taken. If `state` is still
    /// `UNINIT` at that point, the initializer panicked.
    init: Mutex<Option<F>>,
}

// SAFETY: the value is written once, under the mutex, before `state` is
// release-stored; afterwards it is only read.
unsafe impl<T: Send + Sync, F: Send> Sync for Lazy<T, F> {}

impl<T, F> Lazy<T, F> {
    /// Create an uninitialized value that `f` will compute.
    pub const fn new(f: F) -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
            init: Mutex::new(Some(f)),
        }
    }

    /// Whether the value has been computed.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.state.load(READ_ORD) == DONE
    }

    /// # Safety
    /// `state` must have been observed as `DONE` with acquire ordering.
    #[inline(always)]
    unsafe fn value_unchecked(&self) -> &T {
        // SAFETY: caller observed DONE, so the value is initialized and no
        // longer written.
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T, F: FnOnce() -> T> Lazy<T, F> {
    /// The value, computing it on first call.
    ///
    /// # Panics
    /// Re-raises a panic from the initializer; later calls panic as well.
    #[inline]
    pub fn get(&self) -> &T {
        if self.is_done() {
            // SAFETY: acquire load saw DONE.
            return unsafe { self.value_unchecked() };
        }
        self.get_slow()
    }

    #[cold]
    fn get_slow(&self) -> &T {
        let mut init = self.init.lock();

        // Someone else finished while we waited for the lock.
        if self.state.load(RELAXED) == DONE {
            // SAFETY: DONE is stored under this mutex, whose acquisition
            // synchronizes with that store.
            return unsafe { self.value_unchecked() };
        }

        let Some(f) = init.take() else {
            error_log!("lazy initializer panicked earlier");
            panic!("Lazy instance has previously been poisoned");
        };

        let value: T = f();
        // SAFETY: we hold the mutex and state is UNINIT, so nobody reads or
        // writes the slot.
        unsafe { (*self.value.get()).write(value) };
        self.state.store(DONE, WRITE_ORD);
        debug_log!("lazy value initialized");

        drop(init);
        // SAFETY: just stored DONE on this thread.
        unsafe { self.value_unchecked() }
    }
}

impl<T, F: FnOnce() -> T> Deref for Lazy<T, F> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.get()
    }
}

impl<T: Default> Default for Lazy<T> {
    fn default() -> Self {
        Self::new(T::default)
    }
}

impl<T, F> Drop for Lazy<T, F> {
    fn drop(&mut self) {
        if *self.state.get_mut() == DONE {
            // SAFETY: initialized, and `&mut self` rules out readers.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

impl<T: StdFmt::Debug, F> StdFmt::Debug for Lazy<T, F> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        let mut out = f.debug_tuple("Lazy");
        if self.is_done() {
            // SAFETY: acquire load saw DONE.
            out.field(unsafe { self.value_unchecked() });
        } else {
            out.field(&format_args!("<uninit>"));
        }
        out.finish()
    }
}
