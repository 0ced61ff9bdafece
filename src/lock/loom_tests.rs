//! Loom model of the bucket lock word.
//!
//! Run with: `RUSTFLAGS="--cfg loom" cargo test --lib lock::loom_tests --release`
//!
//! Loom needs its own atomics, so the lock protocol is restated here with
//! `loom::sync::atomic::AtomicU32`: CAS acquire, release store, sticky
//! detached bit.

use loom::cell::UnsafeCell;
use loom::sync::Arc;
use loom::sync::atomic::{AtomicU32, Ordering};
use loom::thread;

const LOCK_BIT: u32 = 1 << 0;
const DETACHED_BIT: u32 = 1 << 1;

struct LoomBucketLock {
    value: AtomicU32,
}

impl LoomBucketLock {
    fn new() -> Self {
        Self {
            value: AtomicU32::new(0),
        }
    }

    /// Returns the locked word.
    fn lock(&self) -> u32 {
        loop {
            let value = self.value.load(Ordering::Relaxed);
            if value & LOCK_BIT == 0
                && self
                    .value
                    .compare_exchange(value, value | LOCK_BIT, Ordering::Acquire, Ordering::Acquire)
                    .is_ok()
            {
                return value | LOCK_BIT;
            }
            thread::yield_now();
        }
    }

    fn unlock(&self, locked: u32) {
        self.value.store(locked & !LOCK_BIT, Ordering::Release);
    }

    fn detach(&self, locked: &mut u32) {
        let value = self.value.load(Ordering::Relaxed);
        self.value.store(value | DETACHED_BIT, Ordering::Release);
        *locked |= DETACHED_BIT;
    }
}

#[test]
fn loom_lock_is_mutually_exclusive() {
    loom::model(|| {
        let lock = Arc::new(LoomBucketLock::new());
        let data = Arc::new(UnsafeCell::new(0u32));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let data = Arc::clone(&data);
                thread::spawn(move || {
                    let locked = lock.lock();
                    data.with_mut(|p| unsafe { *p += 1 });
                    lock.unlock(locked);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(data.with(|p| unsafe { *p }), 2);
        assert_eq!(lock.value.load(Ordering::Relaxed), 0);
    });
}

#[test]
fn loom_detach_is_seen_by_next_holder() {
    loom::model(|| {
        let lock = Arc::new(LoomBucketLock::new());
        // Stands in for the bucket snapshot emptied before the detach.
        let emptied = Arc::new(UnsafeCell::new(false));

        let detacher = {
            let lock = Arc::clone(&lock);
            let emptied = Arc::clone(&emptied);
            thread::spawn(move || {
                let mut locked = lock.lock();
                emptied.with_mut(|p| unsafe { *p = true });
                lock.detach(&mut locked);
                lock.unlock(locked);
            })
        };

        let inserter = {
            let lock = Arc::clone(&lock);
            let emptied = Arc::clone(&emptied);
            thread::spawn(move || {
                let locked = lock.lock();
                let detached = locked & DETACHED_BIT != 0;
                let saw_empty = emptied.with(|p| unsafe { *p });
                lock.unlock(locked);
                (detached, saw_empty)
            })
        };

        detacher.join().unwrap();
        let (saw_detached, saw_empty) = inserter.join().unwrap();

        // A holder that sees the flag also sees the detacher's writes.
        assert_eq!(saw_detached, saw_empty);
        // Whichever order the two critical sections ran in, the flag survives.
        assert_eq!(lock.value.load(Ordering::Relaxed), DETACHED_BIT);
    });
}
