//! `Lazy` under concurrent first access.

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

mod common;

use clhm::Lazy;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn concurrent_first_get_runs_initializer_once() {
    common::init_tracing();

    const THREADS: usize = 16;

    for _ in 0..50 {
        let calls = Arc::new(AtomicUsize::new(0));
        let lazy = {
            let calls = Arc::clone(&calls);
            Arc::new(Lazy::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                // Widen the window in which other threads arrive.
                thread::sleep(Duration::from_millis(1));
                vec![7u8; 32]
            }))
        };
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lazy = Arc::clone(&lazy);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    // Address identity: every thread sees the same value.
                    lazy.get().as_ptr() as usize
                })
            })
            .collect();

        let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(lazy.is_done());
    }
}

static TABLE: Lazy<Vec<u64>> = Lazy::new(|| (0..64).map(|i| i * i).collect());

#[test]
fn static_lazy_is_shared() {
    let handles: Vec<_> = (0..4)
        .map(|_| thread::spawn(|| TABLE.get()[8]))
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), 64);
    }
    assert!(TABLE.is_done());
    assert_eq!(TABLE.len(), 64);
}
