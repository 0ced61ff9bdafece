//! Debug binary: mixed churn workload with hang detection.
//!
//! Every thread runs a random mix of `put`, `get`, `remove`, `replace` and
//! `poll_first` over a shared key space. A watchdog reports any thread that
//! has not finished an operation for two seconds.
//!
//! Run with:
//! ```bash
//! CLHM_THREADS=8 CLHM_OPS=200000 RUST_LOG=clhm=debug cargo run --release --features tracing
//! ```

#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use clhm::ConcurrentLinkedHashMap;
use std::env;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const DEFAULT_THREADS: usize = 8;
const DEFAULT_OPS: usize = 100_000;
const KEY_SPACE: u64 = 4_096;
const STALL_MS: u64 = 2_000;

// =============================================================================
// Thread progress tracking for hang detection
// =============================================================================

struct ThreadProgress {
    /// Current operation index for each thread
    current_op: Vec<AtomicUsize>,
    /// Key of the operation in flight
    current_key: Vec<AtomicU64>,
    /// Last time each thread made progress
    last_progress_ms: Vec<AtomicU64>,
    done: Vec<AtomicBool>,
    start: Instant,
}

impl ThreadProgress {
    fn new(num_threads: usize) -> Self {
        Self {
            current_op: (0..num_threads).map(|_| AtomicUsize::new(0)).collect(),
            current_key: (0..num_threads).map(|_| AtomicU64::new(0)).collect(),
            last_progress_ms: (0..num_threads).map(|_| AtomicU64::new(0)).collect(),
            done: (0..num_threads).map(|_| AtomicBool::new(false)).collect(),
            start: Instant::now(),
        }
    }

    fn update(&self, thread_id: usize, op: usize, key: u64) {
        self.current_op[thread_id].store(op, Ordering::Relaxed);
        self.current_key[thread_id].store(key, Ordering::Relaxed);
        self.last_progress_ms[thread_id]
            .store(self.start.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn mark_done(&self, thread_id: usize) {
        self.done[thread_id].store(true, Ordering::Relaxed);
    }

    fn report_stuck(&self, timeout_ms: u64) -> Vec<(usize, usize, u64, u64)> {
        let now_ms = self.start.elapsed().as_millis() as u64;

        (0..self.done.len())
            .filter(|&i| !self.done[i].load(Ordering::Relaxed))
            .filter_map(|i| {
                let last = self.last_progress_ms[i].load(Ordering::Relaxed);
                let stall = now_ms.saturating_sub(last);
                (stall > timeout_ms).then(|| {
                    (
                        i,
                        self.current_op[i].load(Ordering::Relaxed),
                        self.current_key[i].load(Ordering::Relaxed),
                        stall,
                    )
                })
            })
            .collect()
    }

    fn all_done(&self) -> bool {
        self.done.iter().all(|d| d.load(Ordering::Relaxed))
    }
}

// =============================================================================
// Churn workload
// =============================================================================

#[derive(Default)]
struct OpCounts {
    puts: AtomicUsize,
    hits: AtomicUsize,
    removes: AtomicUsize,
    replaces: AtomicUsize,
    polls: AtomicUsize,
}

fn run_churn(threads: usize, ops_per_thread: usize) {
    println!("\n{}", "=".repeat(80));
    println!("CHURN ({threads} threads, {ops_per_thread} ops/thread, {KEY_SPACE} keys)");
    println!("{}", "=".repeat(80));

    let map: Arc<ConcurrentLinkedHashMap<u64, u64>> =
        Arc::new(ConcurrentLinkedHashMap::with_capacity(256));
    let progress = Arc::new(ThreadProgress::new(threads));
    let counts = Arc::new(OpCounts::default());
    let stop_watchdog = Arc::new(AtomicBool::new(false));

    let watchdog = {
        let progress = Arc::clone(&progress);
        let stop = Arc::clone(&stop_watchdog);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(500));
                for (tid, op, key, stall_ms) in progress.report_stuck(STALL_MS) {
                    eprintln!("!!! STUCK: Thread {tid} at op {op} key={key} for {stall_ms}ms");
                }
                if progress.all_done() {
                    break;
                }
            }
        })
    };

    let start = Instant::now();

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let map = Arc::clone(&map);
            let progress = Arc::clone(&progress);
            let counts = Arc::clone(&counts);
            thread::spawn(move || {
                let mut state = (t as u64 + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15);

                for op in 0..ops_per_thread {
                    state = state
                        .wrapping_mul(6_364_136_223_846_793_005)
                        .wrapping_add(1);
                    let key = (state >> 33) % KEY_SPACE;
                    progress.update(t, op, key);

                    let op_start = Instant::now();
                    match state % 10 {
                        0..=3 => {
                            map.put(key, state);
                            counts.puts.fetch_add(1, Ordering::Relaxed);
                        }
                        4..=6 => {
                            if map.get(&key).is_some() {
                                counts.hits.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        7 => {
                            if map.remove(&key).is_some() {
                                counts.removes.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        8 => {
                            if map.replace_value(&key, state).is_some() {
                                counts.replaces.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        _ => {
                            if map.poll_first().is_some() {
                                counts.polls.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }

                    let op_elapsed = op_start.elapsed();
                    if op_elapsed > Duration::from_millis(100) {
                        eprintln!("[T{t:02}] SLOW op {op} key={key} took {op_elapsed:?}");
                    }
                }

                progress.mark_done(t);
            })
        })
        .collect();

    for h in handles {
        if h.join().is_err() {
            eprintln!("!!! worker panicked");
        }
    }

    stop_watchdog.store(true, Ordering::Relaxed);
    let _ = watchdog.join();

    let elapsed = start.elapsed();
    let live = map.iter().count();
    println!(
        "DONE: {} ops in {:?} ({:.0} ops/sec)",
        threads * ops_per_thread,
        elapsed,
        (threads * ops_per_thread) as f64 / elapsed.as_secs_f64(),
    );
    println!(
        "  puts={} hits={} removes={} replaces={} polls={}",
        counts.puts.load(Ordering::Relaxed),
        counts.hits.load(Ordering::Relaxed),
        counts.removes.load(Ordering::Relaxed),
        counts.replaces.load(Ordering::Relaxed),
        counts.polls.load(Ordering::Relaxed),
    );
    println!("  map.len()={} iterated={live}", map.len());
    if live != map.len() {
        eprintln!("!!! length mismatch after quiescence");
    }
}

// =============================================================================
// Main
// =============================================================================

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(feature = "tracing")]
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_ids(true)
        .compact()
        .try_init();
}

#[cfg(not(feature = "tracing"))]
const fn init_tracing() {}

fn main() {
    init_tracing();

    let threads = env_usize("CLHM_THREADS", DEFAULT_THREADS).max(1);
    let ops = env_usize("CLHM_OPS", DEFAULT_OPS);

    eprintln!("clhm churn hang detector");
    eprintln!("========================");
    eprintln!("Watchdog will report any thread stuck for >{}s.", STALL_MS / 1000);

    for run in 1..=3 {
        eprintln!("\n--- Run {run}/3 ---");
        run_churn(threads, ops);
    }

    eprintln!("\nAll runs completed!");
}
