//! # clhm
//!
//! A concurrent hash map that keeps its entries in insertion order.
//!
//! [`ConcurrentLinkedHashMap`] pairs a fixed-size table of per-slot buckets
//! with a lock-free doubly-linked list threading every entry:
//!
//! - keyed operations (`get`, `put`, `remove`, `replace`) hash to one bucket
//!   and lock only that bucket; `get` takes no lock at all;
//! - ordered operations (`first_key`, `poll_first`, iteration) walk the list
//!   from its oldest end, skipping entries that were removed.
//!
//! ```rust
//! use clhm::ConcurrentLinkedHashMap;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let map: Arc<ConcurrentLinkedHashMap<u32, String>> = Arc::new(ConcurrentLinkedHashMap::new());
//!
//! let handles: Vec<_> = (0..4u32)
//!     .map(|t| {
//!         let map = Arc::clone(&map);
//!         thread::spawn(move || {
//!             for i in 0..100 {
//!                 map.put(t * 100 + i, format!("v{i}"));
//!             }
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//!
//! assert_eq!(map.len(), 400);
//! while let Some((_key, _value)) = map.poll_first() {}
//! assert!(map.is_empty());
//! ```
//!
//! ## Design
//!
//! | Piece | Concurrency |
//! |-------|-------------|
//! | Bucket table | slots installed and detached by CAS |
//! | Buckets | one spinlock each; readers use immutable snapshots |
//! | Ordering list | lock-free append, lock-free unlink of dead nodes |
//! | Reclamation | reference-counted links, deferred through `seize` |
//!
//! A removal first takes the node out of its bucket and clears its value
//! (the node is then dead), releases the bucket lock, and only then unlinks
//! the node from the list. Traversals skip dead nodes, so the list can lag
//! behind the buckets without ever showing a removed entry.
//!
//! The table does not grow: the slot count passed at construction (default
//! [`DEFAULT_CAPACITY`]) is kept for the map's lifetime.
//!
//! ## Companion primitives
//!
//! - [`AtomicTransferArray`]: an array of atomic `Arc` slots with a `resize`
//!   that runs concurrently with `set` and `get`.
//! - [`Lazy`]: a value computed once on first access, with double-checked
//!   locking.
//!
//! ## Features
//!
//! - `tracing`: structured logging of structural events (bucket install and
//!   detach, retries, resize) through the `tracing` crate.
//! - `mimalloc`: use mimalloc as the global allocator in the debug binary.

#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::inline_always)]

mod tracing_helpers;

pub mod bucket;
mod iter;
pub mod lazy;
mod list;
pub mod lock;
mod map;
mod node;
pub mod ordering;
pub mod table;
pub mod transfer_array;

pub use bucket::{Bucket, BucketKind, ChainedBucket, OrderedBucket};
pub use iter::{Iter, Keys, Values};
pub use lazy::Lazy;
pub use map::ConcurrentLinkedHashMap;
pub use table::{DEFAULT_CAPACITY, MAXIMUM_CAPACITY};
pub use transfer_array::{AtomicTransferArray, IndexOutOfBounds};
