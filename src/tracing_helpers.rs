//! Logging macros that cost nothing unless the `tracing` feature is on.
//!
//! With `--features tracing` each macro forwards to the matching `tracing`
//! macro, so structured fields work as usual:
//!
//! ```ignore
//! debug_log!(slot, "bucket detached");
//! ```
//!
//! Without the feature the invocation expands to nothing and its arguments
//! are never evaluated.
//!
//! ```bash
//! RUST_LOG=clhm::map=debug cargo test --features tracing --test stress_tests
//! ```

#![allow(unused_macros, unused_imports)]

/// Per-step protocol detail (CAS retries, unlink repair).
#[cfg(feature = "tracing")]
macro_rules! trace_log {
    ($($arg:tt)*) => {
        tracing::trace!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_log {
    ($($arg:tt)*) => {};
}

/// Structural events (bucket install, detach, resize).
#[cfg(feature = "tracing")]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

/// Unusual but recoverable situations (lost races, detached-bucket retries).
#[cfg(feature = "tracing")]
macro_rules! warn_log {
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn_log {
    ($($arg:tt)*) => {};
}

/// Invariant violations reported right before the panic that follows them.
#[cfg(feature = "tracing")]
macro_rules! error_log {
    ($($arg:tt)*) => {
        tracing::error!($($arg)*)
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! error_log {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_log;
pub(crate) use error_log;
pub(crate) use trace_log;
pub(crate) use warn_log;
