//! Tracing for integration tests.
//!
//! The map only emits events when built with `--features tracing`; without it
//! the subscriber is installed but stays quiet.
//!
//! - `RUST_LOG` picks the filter (default `clhm=debug`).
//! - `CLHM_LOG_DIR` names a directory that receives `clhm.jsonl` (NDJSON, one
//!   file per process, appended). Unset means no file.
//! - `CLHM_LOG_CONSOLE=0` silences the console layer.
//!
//! Detached-bucket retries are logged with a `slot` field, so
//! `jq 'select(.fields.slot == 3)' logs/clhm.jsonl` isolates one bucket.

use std::env;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

static INIT: Once = Once::new();

/// Install the test subscriber. Later calls are no-ops.
pub fn init_tracing() {
    INIT.call_once(install);
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clhm=debug"))
}

fn install() {
    let console = (env::var("CLHM_LOG_CONSOLE").as_deref() != Ok("0")).then(|| {
        tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_thread_names(true)
            .compact()
            .with_filter(filter())
    });

    // A log directory that cannot be opened only loses the file layer.
    let file = env::var_os("CLHM_LOG_DIR")
        .map(PathBuf::from)
        .and_then(|dir| {
            fs::create_dir_all(&dir).ok()?;
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("clhm.jsonl"))
                .ok()
        })
        .map(|file| {
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_thread_ids(true)
                .json()
                .with_filter(filter())
        });

    // Another test binary helper may have installed a global subscriber.
    let _ = Registry::default().with(console).with(file).try_init();
}
