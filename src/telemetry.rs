//! Tracing initialization.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::{fmt, EnvFilter};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install the global tracing subscriber.
///
/// Filter directives come from `RUST_LOG` (default `info`). Safe to call
/// more than once; only the first call installs anything.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// Variant for tests: compact output, never panics when a subscriber is
/// already installed.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).compact().try_init();
}
