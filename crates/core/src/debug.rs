//! Process-wide debug flag
//!
//! Set once at startup (CLI `--debug` or `SNAP_DEBUG=1`); read on hot paths
//! that would otherwise log every raw filesystem event.

use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG: AtomicBool = AtomicBool::new(false);

pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::Relaxed);
}

pub fn is_debug() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

/// Enable debug mode when `SNAP_DEBUG` is set to anything but `0`/empty
pub fn init_from_env() -> bool {
    let enabled = std::env::var("SNAP_DEBUG")
        .map(|v| !v.is_empty() && v != "0")
        .unwrap_or(false);
    if enabled {
        set_debug(true);
    }
    is_debug()
}
