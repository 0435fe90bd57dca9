//! Tracing/logging initialization.
//!
//! JSON lines on stdout; the poison-queue warnings and "delayed entry
//! ready" announcements are the operational surface of the daemons, so they
//! must survive log aggregation as structured fields.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process with the `info` default.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_default("info");
}

/// Initialize with an explicit default filter, still overridable via
/// `RUST_LOG`.
pub fn init_with_default(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
