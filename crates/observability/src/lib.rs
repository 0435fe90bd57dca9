//! Tracing/logging initialization for the queue daemons.

mod tracing;

pub use tracing::{init, init_with_default};
