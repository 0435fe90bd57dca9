//! `conveyor-worker` — handler wiring and the daemon entry points.
//!
//! The queue core dispatches through a registration table; this crate
//! provides the business-side handlers (against ports, so provider
//! integration stays outside) and builds the table for the configured
//! queues.

pub mod handlers;
pub mod registry;
pub mod shutdown;

pub use registry::{build_registry, WorkerPorts};
pub use shutdown::{shutdown_channel, shutdown_signal};
