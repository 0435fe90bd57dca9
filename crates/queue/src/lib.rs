//! `conveyor-queue` — transport-agnostic queue abstractions.
//!
//! The seams between the queue runtime and the outside world live here: the
//! [`StreamStore`] port over the append-only log, and the
//! [`MessageHandler`]/[`HandlerRegistry`] dispatch point that surrounding
//! business logic implements against.

pub mod handler;
pub mod store;

pub use handler::{HandlerRegistry, MessageHandler};
pub use store::{PendingEntry, ReadCursor, StreamEntry, StreamStore};
