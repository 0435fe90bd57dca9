//! `conveyor-core` — queue domain building blocks.
//!
//! This crate contains the **pure domain** side of the queue: the envelope
//! contract shared with every producing service, stream naming, entry-id
//! arithmetic, the error model, and configuration. No infrastructure
//! concerns live here.

pub mod config;
pub mod entry_id;
pub mod envelope;
pub mod error;
pub mod queue;

pub use config::QueueConfig;
pub use envelope::{Envelope, Schedule, DELAY_UNTIL_FORMAT};
pub use error::{EnqueueError, StoreError};
pub use queue::{
    consumer_name, is_poison_queue, poison_queue, poison_stream_key, queue_of_stream, stream_key,
    DEFAULT_GROUP,
};
