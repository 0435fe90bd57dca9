//! Infrastructure layer: stream store implementations and the queue runtime.

pub mod groups;
pub mod memory;
pub mod poison;
pub mod processor;
pub mod producer;
#[cfg(feature = "redis")]
pub mod redis_streams;
pub mod scanner;

#[cfg(test)]
mod integration_tests;

pub use groups::ConsumerGroups;
pub use memory::MemoryStreamStore;
pub use poison::{PoisonRouter, RouteOutcome};
pub use processor::{MessageProcessor, ProcessorStats};
pub use producer::{BatchAccumulator, FlushHandle, Producer};
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamStore;
pub use scanner::DelayedScanner;
