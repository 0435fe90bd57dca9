//! Delayed-entry scanner daemon.
//!
//! Surfaces "entry is now eligible" log lines for delayed messages; stop
//! with SIGINT/SIGTERM. Safe to run zero or one instance, since it affects
//! observability only.

use conveyor_core::QueueConfig;
use conveyor_infra::{DelayedScanner, RedisStreamStore};
use conveyor_worker::shutdown_channel;

#[tokio::main]
async fn main() {
    conveyor_observability::init();

    let config = QueueConfig::from_env();
    let store = RedisStreamStore::connect(&config.redis_url)
        .await
        .expect("failed to connect to the stream store");

    let scanner = DelayedScanner::new(store, &config);

    tracing::info!("starting delayed entry scanner");
    scanner.run(shutdown_channel()).await;
}
