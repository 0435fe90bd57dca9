//! Message processor daemon.
//!
//! Consumes the queues in `QUEUE_NAMES`; stop with SIGINT/SIGTERM.

use conveyor_core::QueueConfig;
use conveyor_infra::{MessageProcessor, RedisStreamStore};
use conveyor_worker::{build_registry, shutdown_channel, WorkerPorts};

#[tokio::main]
async fn main() {
    conveyor_observability::init();

    let config = QueueConfig::from_env();
    let store = RedisStreamStore::connect(&config.redis_url)
        .await
        .expect("failed to connect to the stream store");

    let registry = build_registry(&config.queue_names, WorkerPorts::default());
    let processor = MessageProcessor::new(store, registry, config);

    tracing::info!("starting message processor");
    processor.run(shutdown_channel()).await;
}
