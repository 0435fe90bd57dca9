//! Integration tests for the full queue pipeline.
//!
//! Producer → stream → processor → handler → {ack | poison router}, all
//! against the in-memory store:
//! - steady-state: each envelope's handler runs exactly once
//! - delayed envelopes stay invisible until due
//! - business failures retry `max_retries` times, then dead-letter
//! - crashed-consumer entries are reclaimed and processed exactly once
//! - malformed payloads are dropped, never poisoned, without killing the loop
//! - the batched producer flushes at the size threshold and loses nothing

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use conveyor_core::{poison_stream_key, stream_key, Envelope, QueueConfig};
use conveyor_queue::{HandlerRegistry, MessageHandler, ReadCursor, StreamStore};

use crate::memory::MemoryStreamStore;
use crate::processor::MessageProcessor;
use crate::producer::{BatchAccumulator, Producer};

/// Counts invocations; fails the first `fail_first` of them.
struct CountingHandler {
    calls: AtomicU32,
    fail_first: u32,
}

impl CountingHandler {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_first: 0,
        })
    }

    fn failing_first(fail_first: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_first,
        })
    }

    fn always_failing() -> Arc<Self> {
        Self::failing_first(u32::MAX)
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn handle(&self, _envelope: &Envelope) -> anyhow::Result<bool> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            anyhow::bail!("induced failure on call {n}");
        }
        Ok(true)
    }
}

fn test_config(queue: &str) -> QueueConfig {
    let mut config = QueueConfig::default().with_queues([queue]);
    config.read_block = Duration::from_millis(10);
    config.reconnect_delay = Duration::from_millis(50);
    // Keep the reclaim task out of the way unless a test opts in.
    config.reclaim_interval = Duration::from_secs(60);
    config.reclaim_min_idle = Duration::from_secs(60);
    config
}

fn registry_with(queue: &str, handler: Arc<CountingHandler>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_fallback(queue, handler);
    registry
}

fn start(processor: MessageProcessor<MemoryStreamStore>) -> (watch::Sender<bool>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(false);
    let join = tokio::spawn(processor.run(rx));
    (tx, join)
}

async fn stop(tx: watch::Sender<bool>, join: JoinHandle<()>) {
    let _ = tx.send(true);
    join.await.expect("processor task panicked");
}

async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn steady_state_each_envelope_is_handled_exactly_once() {
    let store = MemoryStreamStore::new();
    let producer = Producer::new(store.clone());
    let handler = CountingHandler::succeeding();

    for n in 0..100 {
        producer
            .enqueue(
                Envelope::new("loadtest", "create", json!({"n": n})).quiet(),
                Duration::ZERO,
            )
            .await
            .unwrap();
    }

    let processor = MessageProcessor::new(
        store.clone(),
        registry_with("loadtest", handler.clone()),
        test_config("loadtest"),
    );
    let stats_view = processor.clone();
    let (tx, join) = start(processor);

    assert!(wait_until(Duration::from_secs(5), || handler.calls() == 100).await);
    // Nothing sneaks in a second invocation.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.calls(), 100);
    assert_eq!(stats_view.stats().acked, 100);

    stop(tx, join).await;

    let pending = store
        .pending(&stream_key("loadtest"), "main-group", None, 200)
        .await
        .unwrap();
    assert!(pending.is_empty());
}

#[tokio::test]
async fn delayed_envelope_is_invisible_until_due() {
    let store = MemoryStreamStore::new();
    let producer = Producer::new(store.clone());
    let handler = CountingHandler::succeeding();

    producer
        .enqueue(
            Envelope::new("scheduled", "create", json!({})),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    let processor = MessageProcessor::new(
        store.clone(),
        registry_with("scheduled", handler.clone()),
        test_config("scheduled"),
    );
    let (tx, join) = start(processor);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(handler.calls(), 0, "dispatched before its delay elapsed");

    assert!(wait_until(Duration::from_millis(2_500), || handler.calls() == 1).await);

    stop(tx, join).await;
}

#[tokio::test]
async fn failing_envelope_is_retried_then_poisoned() {
    let store = MemoryStreamStore::new();
    let producer = Producer::new(store.clone());
    let handler = CountingHandler::always_failing();

    producer
        .enqueue(
            Envelope::new("flaky", "create", json!({"id": 7})).quiet(),
            Duration::ZERO,
        )
        .await
        .unwrap();

    let processor = MessageProcessor::new(
        store.clone(),
        registry_with("flaky", handler.clone()),
        test_config("flaky").with_max_retries(3),
    );
    let stats_view = processor.clone();
    let (tx, join) = start(processor);

    assert!(
        wait_until(Duration::from_secs(5), || {
            stats_view.stats().dead_lettered == 1
        })
        .await
    );
    stop(tx, join).await;

    // First attempt plus MAX_RETRIES redeliveries.
    assert_eq!(handler.calls(), 4);

    let poisoned = store
        .range_to(&poison_stream_key("flaky"), "+", 10)
        .await
        .unwrap();
    assert_eq!(poisoned.len(), 1);
    let envelope: Envelope = serde_json::from_str(&poisoned[0].payload).unwrap();
    assert_eq!(envelope.retries, 3);
    assert_eq!(envelope.queue_name, "flaky-poison");
    assert!(envelope.poisoned_at.is_some());
}

#[tokio::test]
async fn retries_below_the_threshold_do_not_poison() {
    let store = MemoryStreamStore::new();
    let producer = Producer::new(store.clone());
    let handler = CountingHandler::failing_first(2);

    producer
        .enqueue(
            Envelope::new("flaky", "create", json!({})).quiet(),
            Duration::ZERO,
        )
        .await
        .unwrap();

    let processor = MessageProcessor::new(
        store.clone(),
        registry_with("flaky", handler.clone()),
        test_config("flaky").with_max_retries(3),
    );
    let (tx, join) = start(processor);

    assert!(wait_until(Duration::from_secs(5), || handler.calls() == 3).await);
    stop(tx, join).await;

    let poisoned = store
        .range_to(&poison_stream_key("flaky"), "+", 10)
        .await
        .unwrap();
    assert!(poisoned.is_empty());
}

#[tokio::test]
async fn crashed_consumer_entries_are_reclaimed_and_processed_once() {
    let store = MemoryStreamStore::new();
    let producer = Producer::new(store.clone());
    let handler = CountingHandler::succeeding();

    let stream = stream_key("recovery");
    store.ensure_group(&stream, "main-group", "0").await.unwrap();
    producer
        .enqueue(
            Envelope::new("recovery", "create", json!({})).quiet(),
            Duration::ZERO,
        )
        .await
        .unwrap();

    // Deliver to a consumer that never acks (a crash mid-handler).
    let delivered = store
        .read_group(&stream, "main-group", "crashed", ReadCursor::New, 10, None)
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);

    let mut config = test_config("recovery");
    config.reclaim_interval = Duration::from_millis(50);
    config.reclaim_min_idle = Duration::from_millis(100);

    let processor = MessageProcessor::with_consumer(
        store.clone(),
        registry_with("recovery", handler.clone()),
        config,
        "rescuer".to_string(),
    );
    let (tx, join) = start(processor);

    assert!(wait_until(Duration::from_secs(5), || handler.calls() == 1).await);
    // The original owner never duplicates the work.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handler.calls(), 1);

    stop(tx, join).await;

    let pending = store.pending(&stream, "main-group", None, 10).await.unwrap();
    assert!(pending.is_empty());
}

#[tokio::test]
async fn malformed_payload_is_dropped_not_poisoned() {
    let store = MemoryStreamStore::new();
    let producer = Producer::new(store.clone());
    let handler = CountingHandler::succeeding();

    let stream = stream_key("mixed");
    store.append(&stream, "{not json at all").await.unwrap();
    producer
        .enqueue(
            Envelope::new("mixed", "create", json!({})).quiet(),
            Duration::ZERO,
        )
        .await
        .unwrap();

    let processor = MessageProcessor::new(
        store.clone(),
        registry_with("mixed", handler.clone()),
        test_config("mixed"),
    );
    let stats_view = processor.clone();
    let (tx, join) = start(processor);

    // The loop survives the malformed entry and reaches the valid one.
    assert!(wait_until(Duration::from_secs(5), || handler.calls() == 1).await);
    assert!(wait_until(Duration::from_secs(1), || {
        stats_view.stats().dropped == 1
    })
    .await);

    stop(tx, join).await;

    let poisoned = store
        .range_to(&poison_stream_key("mixed"), "+", 10)
        .await
        .unwrap();
    assert!(poisoned.is_empty());

    let pending = store.pending(&stream, "main-group", None, 10).await.unwrap();
    assert!(pending.is_empty());
}

#[tokio::test]
async fn batched_producer_flushes_at_threshold_and_loses_nothing() {
    let store = MemoryStreamStore::new();
    let handler = CountingHandler::succeeding();
    let accumulator = BatchAccumulator::new(store.clone(), 50, Duration::from_secs(5));

    for n in 0..60 {
        accumulator
            .push(
                Envelope::new("bulk", "insert", json!({"n": n})).quiet(),
                Duration::ZERO,
            )
            .await;
    }
    // 50 went out at the size threshold; the remaining 10 on the sweep.
    assert_eq!(accumulator.flushes(), 1);
    accumulator.flush_all().await;
    assert_eq!(accumulator.flushes(), 2);

    let processor = MessageProcessor::new(
        store.clone(),
        registry_with("bulk", handler.clone()),
        test_config("bulk"),
    );
    let (tx, join) = start(processor);

    assert!(wait_until(Duration::from_secs(5), || handler.calls() == 60).await);
    stop(tx, join).await;
}

#[tokio::test]
async fn unknown_operation_takes_the_poison_path() {
    let store = MemoryStreamStore::new();
    let producer = Producer::new(store.clone());

    producer
        .enqueue(
            Envelope::new("sessions", "no_such_op", json!({})).quiet(),
            Duration::ZERO,
        )
        .await
        .unwrap();

    // A registry with a handler for a different operation only.
    let mut registry = HandlerRegistry::new();
    registry.register("sessions", "create", CountingHandler::succeeding());

    let processor = MessageProcessor::new(
        store.clone(),
        registry,
        test_config("sessions").with_max_retries(1),
    );
    let stats_view = processor.clone();
    let (tx, join) = start(processor);

    assert!(
        wait_until(Duration::from_secs(5), || {
            stats_view.stats().dead_lettered == 1
        })
        .await
    );
    stop(tx, join).await;

    let poisoned = store
        .range_to(&poison_stream_key("sessions"), "+", 10)
        .await
        .unwrap();
    assert_eq!(poisoned.len(), 1);
}
