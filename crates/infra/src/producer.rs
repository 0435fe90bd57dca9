//! Producers: single-envelope enqueue and the batched path.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use conveyor_core::{entry_id, stream_key, EnqueueError, Envelope};
use conveyor_queue::StreamStore;

/// Appends envelopes to their queue's stream, fire-and-forget.
///
/// Durability is delegated to the store; nothing past the append round-trip
/// is awaited.
#[derive(Debug, Clone)]
pub struct Producer<S> {
    store: S,
}

impl<S: StreamStore> Producer<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Enqueue one envelope, optionally delayed.
    ///
    /// A delayed envelope is appended under the explicit id
    /// `"{due_ms}-0"`; a due time that lands at or below the stream's
    /// current top id is rejected by the store and surfaced here, never
    /// silently reordered.
    pub async fn enqueue(
        &self,
        mut envelope: Envelope,
        delay: Duration,
    ) -> Result<String, EnqueueError> {
        let stream = stream_key(&envelope.queue_name);

        if delay.is_zero() {
            let payload = serde_json::to_string(&envelope)?;
            let id = self.store.append(&stream, &payload).await?;
            if envelope.log {
                info!(queue = %envelope.queue_name, entry = %id, "enqueued envelope");
            }
            Ok(id)
        } else {
            let due = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            envelope.mark_delayed(due);
            let payload = serde_json::to_string(&envelope)?;
            let id = self
                .store
                .append_at(&stream, &entry_id::delayed(due.timestamp_millis().max(0) as u64), &payload)
                .await?;
            info!(
                queue = %envelope.queue_name,
                entry = %id,
                delay_secs = delay.as_secs(),
                "enqueued delayed envelope"
            );
            Ok(id)
        }
    }
}

#[derive(Debug)]
struct QueueBuffer {
    items: VecDeque<(Envelope, Duration)>,
    last_flush: Instant,
}

impl QueueBuffer {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            last_flush: Instant::now(),
        }
    }
}

/// Per-queue producer-side batching.
///
/// Owns its buffers and flush bookkeeping; construct one per process and
/// pass it by reference to producer call sites. A queue's buffer is flushed
/// when it reaches `batch_size`, and a single background task
/// ([`BatchAccumulator::spawn_flush_task`]) sweeps buffers idle past
/// `batch_timeout`.
///
/// Flushing is all-or-nothing per batch: on failure the batch is restored to
/// the front of the buffer for the next attempt, so nothing is lost and
/// nothing is re-emitted from the producer side.
#[derive(Debug)]
pub struct BatchAccumulator<S> {
    store: S,
    batch_size: usize,
    batch_timeout: Duration,
    buffers: Mutex<HashMap<String, QueueBuffer>>,
    flushes: AtomicU64,
}

impl<S: StreamStore> BatchAccumulator<S> {
    pub fn new(store: S, batch_size: usize, batch_timeout: Duration) -> Self {
        Self {
            store,
            batch_size,
            batch_timeout,
            buffers: Mutex::new(HashMap::new()),
            flushes: AtomicU64::new(0),
        }
    }

    /// Buffer one envelope; flushes the queue's buffer if it is now full.
    pub async fn push(&self, envelope: Envelope, delay: Duration) {
        let queue = envelope.queue_name.clone();

        let full_batch = {
            let mut buffers = self.buffers.lock().await;
            let buffer = buffers.entry(queue.clone()).or_insert_with(QueueBuffer::new);
            buffer.items.push_back((envelope, delay));
            if buffer.items.len() >= self.batch_size {
                Some(buffer.items.drain(..).collect::<Vec<_>>())
            } else {
                None
            }
        };

        if let Some(batch) = full_batch {
            self.flush_batch(&queue, batch).await;
        }
    }

    /// Flush every queue that is full or idle past `batch_timeout`.
    /// Returns the number of envelopes written.
    pub async fn flush_due(&self) -> usize {
        self.flush_where(|buffer, batch_size, batch_timeout| {
            buffer.items.len() >= batch_size
                || (!buffer.items.is_empty() && buffer.last_flush.elapsed() >= batch_timeout)
        })
        .await
    }

    /// Flush every non-empty buffer (shutdown path).
    pub async fn flush_all(&self) -> usize {
        self.flush_where(|buffer, _, _| !buffer.items.is_empty()).await
    }

    /// Number of envelopes currently buffered for a queue.
    pub async fn buffered(&self, queue: &str) -> usize {
        let buffers = self.buffers.lock().await;
        buffers.get(queue).map_or(0, |b| b.items.len())
    }

    /// Successful flush operations so far.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Spawn the background flush task. One per accumulator.
    pub fn spawn_flush_task(self: &Arc<Self>, flush_interval: Duration) -> FlushHandle
    where
        S: 'static,
    {
        let accumulator = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        accumulator.flush_due().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            // Drain whatever is still buffered before the process exits.
            accumulator.flush_all().await;
        });

        FlushHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    async fn flush_where<F>(&self, should_flush: F) -> usize
    where
        F: Fn(&QueueBuffer, usize, Duration) -> bool,
    {
        let batches: Vec<(String, Vec<(Envelope, Duration)>)> = {
            let mut buffers = self.buffers.lock().await;
            buffers
                .iter_mut()
                .filter(|(_, buffer)| should_flush(buffer, self.batch_size, self.batch_timeout))
                .map(|(queue, buffer)| (queue.clone(), buffer.items.drain(..).collect()))
                .collect()
        };

        let mut written = 0;
        for (queue, batch) in batches {
            written += self.flush_batch(&queue, batch).await;
        }
        written
    }

    /// Write one batch; on failure the items go back to the front of the
    /// buffer in their original order.
    async fn flush_batch(&self, queue: &str, batch: Vec<(Envelope, Duration)>) -> usize {
        let count = batch.len();
        if count == 0 {
            return 0;
        }

        match self.write_batch(queue, &batch).await {
            Ok(()) => {
                let mut buffers = self.buffers.lock().await;
                let buffer = buffers
                    .entry(queue.to_string())
                    .or_insert_with(QueueBuffer::new);
                buffer.last_flush = Instant::now();
                self.flushes.fetch_add(1, Ordering::Relaxed);
                info!(queue, count, "flushed envelope batch");
                count
            }
            Err(e) => {
                warn!(queue, count, error = %e, "batch flush failed; retaining envelopes");
                let mut buffers = self.buffers.lock().await;
                let buffer = buffers
                    .entry(queue.to_string())
                    .or_insert_with(QueueBuffer::new);
                for item in batch.into_iter().rev() {
                    buffer.items.push_front(item);
                }
                0
            }
        }
    }

    async fn write_batch(
        &self,
        queue: &str,
        batch: &[(Envelope, Duration)],
    ) -> Result<(), EnqueueError> {
        let now = Utc::now();
        let mut entries = Vec::with_capacity(batch.len());

        // Explicit ids must stay strictly increasing within the pipeline:
        // auto-id immediates go first, then delayed entries ordered by due
        // time, with a per-millisecond sequence for collisions.
        for (envelope, _) in batch.iter().filter(|(_, delay)| delay.is_zero()) {
            entries.push((None, serde_json::to_string(envelope)?));
        }

        let mut delayed: Vec<&(Envelope, Duration)> =
            batch.iter().filter(|(_, delay)| !delay.is_zero()).collect();
        delayed.sort_by_key(|(_, delay)| *delay);

        let mut seq_by_ms: HashMap<u64, u64> = HashMap::new();
        for (envelope, delay) in delayed {
            let due = now + chrono::Duration::from_std(*delay).unwrap_or_default();
            let mut envelope = envelope.clone();
            envelope.mark_delayed(due);

            let due_ms = due.timestamp_millis().max(0) as u64;
            let seq = seq_by_ms.entry(due_ms).or_insert(0);
            let id = entry_id::format(due_ms, *seq);
            *seq += 1;

            entries.push((Some(id), serde_json::to_string(&envelope)?));
        }

        self.store
            .append_batch(&stream_key(queue), &entries)
            .await?;
        Ok(())
    }
}

/// Handle to stop the background flush task.
#[derive(Debug)]
pub struct FlushHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl FlushHandle {
    /// Request graceful shutdown; remaining buffers are flushed first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStreamStore;
    use conveyor_core::Schedule;
    use serde_json::json;

    fn envelope(n: usize) -> Envelope {
        Envelope::new("bulk", "insert", json!({"n": n})).quiet()
    }

    #[tokio::test]
    async fn enqueue_delayed_stamps_echo_and_explicit_id() {
        let store = MemoryStreamStore::new();
        let producer = Producer::new(store.clone());

        let id = producer
            .enqueue(envelope(1), Duration::from_secs(60))
            .await
            .unwrap();

        let (ms, seq) = entry_id::parse(&id).unwrap();
        assert_eq!(seq, 0);
        assert!(ms as i64 > Utc::now().timestamp_millis());

        let entries = store.range_to("bulk:stream", "+", 10).await.unwrap();
        let stored: Envelope = serde_json::from_str(&entries[0].payload).unwrap();
        assert!(matches!(stored.schedule(), Schedule::Delayed { due_at: Some(_) }));
    }

    #[tokio::test]
    async fn push_flushes_at_the_size_threshold() {
        let store = MemoryStreamStore::new();
        let accumulator = BatchAccumulator::new(store.clone(), 5, Duration::from_secs(5));

        for n in 0..4 {
            accumulator.push(envelope(n), Duration::ZERO).await;
        }
        assert_eq!(accumulator.flushes(), 0);
        assert_eq!(accumulator.buffered("bulk").await, 4);

        accumulator.push(envelope(4), Duration::ZERO).await;
        assert_eq!(accumulator.flushes(), 1);
        assert_eq!(accumulator.buffered("bulk").await, 0);
        assert_eq!(store.range_to("bulk:stream", "+", 10).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn flush_due_waits_for_the_idle_timeout() {
        let store = MemoryStreamStore::new();
        let accumulator = BatchAccumulator::new(store.clone(), 50, Duration::from_millis(30));

        accumulator.push(envelope(0), Duration::ZERO).await;
        assert_eq!(accumulator.flush_due().await, 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(accumulator.flush_due().await, 1);
        assert_eq!(store.range_to("bulk:stream", "+", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_flush_retains_the_batch() {
        let store = MemoryStreamStore::new();
        // Prime the stream top far in the future so the delayed append's
        // explicit id is rejected.
        store
            .append_at("bulk:stream", "99999999999999-0", "blocker")
            .await
            .unwrap();

        let accumulator = BatchAccumulator::new(store.clone(), 1, Duration::from_secs(5));
        accumulator.push(envelope(0), Duration::from_secs(1)).await;

        assert_eq!(accumulator.flushes(), 0);
        assert_eq!(accumulator.buffered("bulk").await, 1);

        // Once the obstruction is gone the retained batch goes through.
        store.delete_stream("bulk:stream").await.unwrap();
        assert_eq!(accumulator.flush_all().await, 1);
        assert_eq!(accumulator.flushes(), 1);
        assert_eq!(accumulator.buffered("bulk").await, 0);
    }

    #[tokio::test]
    async fn background_task_flushes_and_drains_on_shutdown() {
        let store = MemoryStreamStore::new();
        let accumulator = Arc::new(BatchAccumulator::new(
            store.clone(),
            50,
            Duration::from_millis(20),
        ));
        let handle = accumulator.spawn_flush_task(Duration::from_millis(10));

        accumulator.push(envelope(0), Duration::ZERO).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.range_to("bulk:stream", "+", 10).await.unwrap().len(), 1);

        accumulator.push(envelope(1), Duration::ZERO).await;
        handle.shutdown().await;
        assert_eq!(store.range_to("bulk:stream", "+", 10).await.unwrap().len(), 2);
    }
}
