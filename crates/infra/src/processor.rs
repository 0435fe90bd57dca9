//! The message processor: main consume loop plus the background reclaim
//! task.
//!
//! Per iteration, per queue: read this consumer's own pending entries, then
//! new entries, and process them in order. Not-yet-due delayed entries are
//! skipped and stay pending for a later pass. Handler success acknowledges
//! the entry; handler failure hands the envelope to the poison router and
//! acknowledges the physical entry once the logical message survives in the
//! re-enqueued copy.
//!
//! Per-message failures never terminate the loop; only store errors pause
//! it, briefly, with backoff.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use conveyor_core::queue::consumer_name;
use conveyor_core::{
    entry_id, stream_key, EnqueueError, Envelope, QueueConfig, Schedule, StoreError,
};
use conveyor_queue::{HandlerRegistry, ReadCursor, StreamEntry, StreamStore};

use crate::groups::ConsumerGroups;
use crate::poison::{PoisonRouter, RouteOutcome};

/// Counters for one processor instance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessorStats {
    /// Envelopes dispatched to a handler.
    pub processed: u64,
    /// Entries acknowledged after handler success.
    pub acked: u64,
    /// Envelopes re-enqueued for retry.
    pub retried: u64,
    /// Envelopes moved to a poison stream.
    pub dead_lettered: u64,
    /// Undeserializable entries dropped.
    pub dropped: u64,
    /// Entries recovered from idle PELs and disposed of.
    pub reclaimed: u64,
}

/// Long-running consumer over a set of queues.
///
/// Multiple instances sharing one group name scale out horizontally; the
/// store's consumer-group semantics deliver each entry to at most one
/// instance at a time.
pub struct MessageProcessor<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for MessageProcessor<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S> {
    store: S,
    registry: HandlerRegistry,
    groups: ConsumerGroups<S>,
    router: PoisonRouter<S>,
    config: QueueConfig,
    consumer: String,
    stats: Mutex<ProcessorStats>,
}

impl<S> MessageProcessor<S>
where
    S: StreamStore + Clone + 'static,
{
    /// Build a processor identified as this host and process.
    pub fn new(store: S, registry: HandlerRegistry, config: QueueConfig) -> Self {
        Self::with_consumer(store, registry, config, consumer_name())
    }

    /// Build a processor with an explicit consumer identity.
    pub fn with_consumer(
        store: S,
        registry: HandlerRegistry,
        config: QueueConfig,
        consumer: String,
    ) -> Self {
        let groups = ConsumerGroups::new(store.clone());
        let router = PoisonRouter::new(store.clone(), config.max_retries);
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                groups,
                router,
                config,
                consumer,
                stats: Mutex::new(ProcessorStats::default()),
            }),
        }
    }

    pub fn consumer(&self) -> &str {
        &self.inner.consumer
    }

    pub fn stats(&self) -> ProcessorStats {
        self.inner.stats.lock().unwrap().clone()
    }

    /// Run until the shutdown signal flips.
    ///
    /// The signal stops new iterations; an in-flight entry completes, and
    /// the reclaim task is awaited before returning.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let inner = self.inner;

        loop {
            if *shutdown.borrow() {
                return;
            }
            match inner
                .groups
                .initialize(&inner.config.queue_names, &inner.config.group_name)
                .await
            {
                Ok(()) => break,
                Err(e) => {
                    error!(error = %e, "failed to initialize consumer groups; retrying");
                    if wait_or_shutdown(&mut shutdown, inner.config.reconnect_delay).await {
                        return;
                    }
                }
            }
        }

        let reclaim = tokio::spawn(reclaim_loop(Arc::clone(&inner), shutdown.clone()));
        info!(
            consumer = %inner.consumer,
            queues = ?inner.config.queue_names,
            group = %inner.config.group_name,
            "message processor started"
        );

        'main: loop {
            if *shutdown.borrow() {
                break;
            }

            let mut handled = 0usize;
            for queue in &inner.config.queue_names {
                match inner.drain_queue(queue).await {
                    Ok(n) => handled += n,
                    Err(e) => {
                        error!(queue, error = %e, "store error in read loop; backing off");
                        if wait_or_shutdown(&mut shutdown, inner.config.reconnect_delay).await {
                            break 'main;
                        }
                    }
                }
                if *shutdown.borrow() {
                    break 'main;
                }
            }

            if handled == 0 && wait_or_shutdown(&mut shutdown, inner.config.read_block).await {
                break;
            }
        }

        let _ = reclaim.await;
        info!(consumer = %inner.consumer, "message processor stopped");
    }
}

/// Sleep for `wait`, waking early on shutdown. Returns whether shutdown was
/// signalled (a dropped sender counts as shutdown).
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, wait: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(wait) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

async fn reclaim_loop<S>(inner: Arc<Inner<S>>, mut shutdown: watch::Receiver<bool>)
where
    S: StreamStore + Clone + 'static,
{
    let mut ticker = tokio::time::interval(inner.config.reclaim_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => inner.reclaim_pass().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

impl<S> Inner<S>
where
    S: StreamStore + Clone + 'static,
{
    async fn drain_queue(&self, queue: &str) -> Result<usize, StoreError> {
        let stream = stream_key(queue);

        let mut entries = self
            .store
            .read_group(
                &stream,
                &self.config.group_name,
                &self.consumer,
                ReadCursor::Pending,
                self.config.read_count,
                None,
            )
            .await?;
        let new = self
            .store
            .read_group(
                &stream,
                &self.config.group_name,
                &self.consumer,
                ReadCursor::New,
                self.config.read_count,
                Some(self.config.read_block),
            )
            .await?;
        entries.extend(new);

        let mut handled = 0;
        for entry in entries {
            if self.process_entry(queue, &stream, entry).await? {
                handled += 1;
            }
        }
        Ok(handled)
    }

    /// Process one entry. Returns whether it was disposed of (acked or
    /// handed off); a not-yet-due delayed entry returns `false` and stays
    /// pending for a later pass.
    async fn process_entry(
        &self,
        queue: &str,
        stream: &str,
        entry: StreamEntry,
    ) -> Result<bool, StoreError> {
        let envelope: Envelope = match serde_json::from_str(&entry.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Re-delivery cannot fix a parse failure; drop it for good.
                error!(queue, entry = %entry.id, error = %e, "dropping undeserializable envelope");
                self.ack_entry(stream, &entry.id).await?;
                self.stats.lock().unwrap().dropped += 1;
                return Ok(true);
            }
        };

        if !is_due(&envelope, &entry.id) {
            return Ok(false);
        }

        if envelope.log {
            info!(
                queue,
                operation = %envelope.operation,
                entry = %entry.id,
                retries = envelope.retries,
                "processing envelope"
            );
        }
        self.stats.lock().unwrap().processed += 1;

        let outcome = match self.registry.get(queue, &envelope.operation) {
            Some(handler) => handler.handle(&envelope).await,
            // May self-resolve once the registration is fixed, so it takes
            // the business-failure path rather than being dropped.
            None => Err(anyhow::anyhow!(
                "no handler registered for {queue}/{}",
                envelope.operation
            )),
        };

        let failure = match outcome {
            Ok(true) => None,
            Ok(false) => Some("handler reported failure".to_string()),
            Err(e) => Some(format!("{e:#}")),
        };

        match failure {
            None => {
                self.ack_entry(stream, &entry.id).await?;
                self.stats.lock().unwrap().acked += 1;
            }
            Some(reason) => {
                warn!(
                    queue,
                    operation = %envelope.operation,
                    entry = %entry.id,
                    reason,
                    "handler failed; routing envelope"
                );
                match self.router.route(queue, envelope).await {
                    Ok(routed) => {
                        // The logical message survives in the re-enqueued
                        // copy; the physical entry can now be acked.
                        self.ack_entry(stream, &entry.id).await?;
                        let mut stats = self.stats.lock().unwrap();
                        match routed {
                            RouteOutcome::Retried(_) => stats.retried += 1,
                            RouteOutcome::Poisoned => stats.dead_lettered += 1,
                        }
                    }
                    // Entry stays pending and is retried on a later pass.
                    Err(EnqueueError::Store(e)) => return Err(e),
                    Err(EnqueueError::Serialization(e)) => {
                        error!(queue, entry = %entry.id, error = %e, "failed to serialize envelope for routing");
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    async fn reclaim_pass(&self) {
        for queue in &self.config.queue_names {
            let stream = stream_key(queue);
            let claimed = match self
                .groups
                .claim_idle(
                    &stream,
                    &self.config.group_name,
                    &self.consumer,
                    self.config.reclaim_min_idle,
                    self.config.read_count,
                )
                .await
            {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(queue, error = %e, "reclaim pass failed");
                    continue;
                }
            };

            for entry in claimed {
                let id = entry.id.clone();
                match self.process_entry(queue, &stream, entry).await {
                    Ok(true) => self.stats.lock().unwrap().reclaimed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(queue, entry = %id, error = %e, "failed to process reclaimed entry");
                        break;
                    }
                }
            }
        }
    }

    async fn ack_entry(&self, stream: &str, id: &str) -> Result<(), StoreError> {
        self.store
            .ack(stream, &self.config.group_name, &[id.to_string()])
            .await?;
        Ok(())
    }
}

/// A delayed envelope is due once its own `delay_until` has passed; the
/// entry-id timestamp is consulted only when the echo does not parse.
/// Immediate envelopes are never id-sniffed, so ordinary auto-assigned ids
/// cannot false-positive as schedules.
fn is_due(envelope: &Envelope, entry_id_str: &str) -> bool {
    match envelope.schedule() {
        Schedule::Immediate => true,
        Schedule::Delayed { due_at: Some(due) } => due <= Utc::now(),
        Schedule::Delayed { due_at: None } => entry_id::millis(entry_id_str)
            .is_none_or(|ms| ms as i64 <= Utc::now().timestamp_millis()),
    }
}
