//! Poison/dead-letter routing.
//!
//! A failed envelope is re-enqueued with an incremented retry counter until
//! it exhausts `max_retries`, then redirected to the queue's poison stream
//! for manual inspection. Duplicate routing of the same logical failure is
//! an accepted at-least-once artifact.

use chrono::Utc;
use tracing::{info, warn};

use conveyor_core::{poison_queue, poison_stream_key, EnqueueError, Envelope, StoreError};
use conveyor_queue::{StreamEntry, StreamStore};

use crate::producer::Producer;

/// What [`PoisonRouter::route`] did with the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Re-enqueued into the original queue; carries the new retry count.
    Retried(u32),
    /// Appended to the queue's poison stream.
    Poisoned,
}

#[derive(Debug, Clone)]
pub struct PoisonRouter<S> {
    producer: Producer<S>,
    store: S,
    max_retries: u32,
}

impl<S: StreamStore + Clone> PoisonRouter<S> {
    pub fn new(store: S, max_retries: u32) -> Self {
        Self {
            producer: Producer::new(store.clone()),
            store,
            max_retries,
        }
    }

    /// Route a failed envelope: retry or dead-letter.
    pub async fn route(
        &self,
        queue: &str,
        mut envelope: Envelope,
    ) -> Result<RouteOutcome, EnqueueError> {
        if envelope.retries >= self.max_retries {
            envelope.queue_name = poison_queue(queue);
            envelope.poisoned_at = Some(Utc::now());
            let payload = serde_json::to_string(&envelope)?;
            self.store
                .append(&poison_stream_key(queue), &payload)
                .await?;
            warn!(
                queue,
                poison_queue = %envelope.queue_name,
                retries = envelope.retries,
                "envelope moved to poison queue"
            );
            Ok(RouteOutcome::Poisoned)
        } else {
            envelope.retries += 1;
            envelope.queue_name = queue.to_string();
            let retries = envelope.retries;
            self.producer
                .enqueue(envelope, std::time::Duration::ZERO)
                .await?;
            info!(queue, retries, "requeued envelope for retry");
            Ok(RouteOutcome::Retried(retries))
        }
    }

    /// List dead-lettered envelopes for a queue (monitoring/debugging).
    pub async fn poisoned(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<(String, Envelope)>, StoreError> {
        let entries = self
            .store
            .range_to(&poison_stream_key(queue), "+", limit)
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|StreamEntry { id, payload }| {
                match serde_json::from_str::<Envelope>(&payload) {
                    Ok(envelope) => Some((id, envelope)),
                    Err(e) => {
                        warn!(queue, entry = %id, error = %e, "undecodable poison entry");
                        None
                    }
                }
            })
            .collect())
    }

    /// Drop a queue's poison stream entirely (manual operator action).
    pub async fn purge(&self, queue: &str) -> Result<bool, StoreError> {
        let existed = self.store.delete_stream(&poison_stream_key(queue)).await?;
        if existed {
            info!(queue, "poison queue purged");
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStreamStore;
    use serde_json::json;

    fn failing_envelope(retries: u32) -> Envelope {
        let mut envelope = Envelope::new("sessions", "create", json!({"id": "s1"}));
        envelope.retries = retries;
        envelope
    }

    #[tokio::test]
    async fn below_threshold_requeues_with_incremented_counter() {
        let store = MemoryStreamStore::new();
        let router = PoisonRouter::new(store.clone(), 3);

        let outcome = router.route("sessions", failing_envelope(0)).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Retried(1));

        let entries = store.range_to("sessions:stream", "+", 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        let requeued: Envelope = serde_json::from_str(&entries[0].payload).unwrap();
        assert_eq!(requeued.retries, 1);
        assert_eq!(requeued.queue_name, "sessions");

        assert!(router.poisoned("sessions", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_move_to_the_poison_stream() {
        let store = MemoryStreamStore::new();
        let router = PoisonRouter::new(store.clone(), 3);

        let outcome = router.route("sessions", failing_envelope(3)).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Poisoned);

        // Nothing re-enqueued into the original queue.
        assert!(store
            .range_to("sessions:stream", "+", 10)
            .await
            .unwrap()
            .is_empty());

        let poisoned = router.poisoned("sessions", 10).await.unwrap();
        assert_eq!(poisoned.len(), 1);
        let (_, envelope) = &poisoned[0];
        assert_eq!(envelope.queue_name, "sessions-poison");
        assert_eq!(envelope.retries, 3);
        assert!(envelope.poisoned_at.is_some());
    }

    #[tokio::test]
    async fn purge_empties_the_poison_stream() {
        let store = MemoryStreamStore::new();
        let router = PoisonRouter::new(store.clone(), 0);

        router.route("sessions", failing_envelope(0)).await.unwrap();
        assert_eq!(router.poisoned("sessions", 10).await.unwrap().len(), 1);

        assert!(router.purge("sessions").await.unwrap());
        assert!(router.poisoned("sessions", 10).await.unwrap().is_empty());
        assert!(!router.purge("sessions").await.unwrap());
    }
}
