//! Consumer-group management for queue streams.
//!
//! Group creation is idempotent, and every "nothing pending" / "nothing to
//! claim" sentinel is a normal empty result. Claiming idle pending entries
//! is the sole mechanism for recovering work left in a crashed consumer's
//! PEL.

use std::time::Duration;

use tracing::{debug, info};

use conveyor_core::{stream_key, StoreError};
use conveyor_queue::{PendingEntry, StreamEntry, StreamStore};

#[derive(Debug, Clone)]
pub struct ConsumerGroups<S> {
    store: S,
}

impl<S: StreamStore> ConsumerGroups<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Create the group (and the stream) if absent.
    pub async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), StoreError> {
        self.store.ensure_group(stream, group, start_id).await?;
        debug!(stream, group, "consumer group ensured");
        Ok(())
    }

    /// Ensure one group per configured queue, reading from the beginning.
    pub async fn initialize(&self, queue_names: &[String], group: &str) -> Result<(), StoreError> {
        for queue in queue_names {
            self.ensure_group(&stream_key(queue), group, "0").await?;
        }
        info!(queues = queue_names.len(), group, "consumer groups initialized");
        Ok(())
    }

    /// Pending (delivered-but-unacknowledged) entries, optionally filtered
    /// to one consumer.
    pub async fn list_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        self.store.pending(stream, group, consumer, count).await
    }

    /// Claim up to `count` pending entries idle at least `min_idle`,
    /// reassigning them to `claimant`.
    pub async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        claimant: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        // Overfetch so entries below the idle threshold do not crowd out
        // claimable ones.
        let pending = self
            .store
            .pending(stream, group, None, count.saturating_mul(2))
            .await?;

        let min_idle_ms = min_idle.as_millis() as u64;
        let idle_ids: Vec<String> = pending
            .into_iter()
            .filter(|p| p.idle_ms >= min_idle_ms)
            .map(|p| p.id)
            .take(count)
            .collect();

        if idle_ids.is_empty() {
            return Ok(Vec::new());
        }

        let claimed = self
            .store
            .claim(stream, group, claimant, min_idle, &idle_ids)
            .await?;
        if !claimed.is_empty() {
            info!(stream, claimant, claimed = claimed.len(), "claimed idle pending entries");
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStreamStore;
    use conveyor_queue::ReadCursor;

    #[tokio::test]
    async fn initialize_is_idempotent_and_creates_streams() {
        let store = MemoryStreamStore::new();
        let groups = ConsumerGroups::new(store.clone());
        let queues = vec!["a".to_string(), "b".to_string()];

        groups.initialize(&queues, "main-group").await.unwrap();
        groups.initialize(&queues, "main-group").await.unwrap();

        // A queue with no producer activity is still consumable.
        let read = store
            .read_group("a:stream", "main-group", "c1", ReadCursor::New, 10, None)
            .await
            .unwrap();
        assert!(read.is_empty());
    }

    #[tokio::test]
    async fn list_pending_on_untouched_queue_is_empty() {
        let store = MemoryStreamStore::new();
        let groups = ConsumerGroups::new(store);

        let pending = groups
            .list_pending("ghost:stream", "main-group", None, 10)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn claim_idle_skips_fresh_entries() {
        let store = MemoryStreamStore::new();
        let groups = ConsumerGroups::new(store.clone());
        store.append("q:stream", "p").await.unwrap();
        groups.ensure_group("q:stream", "g", "0").await.unwrap();

        store
            .read_group("q:stream", "g", "crashed", ReadCursor::New, 10, None)
            .await
            .unwrap();

        let claimed = groups
            .claim_idle("q:stream", "g", "rescuer", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn claim_idle_recovers_stale_entries() {
        let store = MemoryStreamStore::new();
        let groups = ConsumerGroups::new(store.clone());
        store.append("q:stream", "p").await.unwrap();
        groups.ensure_group("q:stream", "g", "0").await.unwrap();

        store
            .read_group("q:stream", "g", "crashed", ReadCursor::New, 10, None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let claimed = groups
            .claim_idle("q:stream", "g", "rescuer", Duration::from_millis(20), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload, "p");
    }
}
