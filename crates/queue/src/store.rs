//! Stream store abstraction (mechanics only).
//!
//! A `StreamStore` is an append-only, per-queue ordered log with consumer
//! group semantics: each entry is delivered to at most one consumer in a
//! group at a time and stays in that consumer's pending entry list (PEL)
//! until acknowledged or claimed away.
//!
//! ## Delivery guarantees
//!
//! The port provides **at-least-once delivery**:
//! - an unacknowledged entry is redelivered (own-PEL reads, claims)
//! - consumers must be idempotent
//! - "nothing pending" / "nothing to claim" are normal empty results, never
//!   errors

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use conveyor_core::StoreError;

/// One `(id, payload)` record read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub payload: String,
}

/// Summary of a delivered-but-unacknowledged entry in a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub deliveries: u64,
}

/// Read position for [`StreamStore::read_group`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// This consumer's own PEL, from the start.
    Pending,
    /// Next never-delivered entries.
    New,
}

impl ReadCursor {
    /// Wire form of the cursor (`"0"` / `">"`).
    pub fn as_arg(&self) -> &'static str {
        match self {
            ReadCursor::Pending => "0",
            ReadCursor::New => ">",
        }
    }
}

/// Append-only log with consumer-group semantics.
///
/// Implementations must normalize the store's empty-result sentinels
/// (missing stream, missing group, zero pending) into empty collections;
/// only transport-level failures surface as [`StoreError`].
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Append with an auto-assigned id; returns the assigned id.
    async fn append(&self, stream: &str, payload: &str) -> Result<String, StoreError>;

    /// Append with an explicit id. An id at or below the stream's current
    /// maximum is rejected by the store and surfaced to the caller.
    async fn append_at(&self, stream: &str, id: &str, payload: &str)
        -> Result<String, StoreError>;

    /// Append a batch in one pipelined, all-or-nothing round trip. Entries
    /// with `None` ids are auto-assigned.
    async fn append_batch(
        &self,
        stream: &str,
        entries: &[(Option<String>, String)],
    ) -> Result<(), StoreError>;

    /// Create the consumer group (and the stream itself) if absent.
    /// "Group already exists" is success.
    async fn ensure_group(&self, stream: &str, group: &str, start_id: &str)
        -> Result<(), StoreError>;

    /// Read up to `count` entries for `consumer` at the given cursor,
    /// waiting at most `block` on the new-entry cursor.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Acknowledge entries, removing them from the owner's PEL. Returns the
    /// number of entries actually acknowledged.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StoreError>;

    /// List pending entries, optionally filtered to one consumer.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError>;

    /// Reassign pending entries idle at least `min_idle` to `consumer`,
    /// returning the entries that were actually claimed.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Range-read from the beginning of the stream up to `end_id`
    /// (inclusive), independent of any consumer group.
    async fn range_to(
        &self,
        stream: &str,
        end_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Enumerate stream keys matching a glob-style pattern.
    async fn list_streams(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Delete a stream outright; returns whether it existed.
    async fn delete_stream(&self, stream: &str) -> Result<bool, StoreError>;

    /// Connectivity probe for reconnect loops.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> StreamStore for Arc<S>
where
    S: StreamStore + ?Sized,
{
    async fn append(&self, stream: &str, payload: &str) -> Result<String, StoreError> {
        (**self).append(stream, payload).await
    }

    async fn append_at(
        &self,
        stream: &str,
        id: &str,
        payload: &str,
    ) -> Result<String, StoreError> {
        (**self).append_at(stream, id, payload).await
    }

    async fn append_batch(
        &self,
        stream: &str,
        entries: &[(Option<String>, String)],
    ) -> Result<(), StoreError> {
        (**self).append_batch(stream, entries).await
    }

    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), StoreError> {
        (**self).ensure_group(stream, group, start_id).await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        (**self)
            .read_group(stream, group, consumer, cursor, count, block)
            .await
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StoreError> {
        (**self).ack(stream, group, ids).await
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        (**self).pending(stream, group, consumer, count).await
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, StoreError> {
        (**self).claim(stream, group, consumer, min_idle, ids).await
    }

    async fn range_to(
        &self,
        stream: &str,
        end_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        (**self).range_to(stream, end_id, count).await
    }

    async fn list_streams(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        (**self).list_streams(pattern).await
    }

    async fn delete_stream(&self, stream: &str) -> Result<bool, StoreError> {
        (**self).delete_stream(stream).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        (**self).ping().await
    }
}
