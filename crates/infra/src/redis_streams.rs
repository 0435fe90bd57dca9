//! Redis Streams-backed stream store (durable, at-least-once delivery).
//!
//! One stream per queue (`"{queue}:stream"`), one consumer group per stream,
//! named consumers within the group. The envelope JSON travels in a single
//! `payload` field of each entry.
//!
//! The connection is a long-lived [`ConnectionManager`]: it is cloned per
//! call and reconnects on failure instead of reconnecting per command.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;
use tracing::warn;

use conveyor_core::StoreError;
use conveyor_queue::{PendingEntry, ReadCursor, StreamEntry, StreamStore};

/// Field under which the envelope JSON is stored in a stream entry.
pub const PAYLOAD_FIELD: &str = "payload";

#[derive(Clone)]
pub struct RedisStreamStore {
    conn: ConnectionManager,
}

impl RedisStreamStore {
    /// Connect and build the shared connection manager.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(connection_err)?;
        let conn = ConnectionManager::new(client).await.map_err(connection_err)?;
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

impl std::fmt::Debug for RedisStreamStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamStore").finish_non_exhaustive()
    }
}

fn connection_err(e: redis::RedisError) -> StoreError {
    StoreError::Connection(e.to_string())
}

fn command_err(e: redis::RedisError) -> StoreError {
    StoreError::Command(e.to_string())
}

/// `NOGROUP` / missing-key replies mean "nothing there yet", not a fault.
fn is_missing(e: &redis::RedisError) -> bool {
    let message = e.to_string();
    message.contains("NOGROUP") || message.to_lowercase().contains("no such key")
}

fn entry_from(raw: &StreamId) -> Option<StreamEntry> {
    raw.get::<String>(PAYLOAD_FIELD).map(|payload| StreamEntry {
        id: raw.id.clone(),
        payload,
    })
}

#[async_trait]
impl StreamStore for RedisStreamStore {
    async fn append(&self, stream: &str, payload: &str) -> Result<String, StoreError> {
        let mut conn = self.conn();
        let id: String = conn
            .xadd(stream, "*", &[(PAYLOAD_FIELD, payload)])
            .await
            .map_err(command_err)?;
        Ok(id)
    }

    async fn append_at(
        &self,
        stream: &str,
        id: &str,
        payload: &str,
    ) -> Result<String, StoreError> {
        let mut conn = self.conn();
        let assigned: String = conn
            .xadd(stream, id, &[(PAYLOAD_FIELD, payload)])
            .await
            .map_err(command_err)?;
        Ok(assigned)
    }

    async fn append_batch(
        &self,
        stream: &str,
        entries: &[(Option<String>, String)],
    ) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (id, payload) in entries {
            match id {
                Some(id) => pipe
                    .xadd(stream, id.as_str(), &[(PAYLOAD_FIELD, payload.as_str())])
                    .ignore(),
                None => pipe
                    .xadd(stream, "*", &[(PAYLOAD_FIELD, payload.as_str())])
                    .ignore(),
            };
        }

        let mut conn = self.conn();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(command_err)
    }

    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        // MKSTREAM creates the stream itself, so a queue with no producer
        // activity yet is still consumable.
        let created: Result<(), redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, start_id).await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(command_err(e)),
        }
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
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        if let Some(block) = block {
            options = options.block(block.as_millis() as usize);
        }

        let mut conn = self.conn();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[cursor.as_arg()], &options)
            .await
            .map_err(command_err)?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for key in reply.keys {
            for raw in &key.ids {
                match entry_from(raw) {
                    Some(entry) => entries.push(entry),
                    // PEL slots whose entry was trimmed away read back with
                    // no fields; nothing left to process.
                    None => warn!(stream, id = %raw.id, "stream entry without payload field"),
                }
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let acked: u64 = conn.xack(stream, group, ids).await.map_err(command_err)?;
        Ok(acked)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn();
        let reply: Result<StreamPendingCountReply, redis::RedisError> = match consumer {
            Some(consumer) => {
                conn.xpending_consumer_count(stream, group, "-", "+", count, consumer)
                    .await
            }
            None => conn.xpending_count(stream, group, "-", "+", count).await,
        };

        match reply {
            Ok(reply) => Ok(reply
                .ids
                .into_iter()
                .map(|p| PendingEntry {
                    id: p.id,
                    consumer: p.consumer,
                    idle_ms: p.last_delivered_ms as u64,
                    deliveries: p.times_delivered as u64,
                })
                .collect()),
            Err(e) if is_missing(&e) => Ok(Vec::new()),
            Err(e) => Err(command_err(e)),
        }
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn();
        let reply: Result<StreamClaimReply, redis::RedisError> = conn
            .xclaim(stream, group, consumer, min_idle.as_millis() as usize, ids)
            .await;

        match reply {
            Ok(reply) => Ok(reply.ids.iter().filter_map(entry_from).collect()),
            Err(e) if is_missing(&e) => Ok(Vec::new()),
            Err(e) => Err(command_err(e)),
        }
    }

    async fn range_to(
        &self,
        stream: &str,
        end_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.conn();
        let reply: StreamRangeReply = conn
            .xrange_count(stream, "-", end_id, count)
            .await
            .map_err(command_err)?;
        Ok(reply.ids.iter().filter_map(entry_from).collect())
    }

    async fn list_streams(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        let keys: Vec<String> = conn.keys(pattern).await.map_err(command_err)?;
        Ok(keys)
    }

    async fn delete_stream(&self, stream: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let deleted: u64 = conn.del(stream).await.map_err(command_err)?;
        Ok(deleted > 0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(connection_err)?;
        Ok(())
    }
}
