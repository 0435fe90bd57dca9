//! In-memory stream store for tests/dev.
//!
//! Models the full consumer-group contract of the port (ordered entries,
//! per-group delivery cursor, PEL with owner/idle/delivery counters) so the
//! runtime can be exercised without a Redis server.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use conveyor_core::{entry_id, StoreError};
use conveyor_queue::{PendingEntry, ReadCursor, StreamEntry, StreamStore};

type EntryId = (u64, u64);

#[derive(Debug, Clone)]
struct StoredEntry {
    id: EntryId,
    payload: String,
}

#[derive(Debug, Clone)]
struct PelSlot {
    consumer: String,
    deliveries: u64,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    pel: HashMap<EntryId, PelSlot>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<StoredEntry>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn next_auto_id(&self) -> EntryId {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        if now > self.last_id.0 {
            (now, 0)
        } else {
            (self.last_id.0, self.last_id.1 + 1)
        }
    }

    fn payload_of(&self, id: EntryId) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.payload.as_str())
    }
}

/// In-memory [`StreamStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStreamStore {
    inner: Arc<RwLock<HashMap<String, StreamState>>>,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn parse_strict(id: &str) -> Result<EntryId, StoreError> {
    entry_id::parse(id).ok_or_else(|| StoreError::Command(format!("invalid entry id: {id}")))
}

/// Parse a range end: `"+"` and bare-millis forms saturate the sequence.
fn parse_end(id: &str) -> Result<EntryId, StoreError> {
    if id == "+" {
        return Ok((u64::MAX, u64::MAX));
    }
    match id.split_once('-') {
        Some(_) => parse_strict(id),
        None => {
            let ms = id
                .parse()
                .map_err(|_| StoreError::Command(format!("invalid entry id: {id}")))?;
            Ok((ms, u64::MAX))
        }
    }
}

/// Single-`*` glob, which is all the key enumeration needs.
fn glob_match(pattern: &str, key: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            key.len() >= prefix.len() + suffix.len()
                && key.starts_with(prefix)
                && key.ends_with(suffix)
        }
        None => pattern == key,
    }
}

fn format_id(id: EntryId) -> String {
    entry_id::format(id.0, id.1)
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn append(&self, stream: &str, payload: &str) -> Result<String, StoreError> {
        let mut streams = self.inner.write().unwrap();
        let state = streams.entry(stream.to_string()).or_default();

        let id = state.next_auto_id();
        state.entries.push(StoredEntry {
            id,
            payload: payload.to_string(),
        });
        state.last_id = id;
        Ok(format_id(id))
    }

    async fn append_at(
        &self,
        stream: &str,
        id: &str,
        payload: &str,
    ) -> Result<String, StoreError> {
        let parsed = parse_strict(id)?;
        let mut streams = self.inner.write().unwrap();
        let state = streams.entry(stream.to_string()).or_default();

        if parsed <= state.last_id {
            return Err(StoreError::Command(
                "The ID specified in XADD is equal or smaller than the target stream top item"
                    .to_string(),
            ));
        }
        state.entries.push(StoredEntry {
            id: parsed,
            payload: payload.to_string(),
        });
        state.last_id = parsed;
        Ok(format_id(parsed))
    }

    async fn append_batch(
        &self,
        stream: &str,
        entries: &[(Option<String>, String)],
    ) -> Result<(), StoreError> {
        let mut streams = self.inner.write().unwrap();
        let state = streams.entry(stream.to_string()).or_default();

        // Validate the whole batch before touching the stream so the call
        // stays all-or-nothing, like a MULTI'd pipeline.
        let mut assigned = Vec::with_capacity(entries.len());
        let mut last = state.last_id;
        for (id, _) in entries {
            let next = match id {
                Some(raw) => {
                    let parsed = parse_strict(raw)?;
                    if parsed <= last {
                        return Err(StoreError::Command(
                            "The ID specified in XADD is equal or smaller than the target stream top item"
                                .to_string(),
                        ));
                    }
                    parsed
                }
                None => {
                    let now = Utc::now().timestamp_millis().max(0) as u64;
                    if now > last.0 {
                        (now, 0)
                    } else {
                        (last.0, last.1 + 1)
                    }
                }
            };
            assigned.push(next);
            last = next;
        }

        for ((_, payload), id) in entries.iter().zip(assigned) {
            state.entries.push(StoredEntry {
                id,
                payload: payload.clone(),
            });
        }
        state.last_id = last;
        Ok(())
    }

    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), StoreError> {
        let mut streams = self.inner.write().unwrap();
        let state = streams.entry(stream.to_string()).or_default();

        if !state.groups.contains_key(group) {
            let last_delivered = match start_id {
                "$" => state.last_id,
                "0" => (0, 0),
                other => parse_strict(other)?,
            };
            state.groups.insert(
                group.to_string(),
                GroupState {
                    last_delivered,
                    pel: HashMap::new(),
                },
            );
        }
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        _block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut streams = self.inner.write().unwrap();
        let state = streams
            .get_mut(stream)
            .ok_or_else(|| StoreError::Command(format!("NOGROUP no such stream: {stream}")))?;

        match cursor {
            ReadCursor::Pending => {
                let group_state = state
                    .groups
                    .get(group)
                    .ok_or_else(|| StoreError::Command(format!("NOGROUP no such group: {group}")))?;

                let mut own: Vec<EntryId> = group_state
                    .pel
                    .iter()
                    .filter(|(_, slot)| slot.consumer == consumer)
                    .map(|(id, _)| *id)
                    .collect();
                own.sort_unstable();

                Ok(own
                    .into_iter()
                    .take(count)
                    .filter_map(|id| {
                        state.payload_of(id).map(|payload| StreamEntry {
                            id: format_id(id),
                            payload: payload.to_string(),
                        })
                    })
                    .collect())
            }
            ReadCursor::New => {
                let last_delivered = state
                    .groups
                    .get(group)
                    .ok_or_else(|| StoreError::Command(format!("NOGROUP no such group: {group}")))?
                    .last_delivered;

                let fresh: Vec<StoredEntry> = state
                    .entries
                    .iter()
                    .filter(|e| e.id > last_delivered)
                    .take(count)
                    .cloned()
                    .collect();

                let group_state = state.groups.get_mut(group).expect("group checked above");
                let now = Instant::now();
                for entry in &fresh {
                    group_state.pel.insert(
                        entry.id,
                        PelSlot {
                            consumer: consumer.to_string(),
                            deliveries: 1,
                            delivered_at: now,
                        },
                    );
                    group_state.last_delivered = entry.id;
                }

                Ok(fresh
                    .into_iter()
                    .map(|e| StreamEntry {
                        id: format_id(e.id),
                        payload: e.payload,
                    })
                    .collect())
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StoreError> {
        let mut streams = self.inner.write().unwrap();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(0);
        };

        let mut acked = 0;
        for id in ids {
            if let Some(parsed) = entry_id::parse(id) {
                if group_state.pel.remove(&parsed).is_some() {
                    acked += 1;
                }
            }
        }
        Ok(acked)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: Option<&str>,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let streams = self.inner.read().unwrap();
        let Some(group_state) = streams.get(stream).and_then(|s| s.groups.get(group)) else {
            return Ok(Vec::new());
        };

        let mut pending: Vec<(EntryId, &PelSlot)> = group_state
            .pel
            .iter()
            .filter(|(_, slot)| consumer.is_none_or(|c| slot.consumer == c))
            .map(|(id, slot)| (*id, slot))
            .collect();
        pending.sort_unstable_by_key(|(id, _)| *id);

        Ok(pending
            .into_iter()
            .take(count)
            .map(|(id, slot)| PendingEntry {
                id: format_id(id),
                consumer: slot.consumer.clone(),
                idle_ms: slot.delivered_at.elapsed().as_millis() as u64,
                deliveries: slot.deliveries,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut streams = self.inner.write().unwrap();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };

        let mut claimed_ids = Vec::new();
        if let Some(group_state) = state.groups.get_mut(group) {
            let now = Instant::now();
            for id in ids {
                let Some(parsed) = entry_id::parse(id) else {
                    continue;
                };
                if let Some(slot) = group_state.pel.get_mut(&parsed) {
                    if slot.delivered_at.elapsed() >= min_idle {
                        slot.consumer = consumer.to_string();
                        slot.deliveries += 1;
                        slot.delivered_at = now;
                        claimed_ids.push(parsed);
                    }
                }
            }
        }

        Ok(claimed_ids
            .into_iter()
            .filter_map(|id| {
                state.payload_of(id).map(|payload| StreamEntry {
                    id: format_id(id),
                    payload: payload.to_string(),
                })
            })
            .collect())
    }

    async fn range_to(
        &self,
        stream: &str,
        end_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let end = parse_end(end_id)?;
        let streams = self.inner.read().unwrap();
        let Some(state) = streams.get(stream) else {
            return Ok(Vec::new());
        };

        Ok(state
            .entries
            .iter()
            .filter(|e| e.id <= end)
            .take(count)
            .map(|e| StreamEntry {
                id: format_id(e.id),
                payload: e.payload.clone(),
            })
            .collect())
    }

    async fn list_streams(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let streams = self.inner.read().unwrap();
        let mut keys: Vec<String> = streams
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_stream(&self, stream: &str) -> Result<bool, StoreError> {
        let mut streams = self.inner.write().unwrap();
        Ok(streams.remove(stream).is_some())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
