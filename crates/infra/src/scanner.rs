//! Delayed-entry scanner (independent daemon).
//!
//! Scans every queue stream for delayed entries whose due time has arrived
//! and emits one observability log line per newly-ready entry. It never
//! consumes, acknowledges or mutates anything; the message processor's
//! consumer-group read is what actually delivers the entry. The scanner can
//! be stopped without affecting correctness, only visibility.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info};

use conveyor_core::queue::{is_poison_queue, queue_of_stream, STREAM_SUFFIX};
use conveyor_core::{entry_id, Envelope, QueueConfig, StoreError};
use conveyor_queue::StreamStore;

/// Entries announced per stream per pass.
const SCAN_COUNT: usize = 100;

/// Insertion-ordered de-dup set, capped by discarding the oldest half.
#[derive(Debug)]
struct ReadySet {
    seen: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl ReadySet {
    fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// Returns true the first time an id is seen.
    fn insert(&mut self, id: String) -> bool {
        if !self.seen.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.cap {
            for _ in 0..self.cap / 2 {
                if let Some(oldest) = self.order.pop_front() {
                    self.seen.remove(&oldest);
                }
            }
        }
        true
    }
}

#[derive(Debug)]
pub struct DelayedScanner<S> {
    store: S,
    scan_interval: Duration,
    reconnect_delay: Duration,
    ready: ReadySet,
}

impl<S: StreamStore> DelayedScanner<S> {
    pub fn new(store: S, config: &QueueConfig) -> Self {
        Self {
            store,
            scan_interval: config.scan_interval,
            reconnect_delay: config.reconnect_delay,
            ready: ReadySet::new(1000),
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("delayed entry scanner started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.scan_once().await {
                Ok(_) => self.scan_interval,
                Err(e) => {
                    error!(error = %e, "scan pass failed; backing off");
                    self.reconnect_delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("delayed entry scanner stopped");
    }

    /// One pass over all queue streams; returns how many newly-ready
    /// delayed entries were announced.
    pub async fn scan_once(&mut self) -> Result<usize, StoreError> {
        self.store.ping().await?;

        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let streams = self
            .store
            .list_streams(&format!("*{STREAM_SUFFIX}"))
            .await?;

        let mut announced = 0;
        for stream in streams {
            // Poison streams match the naming convention but hold
            // dead-lettered envelopes, not schedulable work.
            if queue_of_stream(&stream).is_some_and(is_poison_queue) {
                continue;
            }

            let entries = self
                .store
                .range_to(&stream, &now_ms.to_string(), SCAN_COUNT)
                .await?;

            for entry in entries {
                if !entry_id::is_plausible_timestamp(&entry.id) {
                    continue;
                }
                let Ok(envelope) = serde_json::from_str::<Envelope>(&entry.payload) else {
                    continue;
                };
                let Some(delay_until) = envelope.delay_until.as_deref() else {
                    continue;
                };

                if self.ready.insert(entry.id.clone()) {
                    info!(
                        stream = %stream,
                        entry = %entry.id,
                        queue = %envelope.queue_name,
                        delay_until,
                        "delayed entry ready"
                    );
                    announced += 1;
                }
            }
        }
        Ok(announced)
    }
}
