use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Wire format of `delay_until` (human-readable echo of the scheduled time,
/// rendered in the producer's local time).
pub const DELAY_UNTIL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The unit of work carried by a queue.
///
/// Serialized as JSON into a single stream-entry field. Fields at their
/// defaults (`retries == 0`, `log == true`, absent options) stay off the
/// wire, so first-attempt envelopes match what producers in other services
/// emit by hand.
///
/// Notes:
/// - `data` is opaque to the queue itself: a map, or a list of maps for
///   batched entity replication.
/// - `delay_until` is the **sole signal** that an entry is delayed rather
///   than immediate; the entry-id timestamp is only the store-level
///   scheduling mechanism.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Logical destination; the stream key is `"{queue_name}:stream"`.
    pub queue_name: String,
    /// Handler selector within the queue (e.g. `send_email`, `insert`).
    pub operation: String,
    /// Operation payload.
    pub data: serde_json::Value,
    /// Model name for entity-replication queues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Incremented by the poison router on each failed attempt.
    #[serde(default, skip_serializing_if = "retries_is_zero")]
    pub retries: u32,
    /// Human-readable echo of the scheduled delivery time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<String>,
    /// Stamped when the envelope is moved to the poison queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poisoned_at: Option<DateTime<Utc>>,
    /// Per-message opt-out of info-level processing logs.
    #[serde(default = "default_log", skip_serializing_if = "log_is_default")]
    pub log: bool,
}

fn retries_is_zero(retries: &u32) -> bool {
    *retries == 0
}

fn default_log() -> bool {
    true
}

fn log_is_default(log: &bool) -> bool {
    *log
}

/// Delivery schedule, decided from the envelope itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Immediate,
    /// `due_at` is `None` when the `delay_until` echo does not parse;
    /// callers then fall back to the entry-id timestamp.
    Delayed { due_at: Option<DateTime<Utc>> },
}

impl Envelope {
    /// Create a first-attempt, immediate envelope.
    pub fn new(
        queue_name: impl Into<String>,
        operation: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            operation: operation.into(),
            data,
            model: None,
            retries: 0,
            delay_until: None,
            poisoned_at: None,
            log: true,
        }
    }

    /// Set the model name (entity-replication queues).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Suppress the per-message info log while processing.
    pub fn quiet(mut self) -> Self {
        self.log = false;
        self
    }

    /// Stamp the `delay_until` echo for an envelope scheduled at `due_at`.
    pub fn mark_delayed(&mut self, due_at: DateTime<Utc>) {
        self.delay_until = Some(
            due_at
                .with_timezone(&Local)
                .format(DELAY_UNTIL_FORMAT)
                .to_string(),
        );
    }

    /// Whether the envelope was enqueued on the delayed path.
    pub fn is_delayed(&self) -> bool {
        self.delay_until.is_some()
    }

    /// The delivery schedule carried by this envelope.
    pub fn schedule(&self) -> Schedule {
        match self.delay_until.as_deref() {
            None => Schedule::Immediate,
            Some(echo) => Schedule::Delayed {
                due_at: parse_delay_until(echo),
            },
        }
    }
}

fn parse_delay_until(echo: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(echo, DELAY_UNTIL_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|local| local.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_stay_off_the_wire() {
        let envelope = Envelope::new("notifications", "send_email", json!({"to": ["a@b.c"]}));
        let wire = serde_json::to_value(&envelope).unwrap();

        assert_eq!(wire["queue_name"], "notifications");
        assert!(wire.get("retries").is_none());
        assert!(wire.get("delay_until").is_none());
        assert!(wire.get("poisoned_at").is_none());
        assert!(wire.get("log").is_none());
        assert!(wire.get("model").is_none());
    }

    #[test]
    fn minimal_wire_form_deserializes() {
        let envelope: Envelope = serde_json::from_str(
            r#"{"queue_name":"sessions","operation":"create","data":{"id":"s1"}}"#,
        )
        .unwrap();

        assert_eq!(envelope.retries, 0);
        assert!(envelope.log);
        assert_eq!(envelope.schedule(), Schedule::Immediate);
    }

    #[test]
    fn round_trip_preserves_retry_state() {
        let mut envelope = Envelope::new("sessions", "update", json!({"id": "s1"}));
        envelope.retries = 2;
        envelope.log = false;

        let back: Envelope =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn delayed_schedule_parses_echo() {
        let mut envelope = Envelope::new("notifications", "send_email", json!({}));
        let due = Utc::now() + chrono::Duration::seconds(30);
        envelope.mark_delayed(due);

        match envelope.schedule() {
            Schedule::Delayed { due_at: Some(parsed) } => {
                // The echo has second resolution.
                assert!((parsed - due).num_seconds().abs() <= 1);
            }
            other => panic!("expected parsed delayed schedule, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_echo_still_reads_as_delayed() {
        let mut envelope = Envelope::new("notifications", "send_email", json!({}));
        envelope.delay_until = Some("not a timestamp".to_string());

        assert_eq!(envelope.schedule(), Schedule::Delayed { due_at: None });
    }
}
