//! Per-queue message handlers and the ports they call through.

pub mod activity;
pub mod chat;
pub mod entities;
pub mod notifications;
pub mod sessions;

pub use activity::{ActivityLogHandler, ActivityLogSink, MemoryActivityLog};
pub use chat::{ChatHandler, ChatNotifier, TracingNotifier};
pub use entities::{EntityHandler, EntityStore, MemoryEntityStore};
pub use notifications::{Mailer, NotificationHandler, TracingMailer};
pub use sessions::{MemorySessionSink, SessionHandler, SessionSink};

/// Extract a record id from a payload map (`"id"` as string or number).
pub(crate) fn record_id(data: &serde_json::Value) -> Option<String> {
    match data.get("id") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}
