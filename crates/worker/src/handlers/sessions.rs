//! Session queue: session bookkeeping writes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error};

use conveyor_core::Envelope;
use conveyor_queue::MessageHandler;

use super::record_id;

/// Session persistence port.
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn create(&self, data: &Value) -> anyhow::Result<()>;
    async fn update(&self, data: &Value) -> anyhow::Result<()>;
}

/// In-memory session sink for tests/dev.
#[derive(Debug, Default)]
pub struct MemorySessionSink {
    sessions: RwLock<HashMap<String, Value>>,
}

impl MemorySessionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.sessions.read().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().unwrap().is_empty()
    }
}

#[async_trait]
impl SessionSink for MemorySessionSink {
    async fn create(&self, data: &Value) -> anyhow::Result<()> {
        let id = record_id(data).unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        self.sessions.write().unwrap().insert(id, data.clone());
        Ok(())
    }

    async fn update(&self, data: &Value) -> anyhow::Result<()> {
        let id = record_id(data).ok_or_else(|| anyhow::anyhow!("session update without id"))?;
        let mut sessions = self.sessions.write().unwrap();
        match sessions.get_mut(&id) {
            Some(Value::Object(existing)) => {
                if let Value::Object(fields) = data {
                    for (key, value) in fields {
                        existing.insert(key.clone(), value.clone());
                    }
                }
            }
            // Upsert keeps updates idempotent under at-least-once delivery.
            _ => {
                debug!(id, "session update for unknown session; inserting");
                sessions.insert(id, data.clone());
            }
        }
        Ok(())
    }
}

/// Handler for the `sessions` queue.
#[derive(Clone)]
pub struct SessionHandler {
    sink: Arc<dyn SessionSink>,
}

impl SessionHandler {
    pub fn new(sink: Arc<dyn SessionSink>) -> Self {
        Self { sink }
    }

    /// Operations this handler serves.
    pub const OPERATIONS: [&'static str; 2] = ["create", "update"];
}

#[async_trait]
impl MessageHandler for SessionHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<bool> {
        match envelope.operation.as_str() {
            "create" => {
                self.sink.create(&envelope.data).await?;
                Ok(true)
            }
            "update" => {
                self.sink.update(&envelope.data).await?;
                Ok(true)
            }
            other => {
                error!(operation = other, "invalid session operation");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_then_update_merges_fields() {
        let sink = Arc::new(MemorySessionSink::new());
        let handler = SessionHandler::new(sink.clone());

        let envelope = Envelope::new(
            "sessions",
            "create",
            json!({"id": "s1", "user": "ada", "active": true}),
        );
        assert!(handler.handle(&envelope).await.unwrap());

        let envelope = Envelope::new("sessions", "update", json!({"id": "s1", "active": false}));
        assert!(handler.handle(&envelope).await.unwrap());

        let session = sink.get("s1").unwrap();
        assert_eq!(session["user"], "ada");
        assert_eq!(session["active"], false);
    }

    #[tokio::test]
    async fn update_without_id_errors() {
        let handler = SessionHandler::new(Arc::new(MemorySessionSink::new()));
        let envelope = Envelope::new("sessions", "update", json!({"active": false}));
        assert!(handler.handle(&envelope).await.is_err());
    }

    #[tokio::test]
    async fn unknown_operation_is_a_failure() {
        let handler = SessionHandler::new(Arc::new(MemorySessionSink::new()));
        let envelope = Envelope::new("sessions", "destroy", json!({"id": "s1"}));
        assert!(!handler.handle(&envelope).await.unwrap());
    }
}
