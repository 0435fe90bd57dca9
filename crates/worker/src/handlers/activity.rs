//! Activity-log queue: append-only audit writes.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use tracing::error;

use conveyor_core::Envelope;
use conveyor_queue::MessageHandler;

/// Audit-log persistence port.
#[async_trait]
pub trait ActivityLogSink: Send + Sync {
    async fn record(&self, data: &Value) -> anyhow::Result<()>;
}

/// In-memory audit log for tests/dev.
#[derive(Debug, Default)]
pub struct MemoryActivityLog {
    entries: RwLock<Vec<Value>>,
}

impl MemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

#[async_trait]
impl ActivityLogSink for MemoryActivityLog {
    async fn record(&self, data: &Value) -> anyhow::Result<()> {
        self.entries.write().unwrap().push(data.clone());
        Ok(())
    }
}

/// Handler for the `activity_logs` queue.
#[derive(Clone)]
pub struct ActivityLogHandler {
    sink: Arc<dyn ActivityLogSink>,
}

impl ActivityLogHandler {
    pub fn new(sink: Arc<dyn ActivityLogSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl MessageHandler for ActivityLogHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<bool> {
        match envelope.operation.as_str() {
            "create" => {
                self.sink.record(&envelope.data).await?;
                Ok(true)
            }
            other => {
                error!(operation = other, "invalid activity log operation");
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
    async fn create_appends_an_entry() {
        let sink = Arc::new(MemoryActivityLog::new());
        let handler = ActivityLogHandler::new(sink.clone());

        let envelope = Envelope::new(
            "activity_logs",
            "create",
            json!({"actor": "ada", "action": "login"}),
        );
        assert!(handler.handle(&envelope).await.unwrap());
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn only_create_is_accepted() {
        let handler = ActivityLogHandler::new(Arc::new(MemoryActivityLog::new()));
        let envelope = Envelope::new("activity_logs", "delete", json!({}));
        assert!(!handler.handle(&envelope).await.unwrap());
    }
}
