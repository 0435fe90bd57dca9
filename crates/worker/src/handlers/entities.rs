//! Entity-replication queues: generic CRUD against a persistence port.
//!
//! Any configured queue without a dedicated handler replicates entity
//! writes: `insert` / `update` / `delete` by model name. A list-of-maps
//! payload is applied item by item; any failed item fails the whole
//! envelope, so the queue-level retry covers the batch (re-applied sibling
//! items are an accepted duplicate side effect under at-least-once
//! delivery).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error};

use conveyor_core::Envelope;
use conveyor_queue::MessageHandler;

use super::record_id;

/// Entity persistence port, keyed by model name.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn insert(&self, model: &str, data: &Value) -> anyhow::Result<()>;
    async fn update(&self, model: &str, data: &Value) -> anyhow::Result<()>;
    async fn delete(&self, model: &str, data: &Value) -> anyhow::Result<()>;
}

/// In-memory entity store for tests/dev.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    rows: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, model: &str, id: &str) -> Option<Value> {
        self.rows
            .read()
            .unwrap()
            .get(model)
            .and_then(|table| table.get(id))
            .cloned()
    }

    pub fn count(&self, model: &str) -> usize {
        self.rows
            .read()
            .unwrap()
            .get(model)
            .map_or(0, HashMap::len)
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn insert(&self, model: &str, data: &Value) -> anyhow::Result<()> {
        let id = record_id(data).unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        self.rows
            .write()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .insert(id, data.clone());
        Ok(())
    }

    async fn update(&self, model: &str, data: &Value) -> anyhow::Result<()> {
        let id = record_id(data).context("entity update without id")?;
        let mut rows = self.rows.write().unwrap();
        match rows.get_mut(model).and_then(|table| table.get_mut(&id)) {
            Some(Value::Object(existing)) => {
                if let Value::Object(fields) = data {
                    for (key, value) in fields {
                        existing.insert(key.clone(), value.clone());
                    }
                }
            }
            // Updating a missing row is a no-op, same as the upstream
            // writer skipping an already-deleted record.
            _ => debug!(model, id, "entity update for missing row; skipped"),
        }
        Ok(())
    }

    async fn delete(&self, model: &str, data: &Value) -> anyhow::Result<()> {
        let id = record_id(data).context("entity delete without id")?;
        let mut rows = self.rows.write().unwrap();
        if let Some(table) = rows.get_mut(model) {
            table.remove(&id);
        }
        Ok(())
    }
}

/// Fallback handler for entity-replication queues.
#[derive(Clone)]
pub struct EntityHandler {
    store: Arc<dyn EntityStore>,
}

impl EntityHandler {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    async fn apply(&self, model: &str, operation: &str, item: &Value) -> anyhow::Result<bool> {
        match operation {
            "insert" => {
                self.store.insert(model, item).await?;
                Ok(true)
            }
            "update" => {
                self.store.update(model, item).await?;
                Ok(true)
            }
            "delete" => {
                self.store.delete(model, item).await?;
                Ok(true)
            }
            other => {
                error!(model, operation = other, "invalid entity operation");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl MessageHandler for EntityHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<bool> {
        let model = envelope
            .model
            .as_deref()
            .context("entity envelope without model name")?;

        match &envelope.data {
            Value::Array(items) => {
                for item in items {
                    if !self.apply(model, &envelope.operation, item).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Value::Object(_) => self.apply(model, &envelope.operation, &envelope.data).await,
            _ => anyhow::bail!("entity payload must be a map or a list of maps"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handler() -> (Arc<MemoryEntityStore>, EntityHandler) {
        let store = Arc::new(MemoryEntityStore::new());
        (store.clone(), EntityHandler::new(store))
    }

    #[tokio::test]
    async fn insert_update_delete_round_trip() {
        let (store, handler) = handler();

        let envelope = Envelope::new("replica", "insert", json!({"id": 1, "name": "widget"}))
            .with_model("Product");
        assert!(handler.handle(&envelope).await.unwrap());
        assert_eq!(store.get("Product", "1").unwrap()["name"], "widget");

        let envelope = Envelope::new("replica", "update", json!({"id": 1, "name": "gadget"}))
            .with_model("Product");
        assert!(handler.handle(&envelope).await.unwrap());
        assert_eq!(store.get("Product", "1").unwrap()["name"], "gadget");

        let envelope =
            Envelope::new("replica", "delete", json!({"id": 1})).with_model("Product");
        assert!(handler.handle(&envelope).await.unwrap());
        assert!(store.get("Product", "1").is_none());
    }

    #[tokio::test]
    async fn list_payload_applies_every_item() {
        let (store, handler) = handler();

        let envelope = Envelope::new(
            "replica",
            "insert",
            json!([{"id": 1}, {"id": 2}, {"id": 3}]),
        )
        .with_model("Order");
        assert!(handler.handle(&envelope).await.unwrap());
        assert_eq!(store.count("Order"), 3);
    }

    #[tokio::test]
    async fn invalid_operation_in_a_list_fails_the_envelope() {
        let (store, handler) = handler();

        let envelope = Envelope::new("replica", "upsert", json!([{"id": 1}])).with_model("Order");
        assert!(!handler.handle(&envelope).await.unwrap());
        assert_eq!(store.count("Order"), 0);
    }

    #[tokio::test]
    async fn missing_model_errors() {
        let (_, handler) = handler();
        let envelope = Envelope::new("replica", "insert", json!({"id": 1}));
        assert!(handler.handle(&envelope).await.is_err());
    }
}
