//! Message handler dispatch.
//!
//! Handlers are external collaborators: surrounding business logic registers
//! one per `(queue, operation)` at process startup, and the processor
//! dispatches through the table. No queue is special-cased in the core loop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use conveyor_core::Envelope;

/// A per-queue, per-operation message handler.
///
/// `Ok(true)` acknowledges the entry. `Ok(false)` and `Err(_)` are treated
/// identically: the envelope is handed to the poison router. Handlers run
/// under at-least-once delivery and must tolerate duplicate invocations.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<bool>;
}

/// Registration table keyed by `(queue, operation)`.
///
/// Lookup tries the exact operation first, then the queue's `"*"` fallback,
/// so a queue can register one handler for every operation it carries.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Arc<dyn MessageHandler>>,
}

/// Operation wildcard for per-queue fallback handlers.
pub const ANY_OPERATION: &str = "*";

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one operation of a queue.
    pub fn register(
        &mut self,
        queue: impl Into<String>,
        operation: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) {
        self.handlers
            .insert((queue.into(), operation.into()), handler);
    }

    /// Register a handler for every operation of a queue.
    pub fn register_fallback(&mut self, queue: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.register(queue, ANY_OPERATION, handler);
    }

    /// Resolve the handler for an envelope destination.
    pub fn get(&self, queue: &str, operation: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .get(&(queue.to_string(), operation.to_string()))
            .or_else(|| {
                self.handlers
                    .get(&(queue.to_string(), ANY_OPERATION.to_string()))
            })
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &keys)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct AlwaysOk;

    #[async_trait]
    impl MessageHandler for AlwaysOk {
        async fn handle(&self, _envelope: &Envelope) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    #[test]
    fn exact_match_wins_over_fallback() {
        let exact: Arc<dyn MessageHandler> = Arc::new(AlwaysOk);
        let fallback: Arc<dyn MessageHandler> = Arc::new(AlwaysOk);

        let mut registry = HandlerRegistry::new();
        registry.register("notifications", "send_email", exact.clone());
        registry.register_fallback("notifications", fallback.clone());

        let found = registry.get("notifications", "send_email").unwrap();
        assert!(Arc::ptr_eq(&found, &exact));

        let found = registry.get("notifications", "welcome_email").unwrap();
        assert!(Arc::ptr_eq(&found, &fallback));
    }

    #[test]
    fn unknown_destination_resolves_to_none() {
        let mut registry = HandlerRegistry::new();
        registry.register("sessions", "create", Arc::new(AlwaysOk));

        assert!(registry.get("sessions", "drop").is_none());
        assert!(registry.get("other", "create").is_none());
    }

    #[tokio::test]
    async fn handlers_are_invocable_through_the_table() {
        let mut registry = HandlerRegistry::new();
        registry.register("sessions", "create", Arc::new(AlwaysOk));

        let envelope = Envelope::new("sessions", "create", json!({"id": "s1"}));
        let handler = registry.get("sessions", "create").unwrap();
        assert!(handler.handle(&envelope).await.unwrap());
    }
}
