//! Handler registration for the configured queues.
//!
//! Built once at process startup; the processor dispatches through the
//! table, so adding a queue never touches the core loop.

use std::sync::Arc;

use conveyor_queue::HandlerRegistry;

use crate::handlers::{
    ActivityLogHandler, ActivityLogSink, ChatHandler, ChatNotifier, EntityHandler, EntityStore,
    MemoryActivityLog, MemoryEntityStore, MemorySessionSink, NotificationHandler, SessionHandler,
    SessionSink, TracingMailer, TracingNotifier,
};
use crate::handlers::notifications::Mailer;

/// Queue names with dedicated handlers.
pub const NOTIFICATIONS_QUEUE: &str = "notifications";
pub const CHAT_QUEUE: &str = "chat";
pub const SESSIONS_QUEUE: &str = "sessions";
pub const ACTIVITY_LOGS_QUEUE: &str = "activity_logs";

/// The ports every handler is wired against.
///
/// Defaults are the logging/in-memory adapters; production wiring swaps in
/// real provider clients here without touching the handlers.
pub struct WorkerPorts {
    pub mailer: Arc<dyn Mailer>,
    pub chat: Arc<dyn ChatNotifier>,
    pub sessions: Arc<dyn SessionSink>,
    pub activity: Arc<dyn ActivityLogSink>,
    pub entities: Arc<dyn EntityStore>,
}

impl Default for WorkerPorts {
    fn default() -> Self {
        Self {
            mailer: Arc::new(TracingMailer),
            chat: Arc::new(TracingNotifier),
            sessions: Arc::new(MemorySessionSink::new()),
            activity: Arc::new(MemoryActivityLog::new()),
            entities: Arc::new(MemoryEntityStore::new()),
        }
    }
}

/// Build the registry for the configured queues.
///
/// Queues without a dedicated handler are treated as entity-replication
/// queues and get the [`EntityHandler`] for every operation.
pub fn build_registry(queue_names: &[String], ports: WorkerPorts) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    for queue in queue_names {
        match queue.as_str() {
            NOTIFICATIONS_QUEUE => {
                let handler = Arc::new(NotificationHandler::new(ports.mailer.clone()));
                for operation in NotificationHandler::OPERATIONS {
                    registry.register(queue, operation, handler.clone());
                }
            }
            CHAT_QUEUE => {
                registry.register_fallback(queue, Arc::new(ChatHandler::new(ports.chat.clone())));
            }
            SESSIONS_QUEUE => {
                let handler = Arc::new(SessionHandler::new(ports.sessions.clone()));
                for operation in SessionHandler::OPERATIONS {
                    registry.register(queue, operation, handler.clone());
                }
            }
            ACTIVITY_LOGS_QUEUE => {
                registry.register(
                    queue,
                    "create",
                    Arc::new(ActivityLogHandler::new(ports.activity.clone())),
                );
            }
            _ => {
                registry
                    .register_fallback(queue, Arc::new(EntityHandler::new(ports.entities.clone())));
            }
        }
    }

    registry
}
