//! Chat queue: short operational notifications.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

use conveyor_core::Envelope;
use conveyor_queue::MessageHandler;

/// Outbound chat port (Telegram, Slack, ... behind it).
#[async_trait]
pub trait ChatNotifier: Send + Sync {
    async fn send(&self, text: &str) -> anyhow::Result<()>;
}

/// Logs the notification instead of talking to a provider.
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl ChatNotifier for TracingNotifier {
    async fn send(&self, text: &str) -> anyhow::Result<()> {
        info!(text, "chat notification");
        Ok(())
    }
}

/// Handler for the `chat` queue; every operation carries a `message` field.
#[derive(Clone)]
pub struct ChatHandler {
    notifier: Arc<dyn ChatNotifier>,
}

impl ChatHandler {
    pub fn new(notifier: Arc<dyn ChatNotifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl MessageHandler for ChatHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<bool> {
        let text = envelope
            .data
            .get("message")
            .and_then(|v| v.as_str())
            .context("chat payload missing message text")?;
        self.notifier.send(text).await?;
        Ok(true)
    }
}
