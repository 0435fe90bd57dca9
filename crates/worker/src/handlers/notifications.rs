//! Notification queue: outbound email.
//!
//! The `notifications` queue carries three operations, one per email
//! variant. Delivery goes through the [`Mailer`] port; the SMTP/provider
//! client behind it lives outside this crate.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info};

use conveyor_core::Envelope;
use conveyor_queue::MessageHandler;

/// Optional routing lists shared by every email variant.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmailRouting {
    #[serde(default)]
    pub cc: Option<Vec<String>>,
    #[serde(default)]
    pub bcc: Option<Vec<String>>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// `send_email` payload: plain content with a salutation.
#[derive(Debug, Clone, Deserialize)]
pub struct SendEmail {
    pub to: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub salutation: Option<String>,
    pub body: String,
    #[serde(flatten)]
    pub routing: EmailRouting,
}

/// `welcome_email` payload: template keyed by recipient name.
#[derive(Debug, Clone, Deserialize)]
pub struct WelcomeEmail {
    pub name: String,
    pub email: String,
    #[serde(flatten)]
    pub routing: EmailRouting,
}

/// `send_typed_email` payload: pre-rendered HTML body.
#[derive(Debug, Clone, Deserialize)]
pub struct TypedEmail {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(flatten)]
    pub routing: EmailRouting,
}

/// Outbound mail port.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_email(&self, message: &SendEmail) -> anyhow::Result<()>;
    async fn send_welcome_email(&self, message: &WelcomeEmail) -> anyhow::Result<()>;
    async fn send_typed_email(&self, message: &TypedEmail) -> anyhow::Result<()>;
}

/// Logs the send instead of talking to a provider.
#[derive(Debug, Default)]
pub struct TracingMailer;

#[async_trait]
impl Mailer for TracingMailer {
    async fn send_email(&self, message: &SendEmail) -> anyhow::Result<()> {
        info!(to = ?message.to, subject = %message.subject, "send_email");
        Ok(())
    }

    async fn send_welcome_email(&self, message: &WelcomeEmail) -> anyhow::Result<()> {
        info!(name = %message.name, email = %message.email, "welcome_email");
        Ok(())
    }

    async fn send_typed_email(&self, message: &TypedEmail) -> anyhow::Result<()> {
        info!(to = ?message.to, subject = %message.subject, "send_typed_email");
        Ok(())
    }
}

/// Handler for the `notifications` queue.
#[derive(Clone)]
pub struct NotificationHandler {
    mailer: Arc<dyn Mailer>,
}

impl NotificationHandler {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }

    /// Operations this handler serves.
    pub const OPERATIONS: [&'static str; 3] = ["send_email", "welcome_email", "send_typed_email"];
}

#[async_trait]
impl MessageHandler for NotificationHandler {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<bool> {
        match envelope.operation.as_str() {
            "send_email" => {
                let message: SendEmail = serde_json::from_value(envelope.data.clone())
                    .context("malformed send_email payload")?;
                self.mailer.send_email(&message).await?;
                Ok(true)
            }
            "welcome_email" => {
                let message: WelcomeEmail = serde_json::from_value(envelope.data.clone())
                    .context("malformed welcome_email payload")?;
                self.mailer.send_welcome_email(&message).await?;
                Ok(true)
            }
            "send_typed_email" => {
                let message: TypedEmail = serde_json::from_value(envelope.data.clone())
                    .context("malformed send_typed_email payload")?;
                self.mailer.send_typed_email(&message).await?;
                Ok(true)
            }
            other => {
                error!(operation = other, "invalid notification operation");
                Ok(false)
            }
        }
    }
}
