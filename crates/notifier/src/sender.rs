//! Notification providers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use herald_common::types::NotificationMessage;
use herald_resilience::{CallError, ProtectedCaller};

/// A failed delivery. Provider failures are retried through the queue up to
/// the consumer's retry limit; circuit rejections are requeued without
/// counting as an attempt.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("provider {provider} rejected notification with HTTP {status}")]
    Rejected { provider: String, status: u16 },

    #[error("provider {provider} unreachable: {source}")]
    Transport {
        provider: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("provider {provider} is unavailable (circuit breaker open)")]
    CircuitOpen { provider: String },

    #[error("provider {provider} is recovering, try again later")]
    Recovering { provider: String },
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Provider name, used in logs and as the circuit breaker key.
    fn name(&self) -> &str;

    async fn send(&self, notification: &NotificationMessage) -> Result<(), DeliveryError>;
}

/// Simulated delivery: logs the notification and succeeds.
pub struct LogSender {
    name: String,
}

impl LogSender {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl NotificationSender for LogSender {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &NotificationMessage) -> Result<(), DeliveryError> {
        tracing::info!(
            provider = %self.name,
            notification_id = %notification.notification_id,
            user_id = %notification.user_id,
            channel = %notification.channel,
            title = %notification.title,
            "Delivered notification"
        );
        Ok(())
    }
}

/// Delivers by POSTing the notification JSON to a provider endpoint.
pub struct WebhookSender {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookSender {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl NotificationSender for WebhookSender {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &NotificationMessage) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|source| DeliveryError::Transport {
                provider: self.name.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Rejected {
                provider: self.name.clone(),
                status: status.as_u16(),
            });
        }

        tracing::debug!(
            provider = %self.name,
            notification_id = %notification.notification_id,
            status = status.as_u16(),
            "Provider accepted notification"
        );
        Ok(())
    }
}

/// Runs another sender under the circuit breaker named after it, so a failing
/// provider is skipped quickly and its messages go back through the queue.
pub struct ProtectedSender {
    inner: Arc<dyn NotificationSender>,
    caller: ProtectedCaller,
}

impl ProtectedSender {
    pub fn new(inner: Arc<dyn NotificationSender>, caller: ProtectedCaller) -> Self {
        Self { inner, caller }
    }
}

#[async_trait]
impl NotificationSender for ProtectedSender {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send(&self, notification: &NotificationMessage) -> Result<(), DeliveryError> {
        self.caller
            .execute(self.inner.name(), || self.inner.send(notification))
            .await
            .map_err(|err| match err {
                CallError::Unavailable { dependency } => DeliveryError::CircuitOpen {
                    provider: dependency,
                },
                CallError::Recovering { dependency } => DeliveryError::Recovering {
                    provider: dependency,
                },
                CallError::Underlying(err) => err,
            })
    }
}
