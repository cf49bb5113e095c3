//! Gateway-side publishing of notification requests.

use std::sync::Arc;

use thiserror::Error;

use herald_common::error::AppError;
use herald_common::types::{DeliveryStatus, NotificationMessage, NotificationRequest};
use herald_resilience::{CallError, ProtectedCaller};

use crate::broker::{BrokerError, MessageBroker};
use crate::message::Message;
use crate::status::StatusStore;
use crate::topology::NOTIFICATIONS_EXCHANGE;

/// Circuit breaker key for the message broker.
pub const BROKER_DEPENDENCY: &str = "broker";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("missing required fields: {}", .0.join(", "))]
    Invalid(Vec<&'static str>),

    #[error(transparent)]
    Rejected(CallError<BrokerError>),

    #[error("Broker error: {0}")]
    Broker(BrokerError),

    #[error("Serialization error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<CallError<BrokerError>> for PublishError {
    fn from(err: CallError<BrokerError>) -> Self {
        match err {
            CallError::Underlying(err) => PublishError::Broker(err),
            rejected => PublishError::Rejected(rejected),
        }
    }
}

impl From<PublishError> for AppError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::Invalid(_) => AppError::Validation(err.to_string()),
            PublishError::Rejected(_) => AppError::ServiceUnavailable(err.to_string()),
            PublishError::Broker(err) => AppError::Broker(err.to_string()),
            PublishError::Encode(err) => AppError::Internal(err.to_string()),
        }
    }
}

pub struct NotificationPublisher {
    broker: Arc<dyn MessageBroker>,
    caller: ProtectedCaller,
    status: Arc<dyn StatusStore>,
    exchange: String,
}

impl NotificationPublisher {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        caller: ProtectedCaller,
        status: Arc<dyn StatusStore>,
    ) -> Self {
        Self {
            broker,
            caller,
            status,
            exchange: NOTIFICATIONS_EXCHANGE.to_string(),
        }
    }

    pub fn caller(&self) -> &ProtectedCaller {
        &self.caller
    }

    pub fn status_store(&self) -> &Arc<dyn StatusStore> {
        &self.status
    }

    /// Validate, assign an id, record `pending` and publish through the
    /// broker's circuit breaker.
    pub async fn publish(
        &self,
        request: NotificationRequest,
    ) -> Result<NotificationMessage, PublishError> {
        let missing = request.missing_fields();
        if !missing.is_empty() {
            return Err(PublishError::Invalid(missing));
        }

        let notification = NotificationMessage::from_request(request);
        let message = Message::json(&notification)?;
        let id = notification.notification_id;
        let routing_key = notification.channel.routing_key();

        self.record(id, DeliveryStatus::Pending, None).await;

        let broker = &self.broker;
        let exchange = self.exchange.as_str();
        let published = self
            .caller
            .execute(BROKER_DEPENDENCY, move || {
                broker.publish(exchange, routing_key, message)
            })
            .await;

        if let Err(err) = published {
            let err = PublishError::from(err);
            tracing::warn!(notification_id = %id, error = %err, "Failed to publish notification");
            self.record(id, DeliveryStatus::Failed, Some(err.to_string()))
                .await;
            return Err(err);
        }

        tracing::info!(
            notification_id = %id,
            channel = %notification.channel,
            user_id = %notification.user_id,
            "Notification queued"
        );
        Ok(notification)
    }

    async fn record(&self, id: uuid::Uuid, status: DeliveryStatus, detail: Option<String>) {
        if let Err(err) = self.status.record(id, status, detail).await {
            tracing::warn!(notification_id = %id, error = %err, "Failed to record delivery status");
        }
    }
}
