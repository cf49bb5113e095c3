//! Notification delivery workers.
//!
//! Workers consume the primary notification queues and deliver through the
//! configured providers:
//! - bounded prefetch per consumer
//! - retry by requeue with a typed attempt counter (`x-retry-count`)
//! - dead-letter queue for malformed messages and exhausted retries, retained
//!   unless the dead-letter monitor is enabled
//! - delivery status tracking (pending → sent → failed)

pub mod broker;
pub mod consumer;
pub mod dlq;
pub mod envelope;
pub mod message;
pub mod publisher;
pub mod sender;
pub mod settings;
pub mod status;
pub mod topology;
pub mod worker;

pub use broker::{BrokerError, InMemoryBroker, MessageBroker, RedisBroker};
pub use consumer::{ConsumerConfig, DeadLetterReason, Disposition, RetryConsumer};
pub use dlq::DeadLetterMonitor;
pub use envelope::RetryEnvelope;
pub use message::{Delivery, Headers, Message};
pub use publisher::{NotificationPublisher, PublishError};
pub use sender::{DeliveryError, LogSender, NotificationSender, ProtectedSender, WebhookSender};
pub use status::{MemoryStatusStore, RedisStatusStore, StatusStore};
pub use topology::DeadLetterTopology;
