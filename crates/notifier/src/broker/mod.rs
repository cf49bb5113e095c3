//! Message broker abstraction.
//!
//! Exchanges route published messages to bound queues (direct by routing key,
//! or fanout to every binding). Queues may name a dead-letter exchange and a
//! maximum length. Consumers pull deliveries and settle each one exactly once.

mod memory;
mod redis_broker;
mod routing;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::{Delivery, Message};

pub use memory::InMemoryBroker;
pub use redis_broker::RedisBroker;
pub use routing::{ExchangeDecl, ExchangeKind, QueueDecl};

/// Death reason for messages rejected without requeue.
pub const REASON_REJECTED: &str = "rejected";
/// Death reason for messages dropped from the head of a full queue.
pub const REASON_MAXLEN: &str = "maxlen";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("exchange '{0}' is not declared")]
    UnknownExchange(String),

    #[error("queue '{0}' is not declared")]
    UnknownQueue(String),

    #[error("'{0}' is already declared with different arguments")]
    PreconditionFailed(String),

    #[error("delivery {0} is not outstanding")]
    UnknownDelivery(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Idempotent. Fails if `exchange` exists with a different kind.
    async fn declare_exchange(&self, exchange: &ExchangeDecl) -> Result<(), BrokerError>;

    /// Idempotent. Fails if `queue` exists with different arguments.
    async fn declare_queue(&self, queue: &QueueDecl) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Route `message` through `exchange`. The empty exchange name routes
    /// straight to the queue named by `routing_key`. Unroutable messages are
    /// dropped.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), BrokerError>;

    /// Take the next ready message from `queue` without blocking.
    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, delivery: Delivery) -> Result<(), BrokerError>;

    /// Requeue at the tail of the queue, or dead-letter when `requeue` is
    /// false. The delivery's current headers travel with the message.
    async fn nack(&self, delivery: Delivery, requeue: bool) -> Result<(), BrokerError>;
}
