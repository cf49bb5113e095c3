//! Broker message and delivery types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transport headers. Values are untyped; see [`crate::envelope`] for typed access.
pub type Headers = BTreeMap<String, serde_json::Value>;

/// Redelivery attempt counter.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
/// Why a message was dead-lettered (`rejected` or `maxlen`).
pub const DEATH_REASON_HEADER: &str = "x-death-reason";
/// Queue a dead-lettered message came from.
pub const DEATH_QUEUE_HEADER: &str = "x-death-queue";

/// A message as stored and routed by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    #[serde(default)]
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            headers: Headers::new(),
            body: body.into(),
        }
    }

    /// Serialize `value` as the JSON body of a new message.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    pub fn with_header(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Mark the message as dead-lettered from `queue`.
    pub(crate) fn mark_dead(&mut self, queue: &str, reason: &str) {
        self.headers
            .insert(DEATH_REASON_HEADER.to_string(), reason.into());
        self.headers
            .insert(DEATH_QUEUE_HEADER.to_string(), queue.into());
    }
}

/// A message handed to a consumer.
///
/// Settled by passing it by value to exactly one of `MessageBroker::ack` or
/// `MessageBroker::nack`. It is deliberately not `Clone`.
#[derive(Debug)]
pub struct Delivery {
    queue: String,
    message: Message,
    receipt: String,
}

impl Delivery {
    pub(crate) fn new(
        queue: impl Into<String>,
        message: Message,
        receipt: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            message,
            receipt: receipt.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn body(&self) -> &[u8] {
        &self.message.body
    }

    pub fn headers(&self) -> &Headers {
        &self.message.headers
    }

    /// Headers travel with the message if it is requeued or dead-lettered.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.message.headers
    }

    pub(crate) fn into_parts(self) -> (String, Message, String) {
        (self.queue, self.message, self.receipt)
    }
}
