//! Dead-letter queue monitor: logs every terminal failure, then acks it.
//!
//! Acking removes the dead letter, so the worker only runs the monitor when
//! `DLQ_MONITOR_ENABLED` is set. Otherwise dead letters stay queued for replay.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerError, MessageBroker};
use crate::message::{DEATH_QUEUE_HEADER, DEATH_REASON_HEADER, Message};

pub struct DeadLetterMonitor {
    broker: Arc<dyn MessageBroker>,
    queue: String,
    poll_interval: Duration,
}

impl DeadLetterMonitor {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        queue: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            broker,
            queue: queue.into(),
            poll_interval,
        }
    }

    /// Log and ack the next dead letter, returning it. `None` when empty.
    pub async fn inspect_next(&self) -> Result<Option<Message>, BrokerError> {
        let Some(delivery) = self.broker.receive(&self.queue).await? else {
            return Ok(None);
        };

        let message = delivery.message().clone();
        let header = |name: &str| {
            message
                .headers
                .get(name)
                .and_then(|value| value.as_str())
                .unwrap_or("unknown")
                .to_string()
        };

        tracing::warn!(
            queue = %self.queue,
            message_id = %message.id,
            reason = %header(DEATH_REASON_HEADER),
            source_queue = %header(DEATH_QUEUE_HEADER),
            headers = ?message.headers,
            body = %String::from_utf8_lossy(&message.body),
            "Dead letter received"
        );

        self.broker.ack(delivery).await?;
        Ok(Some(message))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(queue = %self.queue, "Dead-letter monitor started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let idle = match self.inspect_next().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(err) => {
                    tracing::error!(
                        queue = %self.queue,
                        error = %err,
                        "Failed to read dead-letter queue"
                    );
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        tracing::info!(queue = %self.queue, "Dead-letter monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ExchangeDecl, InMemoryBroker, QueueDecl};

    #[tokio::test]
    async fn test_inspect_acks_dead_letter() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_exchange(&ExchangeDecl::fanout("dlx")).await.unwrap();
        broker.declare_queue(&QueueDecl::durable("dlq")).await.unwrap();
        broker.bind_queue("dlq", "dlx", "").await.unwrap();
        broker
            .declare_queue(&QueueDecl::durable("work").with_dead_letter_exchange("dlx"))
            .await
            .unwrap();

        broker.publish("", "work", Message::new("boom")).await.unwrap();
        let delivery = broker.receive("work").await.unwrap().unwrap();
        broker.nack(delivery, false).await.unwrap();

        let monitor = DeadLetterMonitor::new(broker.clone(), "dlq", Duration::from_millis(10));
        let dead = monitor.inspect_next().await.unwrap().unwrap();
        assert_eq!(dead.body, b"boom");
        assert_eq!(dead.headers[DEATH_QUEUE_HEADER], "work");
        assert_eq!(broker.unacked_len("dlq"), 0);
        assert!(monitor.inspect_next().await.unwrap().is_none());
    }
}
