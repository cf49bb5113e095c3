//! Dead-letter topology for the notification queues.

use herald_common::types::ChannelType;

use crate::broker::{BrokerError, ExchangeDecl, MessageBroker, QueueDecl};

pub const NOTIFICATIONS_EXCHANGE: &str = "notifications.direct";
pub const DEAD_LETTER_EXCHANGE: &str = "dlx.exchange";
pub const DEAD_LETTER_QUEUE: &str = "dead.letter.queue";
pub const DEFAULT_MAX_LENGTH: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryQueue {
    pub name: String,
    pub routing_key: String,
}

/// One fanout dead-letter exchange feeding one durable dead-letter queue, and
/// bounded primary queues that all dead-letter into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTopology {
    pub exchange: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    pub queues: Vec<PrimaryQueue>,
    pub max_length: usize,
}

impl DeadLetterTopology {
    /// `email.queue` and `push.queue` on `notifications.direct`.
    pub fn notifications(max_length: usize) -> Self {
        Self {
            exchange: NOTIFICATIONS_EXCHANGE.to_string(),
            dead_letter_exchange: DEAD_LETTER_EXCHANGE.to_string(),
            dead_letter_queue: DEAD_LETTER_QUEUE.to_string(),
            queues: ChannelType::ALL
                .iter()
                .map(|channel| PrimaryQueue {
                    name: channel.queue_name().to_string(),
                    routing_key: channel.routing_key().to_string(),
                })
                .collect(),
            max_length,
        }
    }

    pub fn primary_queue_decl(&self, queue: &PrimaryQueue) -> QueueDecl {
        QueueDecl::durable(&queue.name)
            .with_dead_letter_exchange(&self.dead_letter_exchange)
            .with_max_length(self.max_length)
    }

    /// Declare everything. Safe to call from every process at startup.
    pub async fn declare(&self, broker: &dyn MessageBroker) -> Result<(), BrokerError> {
        broker
            .declare_exchange(&ExchangeDecl::fanout(&self.dead_letter_exchange))
            .await?;
        broker
            .declare_queue(&QueueDecl::durable(&self.dead_letter_queue))
            .await?;
        broker
            .bind_queue(&self.dead_letter_queue, &self.dead_letter_exchange, "")
            .await?;

        broker
            .declare_exchange(&ExchangeDecl::direct(&self.exchange))
            .await?;
        for queue in &self.queues {
            broker.declare_queue(&self.primary_queue_decl(queue)).await?;
            broker
                .bind_queue(&queue.name, &self.exchange, &queue.routing_key)
                .await?;
        }

        tracing::info!(
            exchange = %self.exchange,
            dead_letter_queue = %self.dead_letter_queue,
            queues = self.queues.len(),
            max_length = self.max_length,
            "Declared notification topology"
        );
        Ok(())
    }
}

impl Default for DeadLetterTopology {
    fn default() -> Self {
        Self::notifications(DEFAULT_MAX_LENGTH)
    }
}
