use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::routing::RoutingTable;
use super::{BrokerError, ExchangeDecl, MessageBroker, QueueDecl, REASON_MAXLEN, REASON_REJECTED};
use crate::message::{Delivery, Message};

/// Process-local broker with the same routing and dead-letter semantics as
/// [`super::RedisBroker`]. Used by tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    routing: RoutingTable,
    queues: HashMap<String, QueueBuffer>,
    next_tag: u64,
}

#[derive(Debug, Default)]
struct QueueBuffer {
    ready: VecDeque<Message>,
    /// Outstanding deliveries by receipt.
    unacked: HashMap<String, Message>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting in `queue`, oldest first.
    pub fn peek(&self, queue: &str) -> Vec<Message> {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|buffer| buffer.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn ready_len(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |buffer| buffer.ready.len())
    }

    /// Deliveries handed out from `queue` and not yet settled.
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, |buffer| buffer.unacked.len())
    }
}

impl MemoryState {
    /// Append each message to its queue, dead-lettering anything that
    /// overflows `max_length` from the head.
    fn enqueue(&mut self, initial: Vec<(String, Message)>) {
        let mut pending = initial;

        while let Some((queue, message)) = pending.pop() {
            let Ok(decl) = self.routing.queue(&queue) else {
                continue;
            };
            let decl = decl.clone();
            let buffer = self.queues.entry(queue).or_default();
            buffer.ready.push_back(message);

            let mut dropped = Vec::new();
            if let Some(max_length) = decl.max_length {
                while buffer.ready.len() > max_length {
                    if let Some(oldest) = buffer.ready.pop_front() {
                        dropped.push(oldest);
                    }
                }
            }

            for message in dropped {
                tracing::warn!(
                    queue = %decl.name,
                    message_id = %message.id,
                    "Queue full, dead-lettering oldest message"
                );
                pending.extend(self.routing.dead_letter(&decl, message, REASON_MAXLEN));
            }
        }
    }

    fn take_unacked(&mut self, queue: &str, receipt: &str) -> Result<(), BrokerError> {
        self.queues
            .get_mut(queue)
            .and_then(|buffer| buffer.unacked.remove(receipt))
            .map(|_| ())
            .ok_or_else(|| BrokerError::UnknownDelivery(receipt.to_string()))
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn declare_exchange(&self, exchange: &ExchangeDecl) -> Result<(), BrokerError> {
        self.inner.lock().routing.declare_exchange(exchange)
    }

    async fn declare_queue(&self, queue: &QueueDecl) -> Result<(), BrokerError> {
        let mut state = self.inner.lock();
        state.routing.declare_queue(queue)?;
        state.queues.entry(queue.name.clone()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.inner.lock().routing.bind(queue, exchange, routing_key)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), BrokerError> {
        let mut state = self.inner.lock();
        let targets = state.routing.route(exchange, routing_key)?;
        if targets.is_empty() {
            tracing::warn!(
                exchange,
                routing_key,
                message_id = %message.id,
                "Dropping unroutable message"
            );
            return Ok(());
        }
        let batch = targets
            .into_iter()
            .map(|queue| (queue, message.clone()))
            .collect();
        state.enqueue(batch);
        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut state = self.inner.lock();
        state.routing.queue(queue)?;

        state.next_tag += 1;
        let receipt = state.next_tag.to_string();
        let buffer = state.queues.entry(queue.to_string()).or_default();

        let Some(message) = buffer.ready.pop_front() else {
            return Ok(None);
        };
        buffer.unacked.insert(receipt.clone(), message.clone());
        Ok(Some(Delivery::new(queue, message, receipt)))
    }

    async fn ack(&self, delivery: Delivery) -> Result<(), BrokerError> {
        let (queue, _, receipt) = delivery.into_parts();
        self.inner.lock().take_unacked(&queue, &receipt)
    }

    async fn nack(&self, delivery: Delivery, requeue: bool) -> Result<(), BrokerError> {
        let (queue, message, receipt) = delivery.into_parts();
        let mut state = self.inner.lock();
        state.take_unacked(&queue, &receipt)?;

        if requeue {
            // Requeues count against max_length like any other enqueue.
            state.enqueue(vec![(queue, message)]);
        } else {
            let decl = state.routing.queue(&queue)?.clone();
            let targets = state.routing.dead_letter(&decl, message, REASON_REJECTED);
            state.enqueue(targets);
        }
        Ok(())
    }
}
