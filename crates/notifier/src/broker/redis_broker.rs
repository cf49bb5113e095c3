use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::Script;

use super::routing::RoutingTable;
use super::{BrokerError, ExchangeDecl, MessageBroker, QueueDecl, REASON_MAXLEN, REASON_REJECTED};
use crate::message::{Delivery, Message};

/// Push onto the head of the ready list and, past `ARGV[2]` entries, pop the
/// oldest from the tail. Returns the dropped payload or nil.
const ENQUEUE_SCRIPT: &str = r"
redis.call('LPUSH', KEYS[1], ARGV[1])
local max = tonumber(ARGV[2])
if max >= 0 and redis.call('LLEN', KEYS[1]) > max then
    return redis.call('RPOP', KEYS[1])
end
return false
";

/// Remove one receipt from the processing list (`KEYS[1]`) and, only if it
/// was there, push `ARGV[2]` onto every other key. Returns 1 on success.
const SETTLE_SCRIPT: &str = r"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
    return 0
end
for i = 2, #KEYS do
    redis.call('LPUSH', KEYS[i], ARGV[2])
end
return 1
";

/// Move a receipt from the processing list (`KEYS[1]`) back onto the ready
/// list (`KEYS[2]`), applying the same `ARGV[3]` cap as [`ENQUEUE_SCRIPT`].
/// Returns 0 for an unknown receipt, the dropped payload on overflow, else 1.
const REQUEUE_SCRIPT: &str = r"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
    return 0
end
redis.call('LPUSH', KEYS[2], ARGV[2])
local max = tonumber(ARGV[3])
if max >= 0 and redis.call('LLEN', KEYS[2]) > max then
    return redis.call('RPOP', KEYS[2])
end
return 1
";

/// Reliable-queue broker on Redis lists.
///
/// Each queue is a ready list (`{prefix}:queue:{name}`) consumed from the
/// tail and a processing list (`…:unacked`) holding delivered, unsettled
/// messages. Routing declarations live in the process; every process that
/// publishes or consumes declares the same topology at startup.
pub struct RedisBroker {
    redis: ConnectionManager,
    routing: RwLock<RoutingTable>,
    prefix: String,
    enqueue_script: Script,
    settle_script: Script,
    requeue_script: Script,
}

impl RedisBroker {
    pub fn new(redis: ConnectionManager) -> Self {
        Self::with_prefix(redis, "herald")
    }

    pub fn with_prefix(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            routing: RwLock::new(RoutingTable::default()),
            prefix: prefix.into(),
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            settle_script: Script::new(SETTLE_SCRIPT),
            requeue_script: Script::new(REQUEUE_SCRIPT),
        }
    }

    fn ready_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    fn unacked_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:unacked", self.prefix, queue)
    }

    fn queue_decl(&self, queue: &str) -> Result<QueueDecl, BrokerError> {
        self.routing.read().queue(queue).cloned()
    }

    /// Enqueue each message, following overflow into dead-letter queues.
    async fn enqueue(&self, initial: Vec<(String, Message)>) -> Result<(), BrokerError> {
        let mut pending = initial;
        let mut conn = self.redis.clone();

        while let Some((queue, message)) = pending.pop() {
            let decl = self.queue_decl(&queue)?;
            let payload = serde_json::to_string(&message)?;

            let dropped: Option<String> = self
                .enqueue_script
                .key(self.ready_key(&queue))
                .arg(payload)
                .arg(max_length_arg(&decl))
                .invoke_async(&mut conn)
                .await?;

            if let Some(raw) = dropped {
                pending.extend(self.overflow(&decl, &raw));
            }
        }
        Ok(())
    }

    /// Dead-letter targets for a message pushed out of a full queue.
    fn overflow(&self, decl: &QueueDecl, raw: &str) -> Vec<(String, Message)> {
        let oldest = decode_record(raw);
        tracing::warn!(
            queue = %decl.name,
            message_id = %oldest.id,
            "Queue full, dead-lettering oldest message"
        );
        self.routing.read().dead_letter(decl, oldest, REASON_MAXLEN)
    }

    /// Put an unsettled delivery back on its ready list, honouring `max_length`.
    async fn requeue(
        &self,
        queue: &str,
        receipt: &str,
        message: &Message,
    ) -> Result<(), BrokerError> {
        let decl = self.queue_decl(queue)?;
        let payload = serde_json::to_string(message)?;

        let mut conn = self.redis.clone();
        let reply: redis::Value = self
            .requeue_script
            .key(self.unacked_key(queue))
            .key(self.ready_key(queue))
            .arg(receipt)
            .arg(payload)
            .arg(max_length_arg(&decl))
            .invoke_async(&mut conn)
            .await?;

        match reply {
            redis::Value::Int(0) => Err(BrokerError::UnknownDelivery(receipt.to_string())),
            redis::Value::BulkString(raw) => {
                let targets = self.overflow(&decl, &String::from_utf8_lossy(&raw));
                self.enqueue(targets).await
            }
            _ => Ok(()),
        }
    }

    /// Atomically drop `receipt` from the processing list and push `message`
    /// to `targets`.
    async fn settle(
        &self,
        queue: &str,
        receipt: &str,
        message: Option<&Message>,
        targets: &[String],
    ) -> Result<(), BrokerError> {
        let payload = match message {
            Some(message) => serde_json::to_string(message)?,
            None => String::new(),
        };

        let mut invocation = self.settle_script.prepare_invoke();
        invocation.key(self.unacked_key(queue));
        for target in targets {
            invocation.key(self.ready_key(target));
        }
        invocation.arg(receipt).arg(payload);

        let mut conn = self.redis.clone();
        let settled: i64 = invocation.invoke_async(&mut conn).await?;
        if settled == 0 {
            return Err(BrokerError::UnknownDelivery(receipt.to_string()));
        }
        Ok(())
    }
}

fn max_length_arg(decl: &QueueDecl) -> i64 {
    decl.max_length.map_or(-1, |max| max as i64)
}

/// Records that no longer parse still get delivered, carrying the raw bytes,
/// so the consumer rejects them into the dead-letter queue.
fn decode_record(raw: &str) -> Message {
    serde_json::from_str(raw).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "Unreadable queue record, delivering raw payload");
        Message::new(raw.as_bytes())
    })
}

#[async_trait]
impl MessageBroker for RedisBroker {
    async fn declare_exchange(&self, exchange: &ExchangeDecl) -> Result<(), BrokerError> {
        self.routing.write().declare_exchange(exchange)
    }

    async fn declare_queue(&self, queue: &QueueDecl) -> Result<(), BrokerError> {
        self.routing.write().declare_queue(queue).map(|_| ())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.routing.write().bind(queue, exchange, routing_key)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), BrokerError> {
        let targets = self.routing.read().route(exchange, routing_key)?;
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
        self.enqueue(batch).await
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        self.queue_decl(queue)?;

        let mut conn = self.redis.clone();
        let raw: Option<String> = redis::cmd("LMOVE")
            .arg(self.ready_key(queue))
            .arg(self.unacked_key(queue))
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(&mut conn)
            .await?;

        Ok(raw.map(|raw| Delivery::new(queue, decode_record(&raw), raw)))
    }

    async fn ack(&self, delivery: Delivery) -> Result<(), BrokerError> {
        let (queue, _, receipt) = delivery.into_parts();
        self.settle(&queue, &receipt, None, &[]).await
    }

    async fn nack(&self, delivery: Delivery, requeue: bool) -> Result<(), BrokerError> {
        let (queue, message, receipt) = delivery.into_parts();

        if requeue {
            return self.requeue(&queue, &receipt, &message).await;
        }

        let decl = self.queue_decl(&queue)?;
        let targets = self
            .routing
            .read()
            .dead_letter(&decl, message, REASON_REJECTED);

        // Every target receives the same stamped message.
        let message = targets.first().map(|(_, message)| message.clone());
        let queues: Vec<String> = targets.into_iter().map(|(queue, _)| queue).collect();
        self.settle(&queue, &receipt, message.as_ref(), &queues).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::redis_pool::create_redis_pool;

    #[test]
    fn test_unreadable_record_keeps_raw_bytes() {
        let message = decode_record("not json");
        assert_eq!(message.body, b"not json");
        assert!(message.headers.is_empty());
    }

    #[test]
    fn test_record_decodes() {
        let original = Message::new("hello").with_header("x-retry-count", 2);
        let raw = serde_json::to_string(&original).unwrap();
        assert_eq!(decode_record(&raw), original);
    }

    async fn broker() -> RedisBroker {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let redis = create_redis_pool(&url).await.unwrap();
        let prefix = format!("herald-test-{}", uuid::Uuid::new_v4());
        let broker = RedisBroker::with_prefix(redis, prefix);
        broker.declare_exchange(&ExchangeDecl::fanout("dlx")).await.unwrap();
        broker.declare_queue(&QueueDecl::durable("dlq")).await.unwrap();
        broker.bind_queue("dlq", "dlx", "").await.unwrap();
        broker.declare_exchange(&ExchangeDecl::direct("direct")).await.unwrap();
        broker
            .declare_queue(
                &QueueDecl::durable("work")
                    .with_dead_letter_exchange("dlx")
                    .with_max_length(2),
            )
            .await
            .unwrap();
        broker.bind_queue("work", "direct", "job").await.unwrap();
        broker
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_requeue_then_dead_letter() {
        let broker = broker().await;
        let message = Message::new("payload");
        broker.publish("direct", "job", message.clone()).await.unwrap();

        let mut delivery = broker.receive("work").await.unwrap().unwrap();
        assert_eq!(delivery.message(), &message);
        delivery.headers_mut().insert("x-retry-count".into(), 1.into());
        broker.nack(delivery, true).await.unwrap();

        let delivery = broker.receive("work").await.unwrap().unwrap();
        assert_eq!(delivery.headers()["x-retry-count"], 1);
        broker.nack(delivery, false).await.unwrap();

        assert!(broker.receive("work").await.unwrap().is_none());
        let dead = broker.receive("dlq").await.unwrap().unwrap();
        assert_eq!(dead.message().id, message.id);
        assert_eq!(dead.headers()["x-death-reason"], "rejected");
        broker.ack(dead).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_overflow_dead_letters_oldest() {
        let broker = broker().await;
        let messages: Vec<_> = (0..3).map(|i| Message::new(vec![i])).collect();
        for message in &messages {
            broker.publish("direct", "job", message.clone()).await.unwrap();
        }

        let dead = broker.receive("dlq").await.unwrap().unwrap();
        assert_eq!(dead.message().id, messages[0].id);
        assert_eq!(dead.headers()["x-death-reason"], "maxlen");

        let next = broker.receive("work").await.unwrap().unwrap();
        assert_eq!(next.message().id, messages[1].id);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_requeue_into_full_queue_dead_letters_oldest() {
        let broker = broker().await;
        let first = Message::new("first");
        broker.publish("direct", "job", first.clone()).await.unwrap();
        let delivery = broker.receive("work").await.unwrap().unwrap();

        // Fill the queue while the first message is in flight.
        let later: Vec<_> = (0..2).map(|i| Message::new(vec![i])).collect();
        for message in &later {
            broker.publish("direct", "job", message.clone()).await.unwrap();
        }
        broker.nack(delivery, true).await.unwrap();

        let dead = broker.receive("dlq").await.unwrap().unwrap();
        assert_eq!(dead.message().id, later[0].id);
        assert_eq!(dead.headers()["x-death-reason"], "maxlen");
        assert_eq!(
            broker.receive("work").await.unwrap().unwrap().message().id,
            later[1].id
        );
        assert_eq!(
            broker.receive("work").await.unwrap().unwrap().message().id,
            first.id
        );
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_ack_twice_with_stale_receipt_errors() {
        let broker = broker().await;
        broker.publish("direct", "job", Message::new("x")).await.unwrap();
        let delivery = broker.receive("work").await.unwrap().unwrap();
        let stale = Delivery::new("work", delivery.message().clone(), "stale");

        broker.ack(delivery).await.unwrap();
        assert!(matches!(
            broker.ack(stale).await,
            Err(BrokerError::UnknownDelivery(_))
        ));
    }
}
