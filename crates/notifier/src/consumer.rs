//! Retry-aware queue consumer.
//!
//! Every delivery is settled exactly once:
//! - undecodable body → dead-lettered immediately, the sender is never called
//! - send succeeds → ack
//! - send fails → requeue with `x-retry-count` bumped, or dead-letter once
//!   `max_retries` deliveries have failed
//! - provider circuit refuses the call → requeue unchanged and pause the
//!   consumer; the provider was never tried, so no attempt is used up

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use herald_common::types::{DeliveryStatus, NotificationMessage};
use herald_resilience::ConfigError;

use crate::broker::{BrokerError, MessageBroker};
use crate::envelope::RetryEnvelope;
use crate::message::Delivery;
use crate::sender::{DeliveryError, NotificationSender};
use crate::status::StatusStore;

/// A message body that is not a valid notification. Never retried.
#[derive(Debug, Error)]
#[error("malformed notification: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

pub fn decode(body: &[u8]) -> Result<NotificationMessage, DecodeError> {
    Ok(serde_json::from_slice(body)?)
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    queue: String,
    max_retries: u32,
    prefetch: usize,
    poll_interval: Duration,
    circuit_backoff: Duration,
}

impl ConsumerConfig {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_PREFETCH: usize = 10;
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
    pub const DEFAULT_CIRCUIT_BACKOFF: Duration = Duration::from_secs(1);

    /// `max_retries` may be 0, which dead-letters on the first failure.
    pub fn new(
        queue: impl Into<String>,
        max_retries: u32,
        prefetch: usize,
        poll_interval: Duration,
    ) -> Result<Self, ConfigError> {
        if prefetch == 0 {
            return Err(ConfigError::NonPositive { field: "prefetch" });
        }
        if poll_interval.is_zero() {
            return Err(ConfigError::NonPositive {
                field: "poll_interval",
            });
        }
        Ok(Self {
            queue: queue.into(),
            max_retries,
            prefetch,
            poll_interval,
            circuit_backoff: Self::DEFAULT_CIRCUIT_BACKOFF,
        })
    }

    /// Defaults: 3 retries, prefetch 10, 250ms poll interval, 1s circuit backoff.
    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            max_retries: Self::DEFAULT_MAX_RETRIES,
            prefetch: Self::DEFAULT_PREFETCH,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            circuit_backoff: Self::DEFAULT_CIRCUIT_BACKOFF,
        }
    }

    /// How long to stop pulling after the provider's circuit is found open.
    pub fn with_circuit_backoff(mut self, backoff: Duration) -> Result<Self, ConfigError> {
        if backoff.is_zero() {
            return Err(ConfigError::NonPositive {
                field: "circuit_backoff",
            });
        }
        self.circuit_backoff = backoff;
        Ok(self)
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn prefetch(&self) -> usize {
        self.prefetch
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn circuit_backoff(&self) -> Duration {
        self.circuit_backoff
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    Malformed,
    RetriesExhausted,
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    /// Requeued carrying `x-retry-count = attempt`.
    Requeued { attempt: u32 },
    /// Requeued untouched because the provider's circuit refused the call.
    Deferred,
    DeadLettered { reason: DeadLetterReason },
}

pub struct RetryConsumer {
    broker: Arc<dyn MessageBroker>,
    sender: Arc<dyn NotificationSender>,
    status: Option<Arc<dyn StatusStore>>,
    config: ConsumerConfig,
    paused_until: Mutex<Option<Instant>>,
}

impl RetryConsumer {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        sender: Arc<dyn NotificationSender>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            sender,
            status: None,
            config,
            paused_until: Mutex::new(None),
        }
    }

    /// Record `sent` / `failed` for every decoded notification.
    pub fn with_status_store(mut self, status: Arc<dyn StatusStore>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Decide and settle one delivery.
    pub async fn handle(&self, mut delivery: Delivery) -> Result<Disposition, BrokerError> {
        let queue = self.config.queue.as_str();
        let message_id = delivery.message().id;

        let notification = match decode(delivery.body()) {
            Ok(notification) => notification,
            Err(err) => {
                tracing::warn!(
                    queue,
                    message_id = %message_id,
                    error = %err,
                    "Malformed message, sending to dead-letter queue"
                );
                self.broker.nack(delivery, false).await?;
                return Ok(Disposition::DeadLettered {
                    reason: DeadLetterReason::Malformed,
                });
            }
        };
        let notification_id = notification.notification_id;

        let err = match self.sender.send(&notification).await {
            Ok(()) => {
                self.broker.ack(delivery).await?;
                tracing::info!(queue, notification_id = %notification_id, "Notification delivered");
                self.record_status(&notification, DeliveryStatus::Sent, None)
                    .await;
                return Ok(Disposition::Acked);
            }
            Err(err) => err,
        };

        if let Some(backoff) = self.circuit_backoff_for(&err) {
            self.broker.nack(delivery, true).await?;
            self.pause_for(backoff);
            tracing::debug!(
                queue,
                notification_id = %notification_id,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Provider circuit refused delivery, deferring"
            );
            return Ok(Disposition::Deferred);
        }

        let attempts = RetryEnvelope::from_headers(delivery.headers()).attempts_made();
        if attempts < self.config.max_retries {
            RetryEnvelope {
                attempt_count: attempts,
            }
            .write_to(delivery.headers_mut());
            self.broker.nack(delivery, true).await?;

            tracing::info!(
                queue,
                notification_id = %notification_id,
                attempt = attempts,
                max_retries = self.config.max_retries,
                error = %err,
                "Delivery failed, requeuing"
            );
            return Ok(Disposition::Requeued { attempt: attempts });
        }

        self.broker.nack(delivery, false).await?;
        tracing::warn!(
            queue,
            notification_id = %notification_id,
            attempts,
            error = %err,
            "Max retries reached, sending to dead-letter queue"
        );
        self.record_status(&notification, DeliveryStatus::Failed, Some(err.to_string()))
            .await;
        Ok(Disposition::DeadLettered {
            reason: DeadLetterReason::RetriesExhausted,
        })
    }

    /// Pull and handle one delivery. `None` when the queue is empty.
    pub async fn process_next(&self) -> Result<Option<Disposition>, BrokerError> {
        match self.broker.receive(&self.config.queue).await? {
            Some(delivery) => self.handle(delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Consume until `shutdown` fires, with at most `prefetch` deliveries in
    /// flight. In-flight deliveries are drained before returning.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let queue = self.config.queue.clone();
        let permits = Arc::new(Semaphore::new(self.config.prefetch));
        let mut in_flight = JoinSet::new();

        tracing::info!(queue = %queue, prefetch = self.config.prefetch, "Consumer started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            while let Some(result) = in_flight.try_join_next() {
                log_settlement(&queue, result);
            }

            if let Some(remaining) = self.pause_remaining() {
                drop(permit);
                if !self.sleep_unless_cancelled(remaining, &shutdown).await {
                    break;
                }
                continue;
            }

            let delivery = match self.broker.receive(&queue).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    drop(permit);
                    if !self.idle(&shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    tracing::error!(queue = %queue, error = %err, "Failed to receive from queue");
                    drop(permit);
                    if !self.idle(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let consumer = Arc::clone(&self);
            in_flight.spawn(async move {
                let _permit = permit;
                consumer.handle(delivery).await
            });
        }

        tracing::info!(
            queue = %queue,
            in_flight = in_flight.len(),
            "Consumer stopping, draining in-flight deliveries"
        );
        while let Some(result) = in_flight.join_next().await {
            log_settlement(&queue, result);
        }
        tracing::info!(queue = %queue, "Consumer stopped");
    }

    /// Sleep one poll interval. `false` if shutdown fired meanwhile.
    async fn idle(&self, shutdown: &CancellationToken) -> bool {
        self.sleep_unless_cancelled(self.config.poll_interval, shutdown)
            .await
    }

    async fn sleep_unless_cancelled(
        &self,
        duration: Duration,
        shutdown: &CancellationToken,
    ) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Backoff for a breaker rejection. `None` for real delivery failures.
    fn circuit_backoff_for(&self, err: &DeliveryError) -> Option<Duration> {
        match err {
            DeliveryError::CircuitOpen { .. } => Some(self.config.circuit_backoff),
            DeliveryError::Recovering { .. } => Some(self.config.poll_interval),
            DeliveryError::Rejected { .. } | DeliveryError::Transport { .. } => None,
        }
    }

    /// Stop pulling new deliveries for `backoff`. Never shortens an existing pause.
    fn pause_for(&self, backoff: Duration) {
        let deadline = Instant::now() + backoff;
        let mut paused_until = self.paused_until.lock();
        *paused_until = Some(paused_until.map_or(deadline, |current| current.max(deadline)));
    }

    /// Time left on the current pause, if any.
    pub fn pause_remaining(&self) -> Option<Duration> {
        let until = (*self.paused_until.lock())?;
        let remaining = until.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }

    async fn record_status(
        &self,
        notification: &NotificationMessage,
        status: DeliveryStatus,
        detail: Option<String>,
    ) {
        let Some(store) = &self.status else {
            return;
        };
        if let Err(err) = store
            .record(notification.notification_id, status, detail)
            .await
        {
            tracing::warn!(
                notification_id = %notification.notification_id,
                status = %status,
                error = %err,
                "Failed to record delivery status"
            );
        }
    }
}

fn log_settlement(
    queue: &str,
    result: Result<Result<Disposition, BrokerError>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(disposition)) => {
            tracing::debug!(queue, ?disposition, "Delivery settled");
        }
        Ok(Err(err)) => {
            tracing::error!(queue, error = %err, "Failed to settle delivery");
        }
        Err(err) => {
            tracing::error!(queue, error = %err, "Delivery handler panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use herald_common::types::{ChannelType, NotificationRequest};
    use herald_resilience::{BreakerConfig, CircuitBreakerRegistry, CircuitState, ProtectedCaller};

    use crate::broker::{ExchangeDecl, InMemoryBroker, QueueDecl};
    use crate::message::{Message, RETRY_COUNT_HEADER};
    use crate::sender::ProtectedSender;
    use crate::status::MemoryStatusStore;

    /// Replays scripted outcomes; succeeds once the script runs out.
    struct ScriptedSender {
        outcomes: Mutex<VecDeque<bool>>,
        calls: Mutex<u32>,
    }

    impl ScriptedSender {
        fn new(outcomes: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl NotificationSender for ScriptedSender {
        fn name(&self) -> &str {
            "email-provider"
        }

        async fn send(&self, _notification: &NotificationMessage) -> Result<(), DeliveryError> {
            *self.calls.lock() += 1;
            if self.outcomes.lock().pop_front().unwrap_or(true) {
                Ok(())
            } else {
                Err(DeliveryError::Rejected {
                    provider: "email-provider".to_string(),
                    status: 503,
                })
            }
        }
    }

    /// Counts every send, including ones the inner sender's breaker refuses.
    struct CountingSender {
        inner: Arc<dyn NotificationSender>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl NotificationSender for CountingSender {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn send(&self, notification: &NotificationMessage) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.send(notification).await
        }
    }

    async fn broker() -> Arc<InMemoryBroker> {
        let broker = Arc::new(InMemoryBroker::new());
        broker
            .declare_exchange(&ExchangeDecl::fanout("dlx.exchange"))
            .await
            .unwrap();
        broker
            .declare_queue(&QueueDecl::durable("dead.letter.queue"))
            .await
            .unwrap();
        broker
            .bind_queue("dead.letter.queue", "dlx.exchange", "")
            .await
            .unwrap();
        broker
            .declare_queue(
                &QueueDecl::durable("email.queue").with_dead_letter_exchange("dlx.exchange"),
            )
            .await
            .unwrap();
        broker
    }

    async fn publish_notifications(broker: &InMemoryBroker, count: usize) {
        for _ in 0..count {
            broker
                .publish("", "email.queue", Message::json(&notification()).unwrap())
                .await
                .unwrap();
        }
    }

    fn protected(
        inner: Arc<ScriptedSender>,
        max_failures: u32,
    ) -> (ProtectedCaller, ProtectedSender) {
        let caller = ProtectedCaller::new(
            Arc::new(CircuitBreakerRegistry::new()),
            BreakerConfig::new(max_failures, Duration::from_secs(30)).unwrap(),
        );
        (caller.clone(), ProtectedSender::new(inner, caller))
    }

    fn notification() -> NotificationMessage {
        NotificationMessage::from_request(NotificationRequest {
            user_id: "u-1".to_string(),
            channel: ChannelType::Email,
            title: "Welcome".to_string(),
            message: "Hello".to_string(),
            template_id: None,
            token: None,
        })
    }

    fn consumer(
        broker: &Arc<InMemoryBroker>,
        sender: Arc<dyn NotificationSender>,
        max_retries: u32,
    ) -> RetryConsumer {
        let config =
            ConsumerConfig::new("email.queue", max_retries, 10, Duration::from_millis(10)).unwrap();
        RetryConsumer::new(broker.clone(), sender, config)
    }

    #[test]
    fn test_config_rejects_zero_prefetch_and_interval() {
        assert!(matches!(
            ConsumerConfig::new("q", 3, 0, Duration::from_millis(10)),
            Err(ConfigError::NonPositive { field: "prefetch" })
        ));
        assert!(matches!(
            ConsumerConfig::new("q", 3, 1, Duration::ZERO),
            Err(ConfigError::NonPositive {
                field: "poll_interval"
            })
        ));
        assert!(ConsumerConfig::new("q", 0, 1, Duration::from_millis(1)).is_ok());
        assert!(
            ConsumerConfig::for_queue("q")
                .with_circuit_backoff(Duration::ZERO)
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_success_acks() {
        let broker = broker().await;
        let sender = ScriptedSender::new(&[true]);
        let consumer = consumer(&broker, sender.clone(), 3);
        broker
            .publish("", "email.queue", Message::json(&notification()).unwrap())
            .await
            .unwrap();

        assert_eq!(consumer.process_next().await.unwrap(), Some(Disposition::Acked));
        assert_eq!(broker.ready_len("email.queue"), 0);
        assert_eq!(broker.unacked_len("email.queue"), 0);
        assert_eq!(sender.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_queue_returns_none() {
        let broker = broker().await;
        let consumer = consumer(&broker, ScriptedSender::new(&[]), 3);
        assert_eq!(consumer.process_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_requeue_bumps_retry_header() {
        let broker = broker().await;
        let consumer = consumer(&broker, ScriptedSender::new(&[false]), 3);
        broker
            .publish("", "email.queue", Message::json(&notification()).unwrap())
            .await
            .unwrap();

        assert_eq!(
            consumer.process_next().await.unwrap(),
            Some(Disposition::Requeued { attempt: 1 })
        );
        let queued = broker.peek("email.queue");
        assert_eq!(queued[0].headers[RETRY_COUNT_HEADER], 1);
    }

    #[tokio::test]
    async fn test_zero_retries_dead_letters_first_failure() {
        let broker = broker().await;
        let consumer = consumer(&broker, ScriptedSender::new(&[false]), 0);
        broker
            .publish("", "email.queue", Message::json(&notification()).unwrap())
            .await
            .unwrap();

        assert_eq!(
            consumer.process_next().await.unwrap(),
            Some(Disposition::DeadLettered {
                reason: DeadLetterReason::RetriesExhausted
            })
        );
        assert_eq!(broker.ready_len("dead.letter.queue"), 1);
    }

    #[tokio::test]
    async fn test_malformed_body_never_reaches_sender() {
        let broker = broker().await;
        let sender = ScriptedSender::new(&[]);
        let consumer = consumer(&broker, sender.clone(), 3);
        broker
            .publish("", "email.queue", Message::new("not json"))
            .await
            .unwrap();

        assert_eq!(
            consumer.process_next().await.unwrap(),
            Some(Disposition::DeadLettered {
                reason: DeadLetterReason::Malformed
            })
        );
        assert_eq!(sender.calls(), 0);
        assert_eq!(broker.peek("dead.letter.queue")[0].body, b"not json");
    }

    #[tokio::test]
    async fn test_status_recorded_on_ack_and_dead_letter() {
        let broker = broker().await;
        let status = Arc::new(MemoryStatusStore::new());
        let consumer = consumer(&broker, ScriptedSender::new(&[true, false]), 1)
            .with_status_store(status.clone());

        let delivered = notification();
        let failed = notification();
        for n in [&delivered, &failed] {
            broker
                .publish("", "email.queue", Message::json(n).unwrap())
                .await
                .unwrap();
        }
        consumer.process_next().await.unwrap();
        consumer.process_next().await.unwrap();

        let sent = status.get(delivered.notification_id).await.unwrap().unwrap();
        assert_eq!(sent.status, DeliveryStatus::Sent);
        let dead = status.get(failed.notification_id).await.unwrap().unwrap();
        assert_eq!(dead.status, DeliveryStatus::Failed);
        assert!(dead.error_detail.unwrap().contains("HTTP 503"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_and_stops_on_shutdown() {
        let broker = broker().await;
        let sender = ScriptedSender::new(&[]);
        let consumer = Arc::new(consumer(&broker, sender.clone(), 3));
        for _ in 0..5 {
            broker
                .publish("", "email.queue", Message::json(&notification()).unwrap())
                .await
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(sender.calls(), 5);
        assert_eq!(broker.ready_len("email.queue"), 0);
        assert_eq!(broker.unacked_len("email.queue"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_defers_without_spending_retries() {
        let broker = broker().await;
        let provider = ScriptedSender::new(&[false; 10]);
        let (caller, sender) = protected(provider.clone(), 5);
        let consumer = consumer(&broker, Arc::new(sender), 3);
        publish_notifications(&broker, 10).await;

        let mut dispositions = Vec::new();
        for _ in 0..10 {
            dispositions.push(consumer.process_next().await.unwrap().unwrap());
        }

        // Five real failures trip the breaker; the rest never reach the provider.
        assert_eq!(provider.calls(), 5);
        assert_eq!(caller.state("email-provider"), Some(CircuitState::Open));
        assert!(dispositions[..5]
            .iter()
            .all(|d| *d == Disposition::Requeued { attempt: 1 }));
        assert!(dispositions[5..].iter().all(|d| *d == Disposition::Deferred));

        assert_eq!(broker.ready_len("dead.letter.queue"), 0);
        let queued = broker.peek("email.queue");
        assert_eq!(queued.len(), 10);
        let untouched = queued
            .iter()
            .filter(|m| !m.headers.contains_key(RETRY_COUNT_HEADER))
            .count();
        assert_eq!(untouched, 5);
        assert_eq!(
            consumer.pause_remaining(),
            Some(ConsumerConfig::DEFAULT_CIRCUIT_BACKOFF)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_pauses_while_provider_circuit_is_open() {
        let broker = broker().await;
        let provider = ScriptedSender::new(&[false]);
        let (caller, sender) = protected(provider.clone(), 1);
        let _ = caller
            .execute("email-provider", || async { Err::<(), _>("down") })
            .await;
        assert_eq!(caller.state("email-provider"), Some(CircuitState::Open));

        let counting = Arc::new(CountingSender {
            inner: Arc::new(sender),
            calls: AtomicU32::new(0),
        });
        let config = ConsumerConfig::new("email.queue", 3, 1, Duration::from_millis(10))
            .unwrap()
            .with_circuit_backoff(Duration::from_secs(60))
            .unwrap();
        let consumer = Arc::new(RetryConsumer::new(broker.clone(), counting.clone(), config));
        publish_notifications(&broker, 3).await;

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(consumer.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown.cancel();
        handle.await.unwrap();

        // One refused send, then the consumer waits out the backoff.
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.calls(), 0);
        assert_eq!(broker.ready_len("email.queue"), 3);
        assert_eq!(broker.unacked_len("email.queue"), 0);
        assert_eq!(broker.ready_len("dead.letter.queue"), 0);
    }
}
