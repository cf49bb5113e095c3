//! Typed component configuration derived from [`AppConfig`].

use std::sync::Arc;
use std::time::Duration;

use herald_common::config::AppConfig;
use herald_common::types::ChannelType;
use herald_resilience::{BreakerConfig, ConfigError, ProtectedCaller};

use crate::consumer::ConsumerConfig;
use crate::sender::{LogSender, NotificationSender, ProtectedSender, WebhookSender};
use crate::topology::DeadLetterTopology;

pub fn breaker_config(config: &AppConfig) -> Result<BreakerConfig, ConfigError> {
    BreakerConfig::new(
        config.breaker_max_failures,
        Duration::from_secs(config.breaker_reset_timeout_secs),
    )?
    .with_half_open_probe_limit(config.breaker_half_open_probes)
}

/// Consumers pause for one breaker reset timeout when a provider's circuit is open.
pub fn consumer_config(config: &AppConfig, queue: &str) -> Result<ConsumerConfig, ConfigError> {
    ConsumerConfig::new(
        queue,
        config.max_retries,
        config.consumer_prefetch,
        poll_interval(config),
    )?
    .with_circuit_backoff(Duration::from_secs(config.breaker_reset_timeout_secs))
}

pub fn topology(config: &AppConfig) -> DeadLetterTopology {
    DeadLetterTopology::notifications(config.queue_max_length)
}

pub fn poll_interval(config: &AppConfig) -> Duration {
    Duration::from_millis(config.consumer_poll_interval_ms)
}

/// The provider for `channel`: a webhook when its URL is configured,
/// simulated delivery otherwise. Always behind the provider's circuit breaker.
pub fn channel_sender(
    channel: ChannelType,
    config: &AppConfig,
    caller: ProtectedCaller,
) -> anyhow::Result<Arc<dyn NotificationSender>> {
    let provider = channel.provider_name();
    let url = match channel {
        ChannelType::Email => config.email_webhook_url.as_deref(),
        ChannelType::Push => config.push_webhook_url.as_deref(),
    };

    let inner: Arc<dyn NotificationSender> = match url {
        Some(url) => {
            tracing::info!(provider, url, "Using webhook provider");
            Arc::new(WebhookSender::new(
                provider,
                url,
                Duration::from_millis(config.provider_timeout_ms),
            )?)
        }
        None => {
            tracing::info!(provider, "No webhook configured, simulating delivery");
            Arc::new(LogSender::new(provider))
        }
    };

    Ok(Arc::new(ProtectedSender::new(inner, caller)))
}
