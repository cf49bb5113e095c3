//! Worker assembly: one retry consumer per primary queue, plus the
//! dead-letter monitor when it is enabled.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use herald_common::config::AppConfig;
use herald_common::types::ChannelType;
use herald_resilience::ProtectedCaller;

use crate::broker::MessageBroker;
use crate::consumer::RetryConsumer;
use crate::dlq::DeadLetterMonitor;
use crate::settings;
use crate::status::StatusStore;

/// Spawn every worker task. All of them stop once `shutdown` is cancelled.
pub fn spawn_workers(
    config: &AppConfig,
    broker: Arc<dyn MessageBroker>,
    status: Arc<dyn StatusStore>,
    caller: ProtectedCaller,
    shutdown: &CancellationToken,
) -> anyhow::Result<JoinSet<()>> {
    let mut workers = JoinSet::new();

    for channel in ChannelType::ALL {
        let sender = settings::channel_sender(channel, config, caller.clone())?;
        let consumer = RetryConsumer::new(
            Arc::clone(&broker),
            sender,
            settings::consumer_config(config, channel.queue_name())?,
        )
        .with_status_store(Arc::clone(&status));

        tracing::info!(queue = channel.queue_name(), "Starting consumer");
        workers.spawn(Arc::new(consumer).run(shutdown.clone()));
    }

    let dead_letter_queue = settings::topology(config).dead_letter_queue;
    if config.dlq_monitor_enabled {
        let monitor = DeadLetterMonitor::new(
            broker,
            dead_letter_queue,
            settings::poll_interval(config),
        );
        workers.spawn(monitor.run(shutdown.clone()));
    } else {
        tracing::info!(
            queue = %dead_letter_queue,
            "Dead-letter monitor disabled, dead letters are retained"
        );
    }

    Ok(workers)
}
