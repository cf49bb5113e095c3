use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use herald_common::config::AppConfig;
use herald_common::redis_pool::create_redis_pool;
use herald_notifier::{MessageBroker, RedisBroker, RedisStatusStore, StatusStore, settings, worker};
use herald_resilience::{CircuitBreakerRegistry, ProtectedCaller};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_notifier=info,herald_resilience=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald notifier starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to Redis
    let redis = create_redis_pool(&config.redis_url).await?;
    let broker: Arc<dyn MessageBroker> = Arc::new(RedisBroker::new(redis.clone()));
    let status: Arc<dyn StatusStore> =
        Arc::new(RedisStatusStore::new(redis, config.status_ttl_secs));

    settings::topology(&config).declare(broker.as_ref()).await?;

    let registry = Arc::new(CircuitBreakerRegistry::new());
    let caller = ProtectedCaller::new(registry, settings::breaker_config(&config)?);

    let shutdown = CancellationToken::new();
    let mut workers = worker::spawn_workers(&config, broker, status, caller, &shutdown)?;

    // Run until Ctrl+C, then drain in-flight deliveries
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    shutdown.cancel();

    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Worker task failed");
        }
    }

    tracing::info!("Herald notifier stopped.");
    Ok(())
}
