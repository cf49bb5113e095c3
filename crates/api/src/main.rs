//! Herald gateway binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::redis_pool::create_redis_pool;
use herald_notifier::{MessageBroker, RedisBroker, RedisStatusStore, StatusStore, settings};
use herald_resilience::{CircuitBreakerRegistry, ProtectedCaller};

use herald_api::routes::create_router;
use herald_api::state::AppState;

const MAX_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(
                "herald_api=debug,herald_notifier=info,herald_resilience=info,tower_http=debug",
            )
        }))
        .init();

    tracing::info!("Starting Herald gateway...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Create Redis connection
    let redis = create_redis_pool(&config.redis_url).await?;

    // Broker and topology
    let broker: Arc<dyn MessageBroker> = Arc::new(RedisBroker::new(redis.clone()));
    settings::topology(&config).declare(broker.as_ref()).await?;

    let status: Arc<dyn StatusStore> =
        Arc::new(RedisStatusStore::new(redis, config.status_ttl_secs));
    let caller = ProtectedCaller::new(
        Arc::new(CircuitBreakerRegistry::new()),
        settings::breaker_config(&config)?,
    );

    // Build application state
    let port = config.gateway_port;
    let state = AppState::new(broker, status, caller);

    // Build router
    let app = create_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    Ok(())
}
