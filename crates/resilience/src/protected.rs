//! Protected calls: circuit breaking with caller-facing errors.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::breaker::{
    BreakerConfig, BreakerError, BreakerMetrics, CircuitState, Rejection, TransitionEvent,
};
use crate::registry::CircuitBreakerRegistry;

/// Error returned to callers of [`ProtectedCaller::execute`].
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The dependency's circuit is open; supply a fallback.
    #[error("service {dependency} is currently unavailable (circuit breaker open)")]
    Unavailable { dependency: String },

    /// The dependency is being probed and the probe budget is used up.
    #[error("service {dependency} is recovering, please try again later")]
    Recovering { dependency: String },

    /// The operation itself failed.
    #[error("{0}")]
    Underlying(E),
}

impl<E> CallError<E> {
    /// `true` when the breaker refused the call without running it.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, CallError::Underlying(_))
    }
}

/// Runs operations against named dependencies through a shared registry.
#[derive(Clone)]
pub struct ProtectedCaller {
    registry: Arc<CircuitBreakerRegistry>,
    default_config: BreakerConfig,
}

impl ProtectedCaller {
    pub fn new(registry: Arc<CircuitBreakerRegistry>, default_config: BreakerConfig) -> Self {
        Self {
            registry,
            default_config,
        }
    }

    pub fn registry(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.registry
    }

    /// Run `operation` under the breaker for `dependency`, using the default config.
    pub async fn execute<T, E, F, Fut>(
        &self,
        dependency: &str,
        operation: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with(dependency, &self.default_config, operation)
            .await
    }

    /// Run `operation` under the breaker for `dependency`.
    ///
    /// `config` only applies if this call creates the breaker.
    pub async fn execute_with<T, E, F, Fut>(
        &self,
        dependency: &str,
        config: &BreakerConfig,
        operation: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.registry.get_or_create(dependency, config);

        breaker.execute(operation).await.map_err(|err| match err {
            BreakerError::Rejected(Rejection::CircuitOpen) => CallError::Unavailable {
                dependency: dependency.to_string(),
            },
            BreakerError::Rejected(Rejection::TooManyProbes) => CallError::Recovering {
                dependency: dependency.to_string(),
            },
            BreakerError::Operation(err) => CallError::Underlying(err),
        })
    }

    /// Current state of `dependency`'s breaker; `None` if it was never called.
    pub fn state(&self, dependency: &str) -> Option<CircuitState> {
        self.registry.state(dependency)
    }

    /// Metrics of every breaker, for health endpoints.
    pub fn all_metrics(&self) -> BTreeMap<String, BreakerMetrics> {
        self.registry.snapshot_all_metrics()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.registry.subscribe()
    }
}
