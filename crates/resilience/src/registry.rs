//! One circuit breaker per dependency name, created on first use.
//!
//! Entries are created on first lookup and never removed. Lookups take the
//! read lock; creation re-checks under the write lock so concurrent first use
//! still yields a single instance.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::breaker::{BreakerConfig, BreakerMetrics, CircuitBreaker, CircuitState, TransitionEvent};

/// Capacity of the transition event channel. Slow subscribers lag, they never block breakers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Thread-safe name → breaker map.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    events: broadcast::Sender<TransitionEvent>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            breakers: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Return the breaker for `name`, creating it with `config` on first use.
    ///
    /// `config` is ignored when the breaker already exists.
    pub fn get_or_create(&self, name: &str, config: &BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write();
        if let Some(breaker) = breakers.get(name) {
            return Arc::clone(breaker);
        }

        let breaker = Arc::new(CircuitBreaker::with_events(
            name,
            config.clone(),
            self.events.clone(),
        ));
        breakers.insert(name.to_string(), Arc::clone(&breaker));

        tracing::info!(
            dependency = %name,
            max_failures = config.max_failures(),
            reset_timeout_ms = config.reset_timeout().as_millis() as u64,
            half_open_probe_limit = config.half_open_probe_limit(),
            "Circuit breaker created"
        );
        breaker
    }

    /// Look up an existing breaker without creating one.
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Current state of a dependency's breaker, if one exists.
    pub fn state(&self, name: &str) -> Option<CircuitState> {
        self.get(name).map(|breaker| breaker.state())
    }

    /// Names of all known dependencies, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }

    /// Metrics for every breaker, keyed by dependency name. Read-only.
    pub fn snapshot_all_metrics(&self) -> BTreeMap<String, BreakerMetrics> {
        self.breakers
            .read()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.metrics()))
            .collect()
    }

    /// Subscribe to state transitions of every breaker in this registry.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.events.subscribe()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
