//! Circuit breaker: stops calling a failing dependency, then probes for recovery.
//!
//! ```text
//! Closed ──(failures ≥ max_failures)──► Open
//! Open ──(admit after reset_timeout)──► HalfOpen
//! HalfOpen ──(probe_limit successes)──► Closed
//! HalfOpen ──(any failure)──► Open
//! ```
//!
//! Expiry of `reset_timeout` is detected lazily by the next [`CircuitBreaker::admit`];
//! there is no background timer. Time is read from `tokio::time::Instant`, so
//! tests drive it with a paused runtime clock.
//!
//! HalfOpen admission reserves a probe slot at `admit` time and releases it when
//! the outcome is recorded, so concurrent callers never exceed the probe limit.
//! Each HalfOpen episode is numbered; an [`Admission`] remembers the episode it
//! was granted in, and only probes of the current episode release slots or
//! count towards closing the circuit.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Default number of successful probes required to close a half-open circuit.
pub const DEFAULT_HALF_OPEN_PROBE_LIMIT: u32 = 3;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow through.
    Closed,
    /// Calls fail fast until the reset timeout elapses.
    Open,
    /// A limited number of probe calls test whether the dependency recovered.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Invalid construction-time configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },
}

/// Per-dependency breaker configuration. Only constructible with positive values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    max_failures: u32,
    reset_timeout: Duration,
    half_open_probe_limit: u32,
}

impl BreakerConfig {
    /// Create a config with the default half-open probe limit.
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Result<Self, ConfigError> {
        if max_failures == 0 {
            return Err(ConfigError::NonPositive {
                field: "max_failures",
            });
        }
        if reset_timeout.is_zero() {
            return Err(ConfigError::NonPositive {
                field: "reset_timeout",
            });
        }
        Ok(Self {
            max_failures,
            reset_timeout,
            half_open_probe_limit: DEFAULT_HALF_OPEN_PROBE_LIMIT,
        })
    }

    /// Override the number of probes admitted (and successes required) in HalfOpen.
    pub fn with_half_open_probe_limit(mut self, limit: u32) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::NonPositive {
                field: "half_open_probe_limit",
            });
        }
        self.half_open_probe_limit = limit;
        Ok(self)
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }

    pub fn half_open_probe_limit(&self) -> u32 {
        self.half_open_probe_limit
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_probe_limit: DEFAULT_HALF_OPEN_PROBE_LIMIT,
        }
    }
}

/// Why the breaker refused to run an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("too many requests in half-open state")]
    TooManyProbes,
}

/// Result of [`CircuitBreaker::execute`]: either a rejection or the operation's own error.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error("{0}")]
    Operation(E),
}

/// Outcome of a guarded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// A state change, reported by `admit` / `record`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Ticket for an admitted call, handed back to [`CircuitBreaker::record`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an admitted call must have its outcome recorded"]
pub struct Admission {
    transition: Option<Transition>,
    probe_episode: Option<u64>,
}

impl Admission {
    /// The transition caused by admitting this call, if any.
    pub fn transition(&self) -> Option<Transition> {
        self.transition
    }

    /// Whether this call holds a HalfOpen probe slot.
    pub fn is_probe(&self) -> bool {
        self.probe_episode.is_some()
    }
}

/// Diagnostic event broadcast on every state change of a registry-owned breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionEvent {
    pub dependency: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Read-only view of a breaker for health endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub max_failures: u32,
    pub half_open_success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Mutable state, guarded by the breaker's lock.
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    half_open_success_count: u32,
    probes_in_flight: u32,
    /// Incremented on every entry into HalfOpen.
    episode: u64,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_success_count: 0,
            probes_in_flight: 0,
            episode: 0,
            last_failure: None,
            last_failure_at: None,
        }
    }

    fn admit(&mut self, config: &BreakerConfig, now: Instant) -> Result<Admission, Rejection> {
        match self.state {
            CircuitState::Closed => Ok(Admission {
                transition: None,
                probe_episode: None,
            }),
            CircuitState::Open => {
                let cooled_down = self
                    .last_failure
                    .is_none_or(|at| now.saturating_duration_since(at) > config.reset_timeout);
                if !cooled_down {
                    return Err(Rejection::CircuitOpen);
                }
                let transition = self.transition(CircuitState::HalfOpen);
                self.episode += 1;
                // This caller is the first probe of the episode.
                self.probes_in_flight = 1;
                Ok(Admission {
                    transition: Some(transition),
                    probe_episode: Some(self.episode),
                })
            }
            CircuitState::HalfOpen => {
                let reserved = self.probes_in_flight + self.half_open_success_count;
                if reserved < config.half_open_probe_limit {
                    self.probes_in_flight += 1;
                    Ok(Admission {
                        transition: None,
                        probe_episode: Some(self.episode),
                    })
                } else {
                    Err(Rejection::TooManyProbes)
                }
            }
        }
    }

    /// True if `probe_episode` names a slot reserved in the current HalfOpen episode.
    fn holds_current_slot(&self, probe_episode: Option<u64>) -> bool {
        self.state == CircuitState::HalfOpen && probe_episode == Some(self.episode)
    }

    fn record(
        &mut self,
        probe_episode: Option<u64>,
        outcome: Outcome,
        config: &BreakerConfig,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Option<Transition> {
        match outcome {
            Outcome::Success => match self.state {
                CircuitState::Closed => {
                    self.failure_count = 0;
                    None
                }
                CircuitState::HalfOpen if self.holds_current_slot(probe_episode) => {
                    self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
                    self.half_open_success_count += 1;
                    (self.half_open_success_count >= config.half_open_probe_limit)
                        .then(|| self.transition(CircuitState::Closed))
                }
                // Late success of a call admitted outside this HalfOpen episode.
                CircuitState::HalfOpen | CircuitState::Open => None,
            },
            Outcome::Failure => {
                self.failure_count = self.failure_count.saturating_add(1);
                self.last_failure = Some(now);
                self.last_failure_at = Some(wall);
                match self.state {
                    CircuitState::Closed => (self.failure_count >= config.max_failures)
                        .then(|| self.transition(CircuitState::Open)),
                    // Any failure reopens, including one admitted before this episode.
                    CircuitState::HalfOpen => Some(self.transition(CircuitState::Open)),
                    CircuitState::Open => None,
                }
            }
        }
    }

    /// Release a probe slot whose outcome will never be recorded.
    fn abandon(&mut self, probe_episode: Option<u64>) {
        if self.holds_current_slot(probe_episode) {
            self.probes_in_flight = self.probes_in_flight.saturating_sub(1);
        }
    }

    fn transition(&mut self, to: CircuitState) -> Transition {
        let from = self.state;
        self.state = to;
        self.half_open_success_count = 0;
        self.probes_in_flight = 0;
        if to == CircuitState::Closed {
            self.failure_count = 0;
        }
        Transition { from, to }
    }

    fn metrics(&self, config: &BreakerConfig) -> BreakerMetrics {
        BreakerMetrics {
            state: self.state,
            failure_count: self.failure_count,
            max_failures: config.max_failures,
            half_open_success_count: self.half_open_success_count,
            last_failure_at: self.last_failure_at,
        }
    }
}

/// Circuit breaker guarding a single named dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
    events: Option<broadcast::Sender<TransitionEvent>>,
}

impl CircuitBreaker {
    /// Create a standalone breaker. Transitions are only logged.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
            events: None,
        }
    }

    /// Create a breaker that also broadcasts its transitions.
    pub(crate) fn with_events(
        name: impl Into<String>,
        config: BreakerConfig,
        events: broadcast::Sender<TransitionEvent>,
    ) -> Self {
        Self {
            events: Some(events),
            ..Self::new(name, config)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state as stored. Does not perform the lazy Open → HalfOpen check.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Snapshot of counters. Never mutates.
    pub fn metrics(&self) -> BreakerMetrics {
        self.inner.lock().metrics(&self.config)
    }

    /// Decide whether a call may proceed. The returned [`Admission`] must be
    /// handed back to [`CircuitBreaker::record`] once the call completes.
    pub fn admit(&self) -> Result<Admission, Rejection> {
        let result = self.inner.lock().admit(&self.config, Instant::now());
        match &result {
            Ok(admission) => {
                if let Some(transition) = admission.transition {
                    self.emit(transition);
                }
            }
            Err(rejection) => {
                tracing::debug!(
                    dependency = %self.name,
                    %rejection,
                    "Call rejected by circuit breaker"
                );
            }
        }
        result
    }

    /// Record the outcome of an admitted call. Returns the transition it caused, if any.
    pub fn record(&self, admission: Admission, outcome: Outcome) -> Option<Transition> {
        let transition = self.inner.lock().record(
            admission.probe_episode,
            outcome,
            &self.config,
            Instant::now(),
            Utc::now(),
        );
        if let Some(transition) = transition {
            self.emit(transition);
        }
        transition
    }

    /// Run `operation` if admitted, recording its outcome.
    ///
    /// A rejection short-circuits without invoking `operation`. If the returned
    /// future is dropped before the operation completes, any reserved probe
    /// slot is released.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let call = PendingCall {
            breaker: self,
            admission: Some(self.admit()?),
        };

        match operation().await {
            Ok(value) => {
                call.settle(Outcome::Success);
                Ok(value)
            }
            Err(err) => {
                call.settle(Outcome::Failure);
                Err(BreakerError::Operation(err))
            }
        }
    }

    fn emit(&self, transition: Transition) {
        match transition.to {
            CircuitState::Open => tracing::warn!(
                dependency = %self.name,
                from = %transition.from,
                max_failures = self.config.max_failures,
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => tracing::info!(
                dependency = %self.name,
                "Circuit breaker transitioning to half-open"
            ),
            CircuitState::Closed => tracing::info!(
                dependency = %self.name,
                "Circuit breaker closed, dependency recovered"
            ),
        }

        if let Some(events) = &self.events {
            // No subscribers is not an error.
            let _ = events.send(TransitionEvent {
                dependency: self.name.clone(),
                from: transition.from,
                to: transition.to,
                at: Utc::now(),
            });
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// An admitted call whose outcome has not been recorded yet.
struct PendingCall<'a> {
    breaker: &'a CircuitBreaker,
    admission: Option<Admission>,
}

impl PendingCall<'_> {
    fn settle(mut self, outcome: Outcome) {
        if let Some(admission) = self.admission.take() {
            self.breaker.record(admission, outcome);
        }
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            self.breaker.inner.lock().abandon(admission.probe_episode);
        }
    }
}
