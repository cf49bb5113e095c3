//! Circuit breaking for outbound dependencies.
//!
//! - [`CircuitBreaker`]: per-dependency Closed / Open / HalfOpen state machine
//! - [`CircuitBreakerRegistry`]: name → breaker map, created lazily on first use
//! - [`ProtectedCaller`]: registry lookup + breaker execution + error translation
//!
//! The registry is an ordinary value. Services construct one, wrap it in an
//! `Arc` and hand it to whatever needs protection.

pub mod breaker;
pub mod protected;
pub mod registry;

pub use breaker::{
    Admission, BreakerConfig, BreakerError, BreakerMetrics, CircuitBreaker, CircuitState,
    ConfigError, Outcome, Rejection, Transition, TransitionEvent,
};
pub use protected::{CallError, ProtectedCaller};
pub use registry::CircuitBreakerRegistry;
