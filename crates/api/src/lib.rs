//! Herald notification gateway.
//!
//! Endpoints:
//! - POST /notifications: validate, assign an id and queue a notification
//! - GET  /notifications/{id}: last known delivery status
//! - GET  /health: liveness plus circuit breaker metrics

pub mod routes;
pub mod state;
