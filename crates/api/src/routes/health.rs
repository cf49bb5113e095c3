//! Health check endpoint.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;

use herald_resilience::CircuitState;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Always 200 while the process serves requests; `degraded` when any
/// dependency's circuit is not closed.
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let breakers = state.caller.all_metrics();
    let degraded = breakers
        .values()
        .any(|metrics| metrics.state != CircuitState::Closed);

    Json(json!({
        "status": if degraded { "degraded" } else { "healthy" },
        "service": "herald-api",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now(),
        "circuit_breakers": breakers
    }))
}
