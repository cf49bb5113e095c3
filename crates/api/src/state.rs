//! Shared application state for the Axum API server.

use std::sync::Arc;

use herald_notifier::{MessageBroker, NotificationPublisher, StatusStore};
use herald_resilience::ProtectedCaller;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<NotificationPublisher>,
    pub status: Arc<dyn StatusStore>,
    pub caller: ProtectedCaller,
}

impl AppState {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        status: Arc<dyn StatusStore>,
        caller: ProtectedCaller,
    ) -> Self {
        let publisher = NotificationPublisher::new(broker, caller.clone(), Arc::clone(&status));
        Self {
            publisher: Arc::new(publisher),
            status,
            caller,
        }
    }
}
