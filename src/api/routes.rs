use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use super::handlers;
use super::middleware::idempotency_middleware;
use crate::idempotency::IdempotencyCoordinator;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<IdempotencyCoordinator>,
    pub metrics_handle: Option<PrometheusHandle>,
    pub orders_created: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(coordinator: Arc<IdempotencyCoordinator>) -> Self {
        Self {
            coordinator,
            metrics_handle: None,
            orders_created: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Adds metrics handle to the state.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}

/// Creates the demo router. Every route passes through the idempotency middleware;
/// the configured policy decides which ones it applies to.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/orders", post(handlers::create_order))
        .layer(middleware::from_fn_with_state(
            state.coordinator.clone(),
            idempotency_middleware,
        ))
        .with_state(state)
}
