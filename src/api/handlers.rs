use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::atomic::Ordering;
use uuid::Uuid;

use crate::api::requests::CreateOrderRequest;
use crate::api::responses::{ApiResponse, ErrorResponse, HealthResponse, OrderResponse};

use super::routes::AppState;

/// Liveness endpoint.
pub async fn health_check() -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
    }))
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics_handle {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "Metrics not enabled".to_string()),
    }
}

/// Creates an order. Protected by the idempotency middleware, so a retried request
/// with the same key returns the first order instead of creating another.
pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<OrderResponse>>), (StatusCode, Json<ApiResponse<()>>)> {
    if let Err(errors) = request.validate() {
        let message = errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect::<Vec<_>>()
            .join(", ");

        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::<()>::error(ErrorResponse::new("VALIDATION_ERROR", message))),
        ));
    }

    let sequence = state.orders_created.fetch_add(1, Ordering::SeqCst) + 1;
    let order = OrderResponse {
        order_id: Uuid::new_v4(),
        item: request.item,
        quantity: request.quantity,
        sequence,
        created_at: chrono::Utc::now(),
    };

    tracing::info!(order_id = %order.order_id, sequence, "Order created");

    Ok((StatusCode::CREATED, Json(ApiResponse::success(order))))
}
