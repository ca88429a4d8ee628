use anyhow::anyhow;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::api::responses::{ApiResponse, ErrorResponse};
use crate::error::{AppError, Result};
use crate::idempotency::{HttpRequestFacade, IdempotencyCoordinator, StoredResponse};

/// Largest request body buffered to look up a body-field key.
pub const MAX_BUFFERED_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Axum middleware running every request through the idempotency coordinator.
///
/// Install with `axum::middleware::from_fn_with_state(coordinator, idempotency_middleware)`.
/// The coordinator's `RequestAnnotations` are attached to the response extensions.
///
/// Requests the policy rejects, or that carry no key, reach the downstream service with
/// their body unread and get its response back unbuffered. On protected routes a JSON
/// body is buffered only when a body-field key is configured; one that cannot be read
/// within `MAX_BUFFERED_BODY_BYTES` gets a 400.
pub async fn idempotency_middleware(
    State(coordinator): State<Arc<IdempotencyCoordinator>>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let mut facade = HttpRequestFacade::from_parts(&parts);

    if !coordinator.policy_applies(&facade) {
        let request = Request::from_parts(parts, body);
        return pass_through(&coordinator, facade, request, next).await;
    }

    let body = if coordinator.key_resolver().body_key().is_some() && is_json(&parts.headers) {
        match axum::body::to_bytes(body, MAX_BUFFERED_BODY_BYTES).await {
            Ok(bytes) => {
                if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&bytes) {
                    facade = facade.with_json_body(json);
                }
                Body::from(bytes)
            }
            Err(e) => {
                tracing::warn!("Failed to buffer request body: {}", e);
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ApiResponse::<()>::error(ErrorResponse::new(
                        "INVALID_BODY",
                        "Request body could not be read",
                    ))),
                )
                    .into_response();
            }
        }
    } else {
        body
    };

    let request = Request::from_parts(parts, body);
    if coordinator.applicable_key(&facade).is_none() {
        return pass_through(&coordinator, facade, request, next).await;
    }

    let result = coordinator
        .process(&mut facade, move || async move {
            let response = next.run(request).await;
            into_stored_response(response).await
        })
        .await;

    match result {
        Ok(outcome) => {
            let mut response = outcome.response.into_response();
            response.extensions_mut().insert(facade.into_annotations());
            response
        }
        Err(e) => e.into_response(),
    }
}

async fn pass_through(
    coordinator: &IdempotencyCoordinator,
    mut facade: HttpRequestFacade,
    request: Request,
    next: Next,
) -> Response {
    let mut response = coordinator
        .passthrough(&mut facade, move || next.run(request))
        .await;
    response.extensions_mut().insert(facade.into_annotations());
    response
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false)
}

/// Buffers a downstream response into the storable triple.
///
/// Header values that are not visible ASCII are dropped.
pub async fn into_stored_response(response: Response) -> Result<StoredResponse> {
    let (parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| AppError::Handler(anyhow!("Failed to read response body: {}", e)))?;

    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();

    Ok(StoredResponse {
        status: parts.status.as_u16(),
        headers,
        body: bytes.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_is_json() {
        let mut headers = HeaderMap::new();
        assert!(!is_json(&headers));

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("Application/JSON; charset=utf-8"),
        );
        assert!(is_json(&headers));

        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        assert!(!is_json(&headers));
    }

    #[tokio::test]
    async fn test_into_stored_response() {
        let response = (
            StatusCode::CREATED,
            [("x-order-id", "42")],
            "created",
        )
            .into_response();

        let stored = into_stored_response(response).await.unwrap();
        assert_eq!(stored.status, 201);
        assert_eq!(stored.header("x-order-id"), Some("42"));
        assert_eq!(stored.body_str(), Some("created"));
    }
}
