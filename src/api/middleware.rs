//! Middleware Components
//!
//! CORS, request tracking, caller identity and the admin key guard.

use super::{errors::ApiError, handlers::AppState};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer, ExposeHeaders};
use uuid::Uuid;

/// Request ID header key
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Caller identity, set by the authenticating gateway in front of the API;
/// the engine keeps no session state and trusts this header as given
pub const ACCOUNT_ID_HEADER: &str = "x-account-id";

/// Admin key for oracle, game-result, deposit and lottery administration
pub const API_KEY_HEADER: &str = "x-api-key";

/// Create CORS middleware with configurable origins
pub fn create_cors_layer(allowed_origins: Vec<String>) -> CorsLayer {
    let exposed = ExposeHeaders::list([HeaderName::from_static(REQUEST_ID_HEADER)]);

    if allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        // Development mode: allow all origins
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .expose_headers(exposed)
    } else {
        CorsLayer::new()
            .allow_origin(
                allowed_origins
                    .into_iter()
                    .filter_map(|o| o.parse().ok())
                    .collect::<Vec<_>>(),
            )
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any)
            .expose_headers(exposed)
    }
}

/// Middleware to add request ID to all requests
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

/// Request ID wrapper for extracting in handlers
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Rejects admin requests without the configured key
///
/// With no key configured the admin surface is closed entirely: prices, game
/// results and deposit confirmations decide where money goes.
pub async fn admin_key_middleware(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    let reason = match state.admin_api_key.as_deref().filter(|k| !k.is_empty()) {
        Some(expected) if provided == Some(expected) => return next.run(request).await,
        Some(_) => "missing or invalid API key",
        None => "admin endpoints are disabled: no API key configured",
    };

    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default();
    tracing::warn!(request_id = %request_id, path = %request.uri().path(), "Rejected admin request");
    ApiError::unauthorized(request_id, reason.to_string()).into_response()
}

/// Account id from the `x-account-id` header
pub fn caller_account(headers: &HeaderMap, request_id: &RequestId) -> Result<String, ApiError> {
    headers
        .get(ACCOUNT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            ApiError::bad_request(
                request_id.0.clone(),
                format!("missing {} header", ACCOUNT_ID_HEADER),
            )
        })
}
