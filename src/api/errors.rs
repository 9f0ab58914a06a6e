//! API Error Handling
//!
//! Engine errors mapped to HTTP status codes with request tracking.

use crate::errors::{EngineError, EntityKind};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub ok: bool,
    /// Human-readable error message
    pub msg: String,
    /// Stable code (INSUFFICIENT_FUNDS, ROOM_FULL, UNAUTHORIZED, ...)
    pub code: String,
    pub request_id: String,
}

/// API error with request tracking
#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub request_id: String,
}

#[derive(Debug)]
pub enum ApiErrorKind {
    /// Rejected or failed engine operation
    Engine(EngineError),
    /// Malformed request the engine never saw
    BadRequest(String),
    Unauthorized(String),
}

impl ApiError {
    pub fn engine(request_id: String, error: EngineError) -> Self {
        Self {
            kind: ApiErrorKind::Engine(error),
            request_id,
        }
    }

    pub fn bad_request(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::BadRequest(message),
            request_id,
        }
    }

    pub fn unauthorized(request_id: String, message: String) -> Self {
        Self {
            kind: ApiErrorKind::Unauthorized(message),
            request_id,
        }
    }

    pub fn status(&self) -> StatusCode {
        match &self.kind {
            ApiErrorKind::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiErrorKind::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiErrorKind::Engine(e) => engine_status(e),
        }
    }

    fn code(&self) -> &'static str {
        match &self.kind {
            ApiErrorKind::BadRequest(_) => "BAD_REQUEST",
            ApiErrorKind::Unauthorized(_) => "UNAUTHORIZED",
            ApiErrorKind::Engine(EngineError::UnknownEntity { kind: EntityKind::Coin, .. }) => "UNKNOWN_COIN",
            ApiErrorKind::Engine(e) => e.code(),
        }
    }
}

fn engine_status(error: &EngineError) -> StatusCode {
    match error {
        EngineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        EngineError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
        EngineError::RoomFull(_)
        | EngineError::RoomNotOpen(_)
        | EngineError::DuplicateWager(_)
        | EngineError::InvalidState(_) => StatusCode::CONFLICT,
        EngineError::UnknownEntity { kind: EntityKind::Coin, .. } => StatusCode::BAD_REQUEST,
        EngineError::UnknownEntity { .. } => StatusCode::NOT_FOUND,
        EngineError::AlreadySettled(_) => StatusCode::OK,
        EngineError::TransientStorageFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Storage(_) | EngineError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ApiErrorKind::Engine(e) => write!(f, "[{}] {}", self.request_id, e),
            ApiErrorKind::BadRequest(msg) => write!(f, "[{}] Bad Request: {}", self.request_id, msg),
            ApiErrorKind::Unauthorized(msg) => write!(f, "[{}] Unauthorized: {}", self.request_id, msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(request_id = %self.request_id, "{}", self);
        }

        let msg = match &self.kind {
            ApiErrorKind::Engine(e) => e.to_string(),
            ApiErrorKind::BadRequest(msg) | ApiErrorKind::Unauthorized(msg) => msg.clone(),
        };

        let body = Json(ErrorResponse {
            ok: status.is_success(),
            msg,
            code: self.code().to_string(),
            request_id: self.request_id.clone(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let rid = || "req-1".to_string();
        let cases = [
            (EngineError::invalid("bad"), StatusCode::BAD_REQUEST),
            (
                EngineError::InsufficientFunds {
                    requested: 10,
                    available: 1,
                },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (EngineError::RoomFull("r".into()), StatusCode::CONFLICT),
            (EngineError::unknown(EntityKind::Room, "r"), StatusCode::NOT_FOUND),
            (EngineError::AlreadySettled("w".into()), StatusCode::OK),
            (EngineError::TransientStorageFailure("io".into()), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::engine(rid(), error).status(), status);
        }
    }

    #[test]
    fn test_unknown_coin_is_client_error() {
        let err = ApiError::engine("req-2".into(), EngineError::unknown(EntityKind::Coin, "XYZ"));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "UNKNOWN_COIN");
    }
}
