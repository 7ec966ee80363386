//! Centralized error types for the Colloquy core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type for the Colloquy services.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum ColloquyError {
    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Requested resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Redis operation failed (stream, pub/sub, or decision log).
    #[error("Redis error: {0}")]
    Redis(String),

    /// Durable store operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Object storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Object key failed validation (traversal, absolute path).
    #[error("Invalid storage key: {0}")]
    InvalidStorageKey(String),

    /// LLM request failed or returned an unusable response.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Webhook URL failed the SSRF safety checks.
    #[error("Webhook URL rejected: {0}")]
    WebhookRejected(String),

    /// Service configuration error (missing required settings).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ColloquyError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::Redis(_) => "redis_error",
            Self::Database(_) => "database_error",
            Self::Storage(_) => "storage_error",
            Self::InvalidStorageKey(_) => "invalid_storage_key",
            Self::Llm(_) => "llm_error",
            Self::WebhookRejected(_) => "webhook_url_rejected",
            Self::Configuration(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::InvalidStorageKey(_) | Self::WebhookRejected(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Llm(_) => StatusCode::BAD_GATEWAY,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type ColloquyResult<T> = Result<T, ColloquyError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for ColloquyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<redis::RedisError> for ColloquyError {
    fn from(err: redis::RedisError) -> Self {
        Self::Redis(err.to_string())
    }
}

impl From<sqlx::Error> for ColloquyError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for ColloquyError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_rejection_is_a_bad_request() {
        let err = ColloquyError::WebhookRejected("loopback".into());
        assert_eq!(err.code(), "webhook_url_rejected");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn configuration_error_maps_to_service_unavailable() {
        let err = ColloquyError::Configuration("missing api key".into());
        assert_eq!(err.code(), "configuration_error");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn llm_error_maps_to_bad_gateway() {
        let err = ColloquyError::Llm("timeout".into());
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }
}
