//! Centralized error types for the Exo Assist core library.
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

use crate::bus::BusError;
use crate::kb::KbError;
use crate::llm::LlmError;
use crate::stt::SttError;

/// Trait for error types that provide machine-readable error codes.
///
/// Implement this trait to provide consistent error codes across different
/// error conversion paths.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses.
    fn code(&self) -> &'static str;
}

impl ErrorCode for BusError {
    fn code(&self) -> &'static str {
        match self {
            BusError::Connection(_) => "bus_connection_failed",
            BusError::Publish(_) => "bus_publish_failed",
            BusError::Decode(_) => "bus_decode_failed",
            BusError::Handler(_) => "bus_handler_failed",
            BusError::Closed => "bus_closed",
        }
    }
}

impl ErrorCode for SttError {
    fn code(&self) -> &'static str {
        match self {
            SttError::Token(_) => "stt_token_failed",
            SttError::Connect(_) => "stt_connect_failed",
            SttError::Handshake(_) => "stt_handshake_failed",
            SttError::Send(_) => "stt_send_failed",
            SttError::Closed(_) => "stt_closed",
        }
    }
}

impl ErrorCode for LlmError {
    fn code(&self) -> &'static str {
        match self {
            LlmError::Http(_) => "llm_request_failed",
            LlmError::Timeout => "llm_timeout",
            LlmError::InvalidReply(_) => "llm_invalid_reply",
            LlmError::Unconfigured => "llm_unconfigured",
        }
    }
}

impl ErrorCode for KbError {
    fn code(&self) -> &'static str {
        match self {
            KbError::Http(_) => "kb_request_failed",
            KbError::Timeout => "kb_timeout",
            KbError::Unavailable(_) => "kb_unavailable",
        }
    }
}

/// Application-wide error type for the Exo Assist server.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum AssistError {
    /// Call not found in the registry or transcript store.
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Pub/sub transport failure.
    #[error("Bus error: {0}")]
    Bus(String),

    /// Streaming STT provider failure.
    #[error("STT provider error: {0}")]
    Stt(String),

    /// External LLM failure (intent or summary).
    #[error("LLM error: {0}")]
    Llm(String),

    /// Write-through store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Server configuration error (missing required settings or credentials).
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl AssistError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CallNotFound(_) => "call_not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Bus(_) => "bus_error",
            Self::Stt(_) => "stt_error",
            Self::Llm(_) => "llm_error",
            Self::Store(_) => "store_error",
            Self::Internal(_) => "internal_error",
            Self::Configuration(_) => "configuration_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::CallNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type AssistResult<T> = Result<T, AssistError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for AssistError {
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

impl From<BusError> for AssistError {
    fn from(err: BusError) -> Self {
        Self::Bus(err.to_string())
    }
}

impl From<SttError> for AssistError {
    fn from(err: SttError) -> Self {
        Self::Stt(err.to_string())
    }
}

impl From<LlmError> for AssistError {
    fn from(err: LlmError) -> Self {
        Self::Llm(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_not_found_maps_to_404() {
        let err = AssistError::CallNotFound("call-1".into());
        assert_eq!(err.code(), "call_not_found");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn invalid_request_maps_to_400() {
        let err = AssistError::InvalidRequest("bad payload".into());
        assert_eq!(err.code(), "invalid_request");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn configuration_error_maps_to_503() {
        let err = AssistError::Configuration("missing STT key".into());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn bus_error_converts_with_code() {
        let err: AssistError = BusError::Publish("down".into()).into();
        assert_eq!(err.code(), "bus_error");
    }
}
