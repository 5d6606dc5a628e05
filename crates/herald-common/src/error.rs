//! Centralized error types for Herald.
//!
//! Uses `thiserror` for ergonomic error definitions and provides HTTP-friendly
//! error variants that can be directly converted to API responses.
//!
//! The taxonomy matters for retry behavior: validation and resolution errors
//! are permanent and surface immediately; federation unavailability is
//! transient and recovered through the delivery queue rather than the caller.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Core application error type used across all Herald services.
#[derive(Debug, thiserror::Error)]
pub enum HeraldError {
    // === Validation errors (rejected before any record is created) ===
    #[error("Malformed handle '{0}': expected local-part@domain")]
    MalformedHandle(String),

    #[error("Exactly one of recipient handle or group must be specified")]
    InvalidTarget,

    #[error("Payload exceeds the maximum of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    // === Resolution errors (permanent for the current attempt) ===
    #[error("No identity found for '{handle}'")]
    IdentityNotFound { handle: String },

    // === Transient federation errors ===
    #[error("Node '{domain}' is unavailable for federation")]
    FederationUnavailable { domain: String },

    // === Resource / authorization errors ===
    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("Forbidden")]
    Forbidden,

    #[error("Unauthorized")]
    Unauthorized,

    // === Infrastructure errors ===
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// JSON error response body sent to clients.
#[derive(Serialize)]
struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl HeraldError {
    /// Map error to HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedHandle(_) | Self::InvalidTarget | Self::Validation { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::IdentityNotFound { .. } | Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::FederationUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error code string for programmatic handling by clients.
    pub fn error_code(&self) -> &str {
        match self {
            Self::MalformedHandle(_) => "MALFORMED_HANDLE",
            Self::InvalidTarget => "INVALID_TARGET",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::IdentityNotFound { .. } => "IDENTITY_NOT_FOUND",
            Self::FederationUnavailable { .. } => "FEDERATION_UNAVAILABLE",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Forbidden => "FORBIDDEN",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for HeraldError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Don't leak internal details to clients
        let message = match &self {
            HeraldError::Database(e) => {
                tracing::error!("Database error: {e}");
                "An internal error occurred".to_string()
            }
            HeraldError::Internal(e) => {
                tracing::error!("Internal error: {e}");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            code: status.as_u16(),
            error: self.error_code().to_string(),
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results using HeraldError.
pub type HeraldResult<T> = Result<T, HeraldError>;
