//! API error handling module
//!
//! Defines error types and their HTTP response conversions.
//!
//! Verify-stage failures at or past the signature check are deliberately
//! collapsed into one generic external message so callers cannot distinguish
//! a wrong domain from a replayed token from a broken session binding.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use uuid::Uuid;

use crate::types::ApiErrorResponse;

/// Error codes exposed in error response bodies.
pub mod codes {
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const TOO_MANY_REQUESTS: &str = "TOO_MANY_REQUESTS";
    pub const VERIFICATION_FAILED: &str = "VERIFICATION_FAILED";
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    pub const DECRYPTION_FAILED: &str = "DECRYPTION_FAILED";
}

/// API error type with associated HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed body, oversized payload, bad base64, invalid public key point.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown or inactive API key, bad transcript signature.
    #[error("Authentication failed")]
    AuthFailure,

    /// Domain mismatch, blocked IP, blocked country, high-confidence bot.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Per-key or per-IP rate limit hit; carries seconds until the window clears.
    #[error("Too many requests")]
    RateLimited { remaining_secs: i64 },

    /// Challenge used, signature mismatch, token expired, replay-set hit.
    /// Externally indistinguishable from any other verify failure.
    #[error("Verification failed")]
    ReplayOrExpired,

    /// Encrypted protocol used without a live session; client should re-handshake.
    #[error("Session expired")]
    SessionMissing,

    /// AEAD decrypt produced nothing usable.
    #[error("Decryption failed")]
    EncryptionFailure,

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error")]
    Database(#[from] sqlx::Error),
}

impl From<crate::services::crypto::CryptoError> for ApiError {
    fn from(err: crate::services::crypto::CryptoError) -> Self {
        use crate::services::crypto::CryptoError;
        match err {
            CryptoError::InvalidPublicKey => {
                ApiError::InvalidRequest("invalid public key".to_string())
            }
            CryptoError::DecryptFailed => ApiError::EncryptionFailure,
            CryptoError::InvalidKeyMaterial | CryptoError::DerivationFailed => {
                ApiError::Internal(anyhow::anyhow!("crypto failure"))
            }
        }
    }
}

impl ApiError {
    /// Returns the error code for this error type.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => codes::VALIDATION_ERROR,
            ApiError::AuthFailure => codes::AUTH_FAILED,
            ApiError::Forbidden(_) => codes::FORBIDDEN,
            ApiError::RateLimited { .. } => codes::TOO_MANY_REQUESTS,
            ApiError::ReplayOrExpired => codes::VERIFICATION_FAILED,
            ApiError::SessionMissing => codes::SESSION_EXPIRED,
            ApiError::EncryptionFailure => codes::DECRYPTION_FAILED,
            ApiError::Internal(_) | ApiError::Database(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Returns the HTTP status code for this error type.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::AuthFailure => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ReplayOrExpired => StatusCode::FORBIDDEN,
            ApiError::SessionMissing => StatusCode::CONFLICT,
            ApiError::EncryptionFailure => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) | ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a safe message for external consumption (no internal details).
    pub fn safe_message(&self) -> String {
        match self {
            ApiError::InvalidRequest(msg) => format!("Invalid request: {msg}"),
            ApiError::AuthFailure => "Invalid API key".to_string(),
            // The category is exposed, the failed check is not.
            ApiError::Forbidden(_) => "Security check failed".to_string(),
            ApiError::RateLimited { remaining_secs } => {
                format!("Too many requests. Retry in {remaining_secs} seconds.")
            }
            ApiError::ReplayOrExpired => "Verification failed".to_string(),
            ApiError::SessionMissing => "Session expired".to_string(),
            ApiError::EncryptionFailure => "Decryption failed".to_string(),
            ApiError::Internal(_) => "An internal error occurred".to_string(),
            ApiError::Database(_) => "A database error occurred".to_string(),
        }
    }

    /// Converts the error to a response with the given request ID.
    pub fn into_response_with_request_id(self, request_id: Uuid) -> Response {
        let status = self.status_code();
        let body = ApiErrorResponse::new(self.code(), self.safe_message(), request_id);

        (status, Json(body)).into_response()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ApiErrorResponse::new(self.code(), self.safe_message(), Uuid::nil());
        (status, Json(body)).into_response()
    }
}

/// A wrapper that carries the request ID with an error for response generation.
pub struct ApiErrorWithRequestId {
    pub error: ApiError,
    pub request_id: Uuid,
}

impl IntoResponse for ApiErrorWithRequestId {
    fn into_response(self) -> Response {
        self.error.into_response_with_request_id(self.request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_stage_errors_share_one_external_message() {
        // Replay, expiry and signature mismatch all collapse to ReplayOrExpired,
        // so a single assertion covers the enumeration-resistance rule.
        assert_eq!(ApiError::ReplayOrExpired.safe_message(), "Verification failed");
    }

    #[test]
    fn forbidden_never_names_the_failed_check() {
        let err = ApiError::Forbidden("country RU on blocklist".to_string());
        assert_eq!(err.safe_message(), "Security check failed");
    }

    #[test]
    fn rate_limit_reports_remaining_time() {
        let err = ApiError::RateLimited { remaining_secs: 42 };
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert!(err.safe_message().contains("42"));
    }

    #[test]
    fn internal_errors_hide_details() {
        let err = ApiError::Internal(anyhow::anyhow!("rng pool exhausted at 0x7f"));
        assert_eq!(err.safe_message(), "An internal error occurred");
    }
}
