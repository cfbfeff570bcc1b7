use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

/// Why an OTP submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OtpRejection {
    Mismatch,
    Expired,
    NotIssued,
}

impl std::fmt::Display for OtpRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            OtpRejection::Mismatch => "otp does not match",
            OtpRejection::Expired => "otp has expired, request a new one",
            OtpRejection::NotIssued => "no otp is pending for this job",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no drivers available near pickup")]
    NoDriversNearby,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("otp rejected: {0}")]
    Otp(OtpRejection),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code returned alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION",
            AppError::NotFound(_) | AppError::NoDriversNearby => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::Otp(OtpRejection::Mismatch) => "OTP_MISMATCH",
            AppError::Otp(OtpRejection::Expired) => "OTP_EXPIRED",
            AppError::Otp(OtpRejection::NotIssued) => "OTP_NOT_ISSUED",
            AppError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::Otp(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) | AppError::NoDriversNearby => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn invalid_state(operation: &str) -> Self {
        AppError::Validation(format!("invalid state for this operation: {operation}"))
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => AppError::NotFound(what),
            StoreError::Conflict(what) => AppError::Conflict(what),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            AppError::Validation(msg)
            | AppError::NotFound(msg)
            | AppError::Conflict(msg)
            | AppError::Unauthorized(msg)
            | AppError::Forbidden(msg)
            | AppError::Internal(msg) => msg.clone(),
            AppError::NoDriversNearby => "no drivers available near pickup".to_string(),
            AppError::Otp(rejection) => rejection.to_string(),
        };

        let body = Json(json!({
            "code": self.code(),
            "error": message
        }));

        (status, body).into_response()
    }
}
