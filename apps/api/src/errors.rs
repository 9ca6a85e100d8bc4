use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::applications::quota::QuotaSnapshot;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
///
/// User-facing rejections map to 4xx; `Database`, `Automation`, and
/// `Internal` are operator problems and map to 5xx.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid apply target: {0}")]
    InvalidTarget(String),

    #[error("Daily application limit reached ({used}/{limit})", used = .0.used, limit = .0.limit)]
    QuotaExceeded(QuotaSnapshot),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Another worker claimed the session first")]
    ClaimConflict,

    #[error("Forbidden")]
    Forbidden,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Automation error: {0}")]
    Automation(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::InvalidTarget(msg) => {
                (StatusCode::BAD_REQUEST, "INVALID_TARGET_URL", msg.clone())
            }
            AppError::QuotaExceeded(snapshot) => {
                // Quota rejections carry the full snapshot next to the code.
                let body = Json(json!({
                    "error": {
                        "code": "QUOTA_EXCEEDED",
                        "message": self.to_string(),
                        "quota": snapshot,
                    }
                }));
                return (StatusCode::TOO_MANY_REQUESTS, body).into_response();
            }
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::ClaimConflict => (
                StatusCode::CONFLICT,
                "CLAIM_CONFLICT",
                "Another worker claimed the session first".to_string(),
            ),
            AppError::Forbidden => (
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                "Access denied".to_string(),
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {e}");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "STORAGE_UNAVAILABLE",
                    "Storage is unavailable".to_string(),
                )
            }
            AppError::Automation(msg) => {
                tracing::error!("Automation error: {msg}");
                (
                    StatusCode::BAD_GATEWAY,
                    "AUTOMATION_ERROR",
                    "The automation driver failed".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
