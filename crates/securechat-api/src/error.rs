use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use securechat_types::moderation::Analysis;
use thiserror::Error;
use tracing::error;

/// Error taxonomy for the request surface.
///
/// DecryptionFailure and ClassifierUnavailable deliberately have no variant
/// here: the former degrades to a placeholder string on the read path, the
/// latter is recovered locally via the heuristic fallback. Neither may fail
/// a request.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    /// Classifier scored the message at or above the block threshold. The
    /// response carries the full analysis so clients can render the
    /// explanation instead of a generic error.
    #[error("message blocked for security reasons")]
    RiskBlocked {
        analysis: Box<Analysis>,
        security_tips: Vec<String>,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(message) => {
                simple(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", &message)
            }
            ApiError::Unauthorized(message) => {
                simple(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", &message)
            }
            ApiError::Forbidden(message) => simple(StatusCode::FORBIDDEN, "FORBIDDEN", &message),
            ApiError::NotFound(message) => simple(StatusCode::NOT_FOUND, "NOT_FOUND", &message),
            ApiError::Conflict(message) => simple(StatusCode::CONFLICT, "CONFLICT", &message),
            ApiError::RiskBlocked {
                analysis,
                security_tips,
            } => (
                StatusCode::FORBIDDEN,
                Json(json!({
                    "code": "RISK_BLOCKED",
                    "message": "Message blocked for security reasons",
                    "blocked": true,
                    "analysis": analysis,
                    "securityTips": security_tips,
                })),
            )
                .into_response(),
            ApiError::Internal(e) => {
                error!("Internal error: {:#}", e);
                simple(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "internal server error",
                )
            }
        }
    }
}

fn simple(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({ "code": code, "message": message }))).into_response()
}
