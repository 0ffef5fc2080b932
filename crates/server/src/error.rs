use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub type Result<T> = std::result::Result<T, AppError>;

/// Error taxonomy surfaced over HTTP as a `{message}` body.
///
/// The realtime channel never surfaces these; failures there are logged
/// server-side and dropped.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    /// Authenticated but not permitted (not a member, or not the owner).
    #[error("{0}")]
    Unauthorized(String),

    /// Missing or invalid bearer credential.
    #[error("Not authenticated")]
    Unauthenticated,

    #[error("{0}")]
    Validation(String),

    /// Invite token absent, unknown, or expired.
    #[error("{0}")]
    InvalidToken(String),

    #[error("{0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized(_) | AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Validation(_) | AppError::InvalidToken(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(_) | AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {self}");
        }

        let message = match &self {
            // Never leak database details to the client
            AppError::Database(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        (status, Json(json!({ "message": message }))).into_response()
    }
}
