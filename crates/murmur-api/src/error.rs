use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use murmur_db::ChatError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Chat(err) => match err {
                ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
                ChatError::NotFound { .. } => StatusCode::NOT_FOUND,
                ChatError::InvalidOperation(_) => StatusCode::CONFLICT,
                ChatError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                ChatError::Validation(_) => StatusCode::BAD_REQUEST,
                ChatError::Storage(_) | ChatError::LockPoisoned(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            // Storage details stay in the log.
            error!("{}", self);
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
