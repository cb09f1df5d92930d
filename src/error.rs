use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::orchestrator::TriggerError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<TriggerError> for AppError {
    fn from(err: TriggerError) -> Self {
        match err {
            TriggerError::NoPlan(_) | TriggerError::NoConnection { .. } => {
                AppError::Conflict(err.to_string())
            }
            TriggerError::InvalidRange(message) => AppError::BadRequest(message),
            TriggerError::QuotaDenied(reason) => AppError::QuotaExceeded(reason.to_string()),
            TriggerError::Store(err) => AppError::Internal(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
