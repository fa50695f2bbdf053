//! API 错误响应。

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::SupervisorError;

#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    /// 固定为 "error"
    pub status: &'static str,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            status: "error",
            code: self.code,
            message: self.message,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        let message = err.to_string();
        match err {
            SupervisorError::NotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, "STREAM_NOT_FOUND", message)
            }
            SupervisorError::AlreadyExists(_) => {
                ApiError::new(StatusCode::CONFLICT, "STREAM_EXISTS", message)
            }
            SupervisorError::LaunchFailed { stderr, .. } => {
                ApiError::new(StatusCode::BAD_GATEWAY, "LAUNCH_FAILED", message)
                    .with_details(serde_json::json!({ "stderr": stderr }))
            }
            SupervisorError::PersistenceFailed { .. } => {
                tracing::error!("{}", message);
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "PERSISTENCE_FAILED",
                    message,
                )
            }
            other => {
                tracing::error!("Unexpected error: {}", other);
                ApiError::internal(message)
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
