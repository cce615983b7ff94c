//! Error codes and the JSON error response shared by all routes.
//!
//! Each service owns its own `thiserror` enum. Route modules map those enums
//! onto an HTTP status and wrap them in [`ApiError`], which renders as
//! `{"error": "...", "code": "E_..."}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Grepable error code and retryable flag for structured error bodies.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self { status, code, message: message.into(), retryable: false }
    }

    pub fn from_code<E: ErrorCode>(status: StatusCode, err: &E) -> Self {
        if status.is_server_error() {
            tracing::error!(code = err.error_code(), error = %err, "request failed");
        }
        Self { status, code: err.error_code(), message: err.to_string(), retryable: err.retryable() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "E_BAD_REQUEST", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({ "error": self.message, "code": self.code });
        if self.retryable {
            body["retryable"] = serde_json::Value::Bool(true);
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!(error = %err, "database error");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "E_DATABASE", "database error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("slow down")]
    struct Busy;

    impl ErrorCode for Busy {
        fn error_code(&self) -> &'static str {
            "E_BUSY"
        }

        fn retryable(&self) -> bool {
            true
        }
    }

    async fn body_of(err: ApiError) -> serde_json::Value {
        let resp = err.into_response();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn body_has_error_and_code() {
        let body = body_of(ApiError::bad_request("missing field")).await;
        assert_eq!(body, serde_json::json!({"error": "missing field", "code": "E_BAD_REQUEST"}));
    }

    #[tokio::test]
    async fn retryable_flag_is_only_present_when_set() {
        let err = ApiError::from_code(StatusCode::SERVICE_UNAVAILABLE, &Busy);
        assert_eq!(err.code, "E_BUSY");
        let body = body_of(err).await;
        assert_eq!(body["retryable"], true);
        assert_eq!(body["error"], "slow down");
    }

    #[test]
    fn database_errors_hide_details() {
        let err = ApiError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "database error");
    }
}
