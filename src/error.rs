// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::control::ControlError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error_code: &'static str,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    error_code: &'static str,
}

impl ApiError {
    pub fn new(status: StatusCode, error_code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error_code,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_input", message)
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        let (status, code) = match &err {
            ControlError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            ControlError::AlreadyExists { .. } => (StatusCode::CONFLICT, "already_exists"),
            ControlError::KeyExpired => (StatusCode::GONE, "key_expired"),
            ControlError::KeyAlreadyUsed => (StatusCode::CONFLICT, "key_already_used"),
            ControlError::NotAuthorized(_) => (StatusCode::FORBIDDEN, "not_authorized"),
            ControlError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            ControlError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            ControlError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        // Server-side faults are logged in full and reported generically.
        let message = match &err {
            ControlError::Store(_) => {
                tracing::error!(error = %err, "Store operation failed");
                "storage temporarily unavailable, retry later".to_string()
            }
            ControlError::Internal(_) => {
                tracing::error!(error = %err, "Internal error");
                "internal server error".to_string()
            }
            _ => err.to_string(),
        };
        Self::new(status, code, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            error_code: self.error_code,
        });
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreError;
    use axum::body::to_bytes;

    #[test]
    fn constructors_set_status_and_message() {
        let nf = ApiError::not_found("missing");
        assert_eq!(nf.status, StatusCode::NOT_FOUND);
        assert_eq!(nf.message, "missing");

        let bad = ApiError::bad_request("bad");
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);
        assert_eq!(bad.error_code, "invalid_input");
    }

    #[test]
    fn control_errors_keep_their_distinction() {
        let cases = [
            (ControlError::namespace_not_found("acme"), StatusCode::NOT_FOUND),
            (ControlError::KeyExpired, StatusCode::GONE),
            (ControlError::KeyAlreadyUsed, StatusCode::CONFLICT),
            (
                ControlError::NotAuthorized("pending".into()),
                StatusCode::FORBIDDEN,
            ),
            (
                ControlError::InvalidInput("bad key".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                ControlError::Store(StoreError::Poisoned),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn store_failures_do_not_leak_details() {
        let err = ApiError::from(ControlError::Store(StoreError::Corrupt("node 7".into())));
        assert!(!err.message.contains("node 7"));
        assert_eq!(err.error_code, "store_unavailable");
    }

    #[tokio::test]
    async fn into_response_returns_json_body() {
        let response = ApiError::bad_request("bad data").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body_bytes.to_vec()).unwrap();
        assert_eq!(body, r#"{"error":"bad data","error_code":"invalid_input"}"#);
    }
}
