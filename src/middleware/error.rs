use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};

use crate::error::Error;
use crate::types::BackendErrorBody;

const DEFAULT_AUTH_CODE: &str = "AUTHENTICATION_ERROR";
const DEFAULT_AUTH_MESSAGE: &str = "Authentication failed";

/// Errors rendered by the proxy middleware.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Backend URL missing or unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Login rejected, or the login call itself failed.
    #[error("{}", .0.message)]
    Authentication(LoginFailure),

    /// Forwarding to the backend failed.
    #[error("Proxy request failed: {0}")]
    Transport(String),

    /// Inbound body larger than the configured limit.
    #[error("Request body exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },
}

/// Structured login failure, shaped like the backend's error object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginFailure {
    #[serde(skip)]
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Default for LoginFailure {
    fn default() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: DEFAULT_AUTH_CODE.into(),
            message: DEFAULT_AUTH_MESSAGE.into(),
            details: None,
            correlation_id: None,
        }
    }
}

impl LoginFailure {
    /// Map a failed backend login call.
    ///
    /// Status comes from the backend reply (401 when there was none). Code
    /// and message are taken from `{error: {...}}` when the body has one.
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        let Error::Backend { status, detail, .. } = error else {
            return Self::default();
        };

        let status = status
            .and_then(|s| StatusCode::from_u16(s).ok())
            .unwrap_or(StatusCode::UNAUTHORIZED);
        let body: BackendErrorBody = serde_json::from_str(detail).unwrap_or_default();

        let Some(inner) = body.error else {
            return Self { status, ..Self::default() };
        };

        Self {
            status,
            code: inner.code.unwrap_or_else(|| DEFAULT_AUTH_CODE.into()),
            message: inner
                .message
                .or(body.message)
                .unwrap_or_else(|| DEFAULT_AUTH_MESSAGE.into()),
            details: inner.details,
            correlation_id: inner.correlation_id,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            Self::Config(ref msg) => {
                tracing::error!(error = %self, "Proxy misconfigured");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": msg }))).into_response()
            }
            Self::Authentication(failure) => (failure.status, Json(failure)).into_response(),
            Self::Transport(ref msg) => {
                tracing::error!(error = %self, "Proxy request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Proxy request failed", "message": msg })),
                )
                    .into_response()
            }
            Self::PayloadTooLarge { limit } => {
                tracing::warn!(limit, "Request body too large to proxy");
                (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    Json(json!({ "error": "Payload too large", "message": self.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

impl From<Error> for ProxyError {
    fn from(e: Error) -> Self {
        match e {
            Error::Config(msg) => Self::Config(msg),
            other => Self::Transport(other.to_string()),
        }
    }
}
