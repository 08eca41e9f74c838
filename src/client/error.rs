use std::sync::Arc;

use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};

use crate::error::Error;

const DEFAULT_MESSAGE: &str = "Request failed";

/// Caller-supplied error sink: `(error, error_context)`.
pub type ErrorHandler = Arc<dyn Fn(&ApiError, Option<&str>) + Send + Sync>;

/// The one error shape handed to SDK callers.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Decoded error body, when there was one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseInfo>,
}

/// What is kept of the failed HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseInfo {
    pub url: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
}

impl ApiError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            data: None,
            response: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    /// Build from a non-2xx reply.
    ///
    /// `body` is the decoded JSON body; without one the status text stands in.
    pub(crate) fn from_response(url: &str, status: StatusCode, body: Option<JsonValue>) -> Self {
        let status_text = status.canonical_reason().map(str::to_owned);
        let data = body.unwrap_or_else(|| json!({ "message": status_text }));
        let message = data
            .get("message")
            .and_then(JsonValue::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MESSAGE)
            .to_string();

        Self {
            message,
            status: Some(status.as_u16()),
            data: Some(data),
            response: Some(ResponseInfo {
                url: url.to_string(),
                status: status.as_u16(),
                status_text,
            }),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        let status = e.status();
        Self {
            message: e.to_string(),
            status: status.map(|s| s.as_u16()),
            data: None,
            response: status.map(|s| ResponseInfo {
                url: e.url().map(ToString::to_string).unwrap_or_default(),
                status: s.as_u16(),
                status_text: s.canonical_reason().map(str::to_owned),
            }),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Http(e) => e.into(),
            Error::Backend { status, ref detail, .. } => {
                let data = serde_json::from_str::<JsonValue>(detail).ok();
                let message = data
                    .as_ref()
                    .and_then(|d| d.get("message"))
                    .and_then(JsonValue::as_str)
                    .map_or_else(|| e.to_string(), str::to_owned);
                Self {
                    message,
                    status,
                    data,
                    response: None,
                }
            }
            other => Self::new(other.to_string()),
        }
    }
}

/// Hand `error` to `handler`, or log it when there is none.
pub(crate) fn report_error(error: &ApiError, context: Option<&str>, handler: Option<&ErrorHandler>) {
    match handler {
        Some(handler) => handler(error, context),
        None => tracing::error!(
            error = %error,
            status = ?error.status,
            context = context.unwrap_or_default(),
            "Enfyra API error"
        ),
    }
}
