use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::multipart::Form;
use reqwest::{Method, Response};
use serde_json::Value as JsonValue;
use url::Url;

use super::error::ApiError;
use crate::config::DEFAULT_API_PREFIX;
use crate::url::{Query, query_pairs};

/// Request payload for one API call.
#[derive(Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(JsonValue),
    Multipart(Form),
}

impl From<Option<JsonValue>> for RequestBody {
    fn from(body: Option<JsonValue>) -> Self {
        body.map_or(Self::Empty, Self::Json)
    }
}

/// HTTP transport for calls against the application's own SDK routes.
///
/// Holds a cookie store, so the session cookies set by the proxy's login
/// route ride along on every later call, like a browser would send them.
#[derive(Debug, Clone)]
pub struct ApiClient {
    origin: Url,
    api_prefix: String,
    http: reqwest::Client,
}

impl ApiClient {
    /// Client for the application served at `origin`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if `origin` is not an absolute URL or the HTTP
    /// client cannot be built.
    pub fn new(origin: &str) -> Result<Self, ApiError> {
        let origin = Url::parse(origin).map_err(|e| ApiError::new(format!("Invalid app origin {origin}: {e}")))?;
        let http = reqwest::Client::builder().cookie_store(true).build()?;
        Ok(Self {
            origin,
            api_prefix: DEFAULT_API_PREFIX.into(),
            http,
        })
    }

    #[must_use]
    pub fn with_api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = prefix.into();
        self
    }

    /// Use a custom HTTP client. It should keep a cookie store for sessions to work.
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    #[must_use]
    pub fn api_prefix(&self) -> &str {
        &self.api_prefix
    }

    /// Absolute URL for an origin-relative `path` plus `query`.
    pub(crate) fn url_for(&self, path: &str, query: &Query) -> Result<Url, ApiError> {
        let mut url = self
            .origin
            .join(&format!("/{}", path.trim_start_matches('/')))
            .map_err(|e| ApiError::new(format!("Invalid request path {path}: {e}")))?;
        append_query(&mut url, query);
        Ok(url)
    }

    /// Issue one call and decode the reply.
    ///
    /// JSON bodies are sent with `Content-Type: application/json`; multipart
    /// bodies bring their own boundary header. `GET` never carries a body.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport failure or a non-2xx status.
    pub async fn send(
        &self,
        method: Method,
        url: Url,
        body: RequestBody,
        headers: &HeaderMap,
    ) -> Result<JsonValue, ApiError> {
        tracing::debug!(method = %method, url = %url, "Enfyra API request");

        let is_get = method == Method::GET;
        let mut request = self.http.request(method, url);

        match body {
            RequestBody::Multipart(form) if !is_get => {
                request = request.headers(headers.clone()).multipart(form);
            }
            RequestBody::Json(json) if !is_get => {
                request = request.header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                request = request.headers(headers.clone()).json(&json);
            }
            _ => {
                request = request.header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                request = request.headers(headers.clone());
            }
        }

        read_api_response(request.send().await?).await
    }
}

pub(crate) fn append_query(url: &mut Url, query: &Query) {
    let pairs = query_pairs(query);
    if pairs.is_empty() {
        return;
    }
    url.query_pairs_mut().extend_pairs(pairs);
}

/// Decode a reply: JSON when the content type says so, text otherwise.
/// Non-2xx replies become [`ApiError`] carrying the decoded body.
pub(crate) async fn read_api_response(response: Response) -> Result<JsonValue, ApiError> {
    let status = response.status();
    let url = response.url().to_string();
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));

    if !status.is_success() {
        let body = response.bytes().await.ok();
        let data = body.and_then(|b| serde_json::from_slice(&b).ok());
        return Err(ApiError::from_response(&url, status, data));
    }

    if is_json {
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::new(format!("Invalid JSON from {url}: {e}")))
    } else {
        Ok(JsonValue::String(response.text().await?))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::Router;
    use axum::http::{StatusCode, Uri};
    use axum::response::IntoResponse;
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    async fn echo(method: axum::http::Method, uri: Uri, headers: axum::http::HeaderMap, body: String) -> axum::response::Response {
        match uri.path() {
            "/text" => "plain body".into_response(),
            "/missing" => (StatusCode::NOT_FOUND, axum::Json(json!({"message": "No such route"}))).into_response(),
            "/broken" => (StatusCode::BAD_GATEWAY, "upstream down").into_response(),
            _ => axum::Json(json!({
                "method": method.as_str(),
                "uri": uri.to_string(),
                "contentType": headers.get("content-type").and_then(|v| v.to_str().ok()),
                "custom": headers.get("x-custom").and_then(|v| v.to_str().ok()),
                "body": body,
            }))
            .into_response(),
        }
    }

    async fn spawn_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, Router::new().fallback(echo)).await;
        });
        addr
    }

    #[test]
    fn test_url_for_joins_onto_origin_root() {
        let client = ApiClient::new("http://app.local/ignored/").unwrap();
        let query: Query = [("limit".into(), json!(5)), ("skip".into(), json!(null))].into();

        let url = client.url_for("enfyra/api/users", &query).unwrap();
        assert_eq!(url.as_str(), "http://app.local/enfyra/api/users?limit=5");

        let url = client.url_for("/enfyra/api/me", &Query::new()).unwrap();
        assert_eq!(url.as_str(), "http://app.local/enfyra/api/me");
    }

    #[test]
    fn test_rejects_relative_origin() {
        assert!(ApiClient::new("/just/a/path").is_err());
    }

    #[tokio::test]
    async fn test_send_json_body_and_headers() {
        let addr = spawn_server().await;
        let client = ApiClient::new(&format!("http://{addr}")).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-custom", HeaderValue::from_static("yes"));

        let url = client.url_for("/posts", &Query::new()).unwrap();
        let echo = client
            .send(Method::POST, url, RequestBody::Json(json!({"title": "x"})), &headers)
            .await
            .unwrap();

        assert_eq!(echo["method"], "POST");
        assert_eq!(echo["contentType"], "application/json");
        assert_eq!(echo["custom"], "yes");
        assert_eq!(echo["body"], r#"{"title":"x"}"#);
    }

    #[tokio::test]
    async fn test_get_drops_body() {
        let addr = spawn_server().await;
        let client = ApiClient::new(&format!("http://{addr}")).unwrap();

        let url = client.url_for("/posts", &Query::new()).unwrap();
        let echo = client
            .send(Method::GET, url, RequestBody::Json(json!({"a": 1})), &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(echo["body"], "");
    }

    #[tokio::test]
    async fn test_multipart_upload() {
        let addr = spawn_server().await;
        let client = ApiClient::new(&format!("http://{addr}")).unwrap();
        let form = Form::new().text("folder", "avatars");

        let url = client.url_for("/files", &Query::new()).unwrap();
        let echo = client
            .send(Method::POST, url, RequestBody::Multipart(form), &HeaderMap::new())
            .await
            .unwrap();

        assert!(echo["contentType"].as_str().unwrap().starts_with("multipart/form-data"));
        assert!(echo["body"].as_str().unwrap().contains("avatars"));
    }

    #[tokio::test]
    async fn test_text_and_error_replies() {
        let addr = spawn_server().await;
        let client = ApiClient::new(&format!("http://{addr}")).unwrap();
        let none = HeaderMap::new();

        let text = client
            .send(Method::GET, client.url_for("/text", &Query::new()).unwrap(), RequestBody::Empty, &none)
            .await
            .unwrap();
        assert_eq!(text, json!("plain body"));

        let err = client
            .send(Method::GET, client.url_for("/missing", &Query::new()).unwrap(), RequestBody::Empty, &none)
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(404));
        assert_eq!(err.message, "No such route");

        let err = client
            .send(Method::GET, client.url_for("/broken", &Query::new()).unwrap(), RequestBody::Empty, &none)
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(502));
        assert_eq!(err.message, "Bad Gateway");
    }
}
