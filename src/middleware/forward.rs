use axum::body::{Body, Bytes};
use axum::http::HeaderMap;
use axum::http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use axum::http::request::Parts;
use axum::response::Response;
use futures::StreamExt;

use super::error::ProxyError;
use crate::url::join_url;

/// Headers never copied from the inbound request.
const REQUEST_EXCLUDED: [&str; 5] = ["host", "connection", "keep-alive", "content-length", "transfer-encoding"];

/// Map an inbound `path?query` onto the backend.
///
/// One leading occurrence of `api_prefix` is stripped; the rest is joined
/// onto `api_url` and the query string is carried over unchanged.
///
/// ```
/// use enfyra_sdk::middleware::build_upstream_url;
///
/// assert_eq!(
///     build_upstream_url("/enfyra/api/users?limit=5", "http://backend:1105/", "/enfyra/api"),
///     "http://backend:1105/users?limit=5"
/// );
/// ```
#[must_use]
pub fn build_upstream_url(path_and_query: &str, api_url: &str, api_prefix: &str) -> String {
    let rest = if api_prefix.is_empty() {
        path_and_query
    } else {
        path_and_query.strip_prefix(api_prefix).unwrap_or(path_and_query)
    };
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };

    let mut url = join_url([api_url, path]);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Read an inbound body, at most `limit` bytes.
///
/// An empty or unreadable body is `None`; a body over the limit is an error
/// and must not be forwarded.
pub(super) async fn read_body(body: Body, limit: usize) -> Result<Option<Bytes>, ProxyError> {
    let mut stream = body.into_data_stream();
    let mut buffer = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read request body, continuing without it");
                return Ok(None);
            }
        };
        if buffer.len() + chunk.len() > limit {
            return Err(ProxyError::PayloadTooLarge { limit });
        }
        buffer.extend_from_slice(&chunk);
    }

    Ok((!buffer.is_empty()).then(|| Bytes::from(buffer)))
}

/// Forward a request to `url` and rebuild the backend reply as a response.
///
/// `extra_headers` override inbound ones.
pub(super) async fn forward(
    http: &reqwest::Client,
    url: &str,
    parts: Parts,
    body: Option<Bytes>,
    extra_headers: HeaderMap,
) -> Result<Response, reqwest::Error> {
    let mut headers = parts.headers;
    for name in REQUEST_EXCLUDED {
        headers.remove(name);
    }
    for (name, value) in &extra_headers {
        headers.insert(name.clone(), value.clone());
    }

    let mut upstream = http.request(parts.method, url).headers(headers);
    if let Some(body) = body {
        upstream = upstream.body(body);
    }
    let upstream = upstream.send().await?;

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    // Framing is recomputed for the rebuilt body.
    for name in [TRANSFER_ENCODING, CONNECTION, CONTENT_LENGTH] {
        headers.remove(&name);
    }
    let bytes = upstream.bytes().await?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
