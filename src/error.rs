#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{operation} failed{}: {detail}", .status.map(|s| format!(" with status {s}")).unwrap_or_default())]
    Backend {
        operation: &'static str,
        status: Option<u16>,
        detail: String,
    },
    #[error("{operation} returned an invalid response: {detail}")]
    InvalidResponse {
        operation: &'static str,
        detail: String,
    },
    #[error("Session cookie write failed: {0}")]
    CookieWrite(String),
}
