use std::sync::Arc;

use super::config::{ProxyConfig, ProxySettings};
use crate::auth::BackendClient;
use crate::config::SdkConfig;

/// Shared state for the proxy middleware.
#[derive(Clone)]
pub(super) struct ProxyState {
    pub(super) sdk: Arc<SdkConfig>,
    pub(super) settings: ProxySettings,
    pub(super) backend: BackendClient,
    pub(super) http: reqwest::Client,
}

impl ProxyState {
    pub(super) fn new(config: ProxyConfig) -> Self {
        let http = config.http.unwrap_or_else(default_http_client);
        let backend = BackendClient::new(config.sdk.api_url()).with_http_client(http.clone());
        Self {
            sdk: Arc::new(config.sdk),
            settings: config.settings,
            backend,
            http,
        }
    }
}

fn default_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to build proxy HTTP client, using defaults");
            reqwest::Client::new()
        })
}
