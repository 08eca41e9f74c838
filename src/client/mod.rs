//! Caller-side access to the SDK routes served by the proxy.
//!
//! [`ApiClient`] is the transport, [`ApiCall`] runs single or batched
//! calls, and [`AuthSession`] keeps an [`AuthStore`] in step with the
//! login state.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use enfyra_sdk::client::{ApiClient, AuthSession, AuthStore};
//! use enfyra_sdk::types::LoginPayload;
//!
//! # async fn run() -> Result<(), enfyra_sdk::client::ApiError> {
//! let client = ApiClient::new("http://localhost:3000")?;
//! let store = Arc::new(AuthStore::new());
//! let session = AuthSession::new(client, store.clone());
//!
//! session.login(&LoginPayload::new("admin@enfyra.io", "1234")).await?;
//! assert!(store.is_logged_in());
//! # Ok(())
//! # }
//! ```

mod api;
mod auth;
mod error;
mod transport;

pub use api::{ApiCall, ApiData, ApiOptions, ApiPath, ApiProgressCallback, ExecuteOptions};
pub use auth::{AuthSession, AuthStore};
pub use error::{ApiError, ErrorHandler, ResponseInfo};
pub use transport::{ApiClient, RequestBody};

pub(crate) use transport::{append_query, read_api_response};
