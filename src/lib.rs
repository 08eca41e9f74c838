#![doc = include_str!("../README.md")]

pub mod auth;
pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod middleware;
pub mod server;
pub mod session;
pub mod token;
pub mod types;
pub mod url;

// Re-exports for convenient access
pub use auth::{BackendClient, TokenPair};
pub use batch::{BatchOptions, BatchOutcome, BatchProgress, run_batch};
pub use client::{ApiCall, ApiClient, ApiError, ApiOptions, AuthSession, AuthStore, ExecuteOptions};
pub use config::{ConfigResolver, SdkConfig};
pub use error::Error;
pub use middleware::{ProxyConfig, apply_proxy};
pub use server::{FetchOptions, ServerApi};
pub use session::{CookieSource, CookieStore, MemoryCookieStore, SessionCookieOptions};
pub use token::{TokenValidation, validate_tokens, validate_tokens_from_store};
pub use types::{LoginPayload, RecordId, User};
