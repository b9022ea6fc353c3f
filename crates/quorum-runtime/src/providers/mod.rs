//! Concrete model providers.
//!
//! Providers implement [`ModelClient`](crate::producers::ModelClient) over
//! a remote API and translate every transport outcome into a classified
//! [`CallError`](quorum_core::CallError).

use thiserror::Error;

pub mod http;
pub mod secrets;

#[cfg(feature = "openrouter")]
pub mod openrouter;

pub use secrets::{ApiKey, KeyOrigin};

#[cfg(feature = "openrouter")]
pub use openrouter::{OpenRouterClient, OPENROUTER_API_KEY_ENV};

/// Errors raised while constructing a provider.
///
/// Call-time failures are reported as `CallError` instead.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid provider configuration: {0}")]
    InvalidConfig(String),

    #[error("HTTP client setup failed: {0}")]
    HttpClient(String),
}
