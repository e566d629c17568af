//! Transport abstraction for the dealer API client
//!
//! Defines the `Transport` trait: perform exactly one HTTP exchange for a
//! fully prepared request and hand back status, headers and body, or a
//! transport-level failure. Everything above this layer (credential
//! attachment, refresh, retry) talks to the network only through this trait,
//! so tests can substitute a scripted implementation.

pub mod reqwest_transport;

pub use reqwest_transport::ReqwestTransport;

pub use bytes::Bytes;
pub use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
pub use reqwest::{Method, StatusCode};
pub use tokio_util::sync::CancellationToken;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// A fully prepared request: absolute URL, final headers (including
/// `Authorization`), body, per-call timeout and optional cancellation.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Duration,
    pub cancel: Option<CancellationToken>,
}

impl TransportRequest {
    pub fn new(method: Method, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            timeout,
            cancel: None,
        }
    }

    /// Value of the `Authorization` header, if any (used by test doubles and logging).
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

/// A completed HTTP exchange. Any status code is a completion; only
/// failures to complete the exchange are `TransportError`s.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// Failures to complete a single exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// One HTTP exchange per call, no retries, no state.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    /// Identifier for logging (e.g. "reqwest", "scripted")
    fn id(&self) -> &str;

    /// Perform the exchange. Must honour `request.timeout` and resolve with
    /// `TransportError::Cancelled` as soon as `request.cancel` fires.
    fn execute(
        &self,
        request: TransportRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransportResponse>> + Send + '_>>;
}
